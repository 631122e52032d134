//! Variable-aliasing reduction for the course-graph solver.
//!
//! Interface nodes force Σin = Σout; many of those equalities can be
//! eliminated outright by rewriting one incident variable as a signed
//! sum of the others (`x_i = Σ pos − Σ neg`).  The reducer scans the
//! node set once, produces an immutable [`Reduction`], and the solve
//! then runs in the surviving variables only.  `expand` /
//! `fold_gradient` are the two pure mappings between the spaces; the
//! gradient mapping is the exact transpose of the value mapping, which
//! is what makes the chain rule come out right.

use crate::types::{KnitError, Node};

// ─────────────────────────────────────────────────────────────
//  Aliasing level
// ─────────────────────────────────────────────────────────────

/// How aggressively interface nodes are rewritten into aliases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AliasingLevel {
    /// No aliases; the solve runs in the full variable space.
    #[default]
    None,
    /// Eliminate 1→1 pass-through nodes.
    Trivial,
    /// Additionally eliminate 1→n and n→1 fan nodes.
    Basic,
    /// Additionally eliminate n→m nodes, at the price of an explicit
    /// lower-bound inequality on the rewritten variable.
    Complex,
}

impl AliasingLevel {
    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Trivial => 1,
            Self::Basic => 2,
            Self::Complex => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Trivial),
            2 => Some(Self::Basic),
            3 => Some(Self::Complex),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Alias
// ─────────────────────────────────────────────────────────────

/// Rewrite of one variable as a signed sum of others:
/// `x_index = Σ_{j∈pos} x_j − Σ_{k∈neg} x_k`.
///
/// An empty alias means the variable survives into the reduced problem.
#[derive(Debug, Clone, Default)]
pub struct VarAlias {
    pub index: usize,
    pub pos: Vec<usize>,
    pub neg: Vec<usize>,
    pub min_bound: f64,
}

impl VarAlias {
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty() && self.neg.is_empty()
    }

    /// An alias made purely of negative terms can never take a positive
    /// value and is rejected by validation.
    pub fn is_valid(&self) -> bool {
        self.neg.is_empty() || !self.pos.is_empty()
    }

    /// Aliases with more than one negative term need an explicit
    /// inequality to keep the rewritten value above `min_bound`; a
    /// single negative term is already pinned by the interface equation
    /// of the node that produced the alias.
    pub fn needs_constraint(&self) -> bool {
        self.neg.len() > 1
    }
}

// ─────────────────────────────────────────────────────────────
//  Reduction product
// ─────────────────────────────────────────────────────────────

/// Immutable output of the aliasing pass: one [`VarAlias`] per edge
/// variable, the set of nodes whose interface constraint was consumed,
/// and the two index mappings between full and reduced space.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub level: AliasingLevel,
    pub aliases: Vec<VarAlias>,
    /// Nodes whose interface equality is absorbed by an alias; the
    /// driver must not register constraints for these.
    pub reduced_nodes: Vec<bool>,
    /// Full index → reduced index, `None` for aliased-away variables.
    pub alias_to_red: Vec<Option<usize>>,
    /// Reduced index → the surviving full index.
    pub red_to_alias: Vec<usize>,
}

impl Reduction {
    /// Run the aliasing pass over the node set.
    ///
    /// Alias targets that end up referencing other aliased variables
    /// are resolved by substituting their definitions; graphs for which
    /// that resolution cannot terminate (cyclic definitions) or that
    /// produce an invalid alias are rejected.
    pub fn compute(
        num_edges: usize,
        nodes: &[Node],
        level: AliasingLevel,
    ) -> Result<Self, KnitError> {
        let mut aliases: Vec<VarAlias> = (0..num_edges)
            .map(|i| VarAlias { index: i, ..VarAlias::default() })
            .collect();
        let mut reduced_nodes = vec![false; nodes.len()];

        if level > AliasingLevel::None {
            for node in nodes {
                if reduced_nodes[node.index] || !node.has_interface_constraint() {
                    continue;
                }

                let num_inp = node.inp_edges.len();
                let num_out = node.out_edges.len();

                let target;
                let pos;
                let mut neg = Vec::new();
                if num_inp == 1 && num_out == 1 {
                    // pass-through node, output mirrors input
                    target = node.out_edges[0];
                    pos = node.inp_edges.clone();
                } else if num_inp == 1 || num_out == 1 {
                    if level < AliasingLevel::Basic {
                        continue;
                    }
                    if num_inp == 1 {
                        // input is the sum of the outputs
                        target = node.inp_edges[0];
                        pos = node.out_edges.clone();
                    } else {
                        // output is the sum of the inputs
                        target = node.out_edges[0];
                        pos = node.inp_edges.clone();
                    }
                } else if level == AliasingLevel::Complex {
                    // n→m node: rewrite the first output against all
                    // inputs and the remaining outputs
                    target = node.out_edges[0];
                    pos = node.inp_edges.clone();
                    neg = node.out_edges[1..].to_vec();
                } else {
                    continue;
                }

                if !aliases[target].is_empty() {
                    // another node already rewrote this variable; keep
                    // this node's interface constraint explicit instead
                    continue;
                }
                aliases[target].pos = pos;
                aliases[target].neg = neg;
                reduced_nodes[node.index] = true;
            }

            resolve_chains(&mut aliases)?;
            validate(&aliases)?;
        }

        // Index mappings: surviving variables get consecutive reduced
        // indices in full-index order.
        let mut alias_to_red = Vec::with_capacity(num_edges);
        let mut red_to_alias = Vec::new();
        for alias in &aliases {
            if alias.is_empty() {
                alias_to_red.push(Some(red_to_alias.len()));
                red_to_alias.push(alias.index);
            } else {
                alias_to_red.push(None);
            }
        }

        Ok(Self { level, aliases, reduced_nodes, alias_to_red, red_to_alias })
    }

    /// Number of variables surviving into the reduced problem.
    pub fn reduced_len(&self) -> usize {
        self.red_to_alias.len()
    }

    pub fn is_active(&self) -> bool {
        self.level > AliasingLevel::None
    }

    #[inline]
    fn red(&self, i: usize) -> usize {
        // construction guarantees every index referenced here survived
        self.alias_to_red[i].expect("referenced variable is unaliased")
    }

    /// Gather: reconstruct the full variable vector from the reduced one.
    pub fn expand(&self, r: &[f64], x: &mut [f64]) {
        for (i, alias) in self.aliases.iter().enumerate() {
            if alias.is_empty() {
                x[i] = r[self.red(i)];
            } else {
                let mut val = 0.0;
                for &j in &alias.pos {
                    val += r[self.red(j)];
                }
                for &k in &alias.neg {
                    val -= r[self.red(k)];
                }
                x[i] = val;
            }
        }
    }

    /// Scatter: map a full-space gradient into reduced space.
    ///
    /// This is the exact transpose of [`expand`](Self::expand), i.e. the
    /// chain rule `∂E/∂r = Jᵀ ∂E/∂x` for the linear map `x = J r`.
    pub fn fold_gradient(&self, g: &[f64], rg: &mut [f64]) {
        rg.fill(0.0);
        for (i, alias) in self.aliases.iter().enumerate() {
            if alias.is_empty() {
                rg[self.red(i)] += g[i];
            } else {
                for &j in &alias.pos {
                    rg[self.red(j)] += g[i];
                }
                for &k in &alias.neg {
                    rg[self.red(k)] -= g[i];
                }
            }
        }
    }

    /// Direct copy of the surviving entries, used to seed the reduced
    /// initial point.  Not a gather: aliased entries are simply dropped.
    pub fn restrict(&self, x: &[f64], r: &mut [f64]) {
        for (j, &full) in self.red_to_alias.iter().enumerate() {
            r[j] = x[full];
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Chain resolution & validation
// ─────────────────────────────────────────────────────────────

/// Substitute alias definitions into aliases that reference them until
/// every referenced index is unaliased.  A straight 1→1→1 chain
/// collapses to a single surviving variable this way.
fn resolve_chains(aliases: &mut [VarAlias]) -> Result<(), KnitError> {
    let n = aliases.len();
    // each pass shortens every unresolved chain by one hop, so n passes
    // suffice for any acyclic definition set
    for _ in 0..n {
        let mut changed = false;
        for i in 0..n {
            if aliases[i].is_empty() {
                continue;
            }
            let unresolved = aliases[i]
                .pos
                .iter()
                .chain(aliases[i].neg.iter())
                .any(|&j| !aliases[j].is_empty());
            if !unresolved {
                continue;
            }

            let mut pos = Vec::with_capacity(aliases[i].pos.len());
            let mut neg = Vec::with_capacity(aliases[i].neg.len());
            for &j in &aliases[i].pos {
                if j == i {
                    return Err(KnitError::AliasCycle { index: i });
                }
                if aliases[j].is_empty() {
                    pos.push(j);
                } else {
                    pos.extend_from_slice(&aliases[j].pos);
                    neg.extend_from_slice(&aliases[j].neg);
                }
            }
            for &k in &aliases[i].neg {
                if k == i {
                    return Err(KnitError::AliasCycle { index: i });
                }
                if aliases[k].is_empty() {
                    neg.push(k);
                } else {
                    neg.extend_from_slice(&aliases[k].pos);
                    pos.extend_from_slice(&aliases[k].neg);
                }
            }
            if pos.contains(&i) || neg.contains(&i) {
                return Err(KnitError::AliasCycle { index: i });
            }
            aliases[i].pos = pos;
            aliases[i].neg = neg;
            changed = true;
        }
        if !changed {
            break;
        }
    }
    // anything still unresolved after n passes must be cyclic
    match aliases.iter().position(|a| {
        !a.is_empty() && a.pos.iter().chain(a.neg.iter()).any(|&j| !aliases[j].is_empty())
    }) {
        Some(index) => Err(KnitError::AliasCycle { index }),
        None => Ok(()),
    }
}

/// Reject alias sets that would make the reduced gradients wrong:
/// purely-negative definitions and leftover alias-to-alias references.
fn validate(aliases: &[VarAlias]) -> Result<(), KnitError> {
    for alias in aliases {
        if !alias.is_valid() {
            return Err(KnitError::AliasInvalid { index: alias.index });
        }
        for &j in alias.pos.iter().chain(alias.neg.iter()) {
            if !aliases[j].is_empty() {
                return Err(KnitError::AliasConflict { index: alias.index, referenced: j });
            }
        }
    }
    Ok(())
}
