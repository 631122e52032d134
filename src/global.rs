//! Course-graph solver.
//!
//! Assigns a stitch count to every edge of the course flow graph,
//! pulling each edge toward its course target while penalising
//! input/output imbalance on simple (shaping) nodes.  Interface nodes
//! are handled as equality constraints — or eliminated outright by the
//! aliasing reduction, in which case the solve runs in the reduced
//! variable space and gradients are mapped back through the transpose
//! of the alias expansion.

use crate::gradcheck::gradient_error;
use crate::optimizer::{
    self, ConstraintKind, ConstraintSpec, OptimizerConfig, SamplingProblem,
};
use crate::reduction::{AliasingLevel, Reduction};
use crate::types::{
    Algorithm, CallbackData, KnitError, Node, SolveStatus, SolverOptions, DEFAULT_MAX_EVAL,
};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::cell::RefCell;

#[inline]
fn squared(x: f64) -> f64 {
    x * x
}

// ─────────────────────────────────────────────────────────────
//  Solver state
// ─────────────────────────────────────────────────────────────

/// One course-graph sampling problem: inputs, options, cached
/// reduction, and the solution buffers read back by the host.
#[derive(Debug)]
pub struct GlobalSolver {
    // inputs
    course: Vec<f64>,
    shaping: Vec<f64>,
    inv_shaping: Vec<f64>,
    nodes: Vec<Node>,
    w_c: f64,
    w_s: f64,
    aliasing_level: AliasingLevel,
    global_shaping: bool,
    pub options: SolverOptions,
    // aliasing cache; `None` = stale, recomputed lazily by `solve`
    reduction: Option<Reduction>,
    // outputs
    vars: Vec<f64>,
    objval: f64,
}

impl Default for GlobalSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSolver {
    pub fn new() -> Self {
        Self {
            course: Vec::new(),
            shaping: Vec::new(),
            inv_shaping: Vec::new(),
            nodes: Vec::new(),
            w_c: 1.0,
            w_s: 0.1,
            aliasing_level: AliasingLevel::None,
            global_shaping: false,
            options: SolverOptions { main_algo: Algorithm::AuglagEq, ..SolverOptions::default() },
            reduction: None,
            vars: Vec::new(),
            objval: 0.0,
        }
    }

    // ── lifecycle ──────────────────────────────────────────

    pub fn reset(&mut self) {
        self.course.clear();
        self.shaping.clear();
        self.inv_shaping.clear();
        self.nodes.clear();
        self.reduction = None;
        self.vars.clear();
        self.objval = 0.0;
    }

    pub fn allocate(&mut self, num_edges: usize, num_nodes: usize) {
        self.reset();
        self.course = vec![0.0; num_edges];
        self.vars = vec![0.0; num_edges];
        self.shaping = vec![0.0; num_nodes];
        self.inv_shaping = vec![0.0; num_nodes];
        self.nodes = (0..num_nodes).map(|i| Node { index: i, ..Node::default() }).collect();
    }

    // ── input setters ──────────────────────────────────────

    pub fn set_course(&mut self, index: usize, value: f64) -> Result<(), KnitError> {
        let len = self.course.len();
        *self
            .course
            .get_mut(index)
            .ok_or(KnitError::IndexOutOfRange { what: "edge", index, len })? = value;
        Ok(())
    }

    /// Stores the shaping ratio and its reciprocal for the node.
    pub fn set_shaping(&mut self, index: usize, w: f64) -> Result<(), KnitError> {
        let len = self.shaping.len();
        if index >= len {
            return Err(KnitError::IndexOutOfRange { what: "node", index, len });
        }
        self.shaping[index] = w;
        self.inv_shaping[index] = 1.0 / w;
        Ok(())
    }

    pub fn allocate_node(
        &mut self,
        index: usize,
        simple: bool,
        num_inputs: usize,
        num_outputs: usize,
    ) -> Result<(), KnitError> {
        let len = self.nodes.len();
        let node = self
            .nodes
            .get_mut(index)
            .ok_or(KnitError::IndexOutOfRange { what: "node", index, len })?;
        node.index = index;
        node.simple = simple;
        node.inp_edges = vec![0; num_inputs];
        node.out_edges = vec![0; num_outputs];
        self.reduction = None;
        Ok(())
    }

    pub fn set_node_input(
        &mut self,
        node_index: usize,
        slot: usize,
        edge_index: usize,
    ) -> Result<(), KnitError> {
        let num_edges = self.course.len();
        if edge_index >= num_edges {
            return Err(KnitError::EdgeOutOfRange { node: node_index, edge: edge_index, num_edges });
        }
        let len = self.nodes.len();
        let node = self
            .nodes
            .get_mut(node_index)
            .ok_or(KnitError::IndexOutOfRange { what: "node", index: node_index, len })?;
        let slots = node.inp_edges.len();
        *node
            .inp_edges
            .get_mut(slot)
            .ok_or(KnitError::IndexOutOfRange { what: "input slot", index: slot, len: slots })? =
            edge_index;
        self.reduction = None;
        Ok(())
    }

    pub fn set_node_output(
        &mut self,
        node_index: usize,
        slot: usize,
        edge_index: usize,
    ) -> Result<(), KnitError> {
        let num_edges = self.course.len();
        if edge_index >= num_edges {
            return Err(KnitError::EdgeOutOfRange { node: node_index, edge: edge_index, num_edges });
        }
        let len = self.nodes.len();
        let node = self
            .nodes
            .get_mut(node_index)
            .ok_or(KnitError::IndexOutOfRange { what: "node", index: node_index, len })?;
        let slots = node.out_edges.len();
        *node
            .out_edges
            .get_mut(slot)
            .ok_or(KnitError::IndexOutOfRange { what: "output slot", index: slot, len: slots })? =
            edge_index;
        self.reduction = None;
        Ok(())
    }

    pub fn set_weights(&mut self, w_c: f64, w_s: f64) {
        self.w_c = w_c;
        self.w_s = w_s;
    }

    pub fn set_aliasing_level(&mut self, level: AliasingLevel) {
        self.aliasing_level = level;
        self.reduction = None;
    }

    pub fn set_global_shaping(&mut self, enabled: bool) {
        self.global_shaping = enabled;
    }

    // ── output readers ─────────────────────────────────────

    pub fn variable_number(&self) -> usize {
        self.vars.len()
    }

    pub fn variable_value(&self, index: usize) -> Result<f64, KnitError> {
        self.vars
            .get(index)
            .copied()
            .ok_or(KnitError::IndexOutOfRange { what: "edge", index, len: self.vars.len() })
    }

    pub fn variables(&self) -> &[f64] {
        &self.vars
    }

    pub fn objective_value(&self) -> f64 {
        self.objval
    }

    // ── objective + gradient ───────────────────────────────

    /// Full-space objective `E = w_c·Ec + w_s·Es`, accumulating the
    /// gradient into a caller-zeroed buffer when present.
    pub fn objective(&self, x: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        let mut ec = 0.0;
        let mut es = 0.0;

        // course accuracy
        for (i, &c) in self.course.iter().enumerate() {
            let diff = x[i] - c;
            ec += squared(diff);
            if let Some(g) = grad.as_deref_mut() {
                g[i] += self.w_c * 2.0 * diff;
            }
        }

        // shaping imbalance on simple nodes with both sides present
        for node in &self.nodes {
            if !node.simple || node.inp_edges.is_empty() || node.out_edges.is_empty() {
                continue;
            }
            let inp: f64 = node.inp_edges.iter().map(|&j| x[j]).sum();
            let out: f64 = node.out_edges.iter().map(|&k| x[k]).sum();
            let diff = inp - out;
            es += squared(diff);
            if let Some(g) = grad.as_deref_mut() {
                let s = self.w_s * 2.0 * diff;
                for &j in &node.inp_edges {
                    g[j] += s;
                }
                for &k in &node.out_edges {
                    g[k] -= s;
                }
            }
        }

        ec * self.w_c + es * self.w_s
    }

    // ── constraint kernels (full space) ────────────────────

    /// Full-space constraint value for the given tag, overwriting only
    /// the touched gradient entries.
    ///
    /// Alias inequalities live in reduced space and are dispatched by
    /// the reduced wrapper instead.
    pub fn constraint(&self, data: &CallbackData, x: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        match *data {
            CallbackData::InterfaceNode(i) => {
                let node = &self.nodes[i];
                let mut value = 0.0;
                for &j in &node.inp_edges {
                    value += x[j];
                    if let Some(g) = grad.as_deref_mut() {
                        g[j] = 1.0;
                    }
                }
                for &k in &node.out_edges {
                    value -= x[k];
                    if let Some(g) = grad.as_deref_mut() {
                        g[k] = -1.0;
                    }
                }
                value
            }
            CallbackData::UpperRange(i) => {
                // x_in ≤ x_out · w  ⟺  x_in − x_out·w ≤ 0
                let node = &self.nodes[i];
                let (inp, out) = (node.inp(), node.out());
                if let Some(g) = grad.as_deref_mut() {
                    g[inp] = 1.0;
                    g[out] = -self.shaping[i];
                }
                x[inp] - x[out] * self.shaping[i]
            }
            CallbackData::LowerRange(i) => {
                // x_in ≥ x_out / w  ⟺  x_out·iw − x_in ≤ 0
                let node = &self.nodes[i];
                let (inp, out) = (node.inp(), node.out());
                if let Some(g) = grad.as_deref_mut() {
                    g[inp] = -1.0;
                    g[out] = self.inv_shaping[i];
                }
                x[out] * self.inv_shaping[i] - x[inp]
            }
            // reduced-space / sequence tags never reach the full kernels
            CallbackData::Alias(_) | CallbackData::SeqBound { .. } => 0.0,
        }
    }

    fn range_node_usable(&self, node: &Node) -> bool {
        node.has_range_constraint() && !node.inp_edges.is_empty() && !node.out_edges.is_empty()
    }

    // ── constraint error reporters ─────────────────────────

    pub fn num_constraints(&self) -> usize {
        let mut count = 0;
        for node in &self.nodes {
            if node.has_interface_constraint() {
                count += 1;
            } else if self.global_shaping && node.has_range_constraint() {
                count += 2; // upper and lower
            }
        }
        count
    }

    pub fn constraint_error(&self) -> f64 {
        let mut err = 0.0;
        for node in &self.nodes {
            if node.has_interface_constraint() {
                err += self
                    .constraint(&CallbackData::InterfaceNode(node.index), &self.vars, None)
                    .abs();
            } else if self.global_shaping && self.range_node_usable(node) {
                err += self
                    .constraint(&CallbackData::UpperRange(node.index), &self.vars, None)
                    .abs()
                    + self
                        .constraint(&CallbackData::LowerRange(node.index), &self.vars, None)
                        .abs();
            }
        }
        err
    }

    pub fn constraint_max_error(&self) -> f64 {
        let mut max_err = 0.0_f64;
        for node in &self.nodes {
            if node.has_interface_constraint() {
                max_err = max_err.max(
                    self.constraint(&CallbackData::InterfaceNode(node.index), &self.vars, None)
                        .abs(),
                );
            } else if self.global_shaping && self.range_node_usable(node) {
                max_err = max_err.max(
                    self.constraint(&CallbackData::UpperRange(node.index), &self.vars, None)
                        .abs(),
                );
                max_err = max_err.max(
                    self.constraint(&CallbackData::LowerRange(node.index), &self.vars, None)
                        .abs(),
                );
            }
        }
        max_err
    }

    pub fn constraint_mean_error(&self) -> f64 {
        let nc = self.num_constraints();
        if nc == 0 {
            0.0
        } else {
            self.constraint_error() / nc as f64
        }
    }

    // ── gradient checking ──────────────────────────────────

    fn gradient_error_at_both(
        &self,
        f: &dyn Fn(&[f64], Option<&mut [f64]>) -> f64,
        eps: f64,
    ) -> f64 {
        gradient_error(f, &self.course, eps, true).max(gradient_error(f, &self.vars, eps, true))
    }

    /// Worst relative finite-difference error over the objective and
    /// every active constraint, at both the course targets and the
    /// current variables.  Diagnostic only.
    pub fn check_gradient(&self, print: bool, eps: f64) -> f64 {
        let mut max_err =
            self.gradient_error_at_both(&|x, grad| self.objective(x, grad), eps);

        for node in &self.nodes {
            if node.has_interface_constraint() {
                let data = CallbackData::InterfaceNode(node.index);
                max_err = max_err
                    .max(self.gradient_error_at_both(&|x, g| self.constraint(&data, x, g), eps));
            } else if self.global_shaping && self.range_node_usable(node) {
                let upper = CallbackData::UpperRange(node.index);
                let lower = CallbackData::LowerRange(node.index);
                max_err = max_err
                    .max(self.gradient_error_at_both(&|x, g| self.constraint(&upper, x, g), eps));
                max_err = max_err
                    .max(self.gradient_error_at_both(&|x, g| self.constraint(&lower, x, g), eps));
            }
        }

        if print {
            eprintln!("Gradient max relative error: {max_err:e} for step {eps:e}");
        }
        max_err
    }

    // ── solve driver ───────────────────────────────────────

    /// Run the optimization.  `verbose` gates setup diagnostics; the
    /// sticky `options.verbose` flag gates per-evaluation traces.
    pub fn solve(&mut self, verbose: bool) -> Result<SolveStatus, KnitError> {
        let num_edges = self.course.len();
        let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed);

        // recompute the reduction if a setter invalidated it
        let mut red = match self.reduction.take() {
            Some(red) => red,
            None => Reduction::compute(num_edges, &self.nodes, self.aliasing_level)?,
        };
        if red.is_active() && verbose {
            eprintln!("Aliasing: from {} to {} variables", num_edges, red.reduced_len());
        }

        // scalar bounds from the course data alone; per-node shaping
        // ratios deliberately do not feed into the box
        let mut min_bound: f64 = 1e3;
        let mut max_bound: f64 = 2.0;
        for &c in &self.course {
            min_bound = min_bound.min((c * 0.5).floor());
            max_bound = max_bound.max((c * 2.0).ceil());
        }
        let min_bound = min_bound.max(2.0);
        if verbose {
            eprintln!("Using algorithm: {}", self.options.main_algo.name());
            eprintln!("Using bounds: min={min_bound}, max={max_bound}");
        }

        // aliases that need an explicit inequality keep the rewritten
        // value above the variable lower bound
        for alias in &mut red.aliases {
            if alias.needs_constraint() {
                alias.min_bound = min_bound;
            }
        }

        // register constraints; reduced nodes are already encoded in
        // the aliasing and must not be constrained again
        let mut constraints = Vec::new();
        if self.options.use_constraints {
            for node in &self.nodes {
                if node.has_interface_constraint() && !red.reduced_nodes[node.index] {
                    constraints.push(ConstraintSpec {
                        kind: ConstraintKind::Equality,
                        data: CallbackData::InterfaceNode(node.index),
                    });
                    if verbose {
                        eprintln!(
                            "Constraint on node #{} (#inp={}, #out={})",
                            node.index,
                            node.inp_edges.len(),
                            node.out_edges.len()
                        );
                    }
                }
            }
            for alias in &red.aliases {
                if alias.needs_constraint() {
                    constraints.push(ConstraintSpec {
                        kind: ConstraintKind::Inequality,
                        data: CallbackData::Alias(alias.index),
                    });
                    if verbose {
                        eprintln!(
                            "Constraint on alias #{} (#pos={}, #neg={}) > {}",
                            alias.index,
                            alias.pos.len(),
                            alias.neg.len(),
                            min_bound
                        );
                    }
                }
            }
        }
        if self.global_shaping {
            for node in &self.nodes {
                if self.range_node_usable(node) {
                    constraints.push(ConstraintSpec {
                        kind: ConstraintKind::Inequality,
                        data: CallbackData::UpperRange(node.index),
                    });
                    constraints.push(ConstraintSpec {
                        kind: ConstraintKind::Inequality,
                        data: CallbackData::LowerRange(node.index),
                    });
                    if verbose {
                        eprintln!(
                            "Range constraints on node #{} (w={}, iw={})",
                            node.index, self.shaping[node.index], self.inv_shaping[node.index]
                        );
                    }
                }
            }
        }

        // initial point: course data, optionally perturbed
        self.vars.copy_from_slice(&self.course);
        if self.options.gaussian_start {
            for v in self.vars.iter_mut() {
                let noise: f64 = rng.sample(StandardNormal);
                *v = (*v + noise).max(min_bound).min(max_bound);
            }
        }

        let max_eval =
            if self.options.max_eval > 0 { self.options.max_eval } else { DEFAULT_MAX_EVAL };
        let config = OptimizerConfig {
            algorithm: self.options.main_algo,
            local_algorithm: self.options.local_algo,
            ftol_rel: self.options.main_ftol_rel,
            local_ftol_rel: self.options.local_ftol_rel,
            max_eval,
            max_time: self.options.max_time,
            constraint_tol: self.options.constraint_tol,
            trace: self.options.verbose,
            verbose,
        };

        let outcome = if red.is_active() {
            let mut x = vec![0.0; red.reduced_len()];
            red.restrict(&self.vars, &mut x);
            let lower = vec![min_bound; x.len()];
            let upper = vec![max_bound; x.len()];
            let outcome = {
                let problem = ReducedCourseProblem {
                    solver: self,
                    red: &red,
                    xbuf: RefCell::new(vec![0.0; num_edges]),
                    gbuf: RefCell::new(vec![0.0; num_edges]),
                };
                optimizer::minimize(&problem, &constraints, &lower, &upper, &config, &mut x)?
            };
            red.expand(&x, &mut self.vars);
            outcome
        } else {
            let mut x = self.vars.clone();
            let lower = vec![min_bound; x.len()];
            let upper = vec![max_bound; x.len()];
            let outcome = {
                let problem = CourseProblem { solver: self };
                optimizer::minimize(&problem, &constraints, &lower, &upper, &config, &mut x)?
            };
            self.vars.copy_from_slice(&x);
            outcome
        };

        if verbose {
            eprintln!("Solved after {} iterations", outcome.iterations);
        }

        self.objval = outcome.objval;
        self.reduction = Some(red);
        Ok(outcome.status)
    }
}

// ─────────────────────────────────────────────────────────────
//  Optimizer problem wrappers
// ─────────────────────────────────────────────────────────────

/// Full-space problem: straight delegation to the solver kernels.
struct CourseProblem<'a> {
    solver: &'a GlobalSolver,
}

impl<'a> SamplingProblem for CourseProblem<'a> {
    fn objective(&self, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
        self.solver.objective(x, grad)
    }

    fn constraint(&self, data: &CallbackData, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
        self.solver.constraint(data, x, grad)
    }
}

/// Reduced-space problem: expands the reduced iterate to full space,
/// evaluates the full kernels, and folds gradients back through the
/// transpose of the alias expansion.  Alias inequalities are evaluated
/// in reduced coordinates directly.
struct ReducedCourseProblem<'a> {
    solver: &'a GlobalSolver,
    red: &'a Reduction,
    xbuf: RefCell<Vec<f64>>,
    gbuf: RefCell<Vec<f64>>,
}

impl<'a> SamplingProblem for ReducedCourseProblem<'a> {
    fn objective(&self, r: &[f64], grad: Option<&mut [f64]>) -> f64 {
        let mut x = self.xbuf.borrow_mut();
        self.red.expand(r, &mut x);
        match grad {
            None => self.solver.objective(&x, None),
            Some(rg) => {
                let mut g = self.gbuf.borrow_mut();
                g.fill(0.0);
                let val = self.solver.objective(&x, Some(&mut g));
                self.red.fold_gradient(&g, rg);
                val
            }
        }
    }

    fn constraint(&self, data: &CallbackData, r: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        if let CallbackData::Alias(i) = *data {
            // min_bound ≤ Σ pos − Σ neg  ⟺  min_bound − Σ pos + Σ neg ≤ 0
            let alias = &self.red.aliases[i];
            let mut res = alias.min_bound;
            for &j in &alias.pos {
                let rj = self.red.alias_to_red[j].expect("alias references reduced variable");
                res -= r[rj];
                if let Some(g) = grad.as_deref_mut() {
                    g[rj] -= 1.0;
                }
            }
            for &k in &alias.neg {
                let rk = self.red.alias_to_red[k].expect("alias references reduced variable");
                res += r[rk];
                if let Some(g) = grad.as_deref_mut() {
                    g[rk] += 1.0;
                }
            }
            return res;
        }

        let mut x = self.xbuf.borrow_mut();
        self.red.expand(r, &mut x);
        match grad {
            None => self.solver.constraint(data, &x, None),
            Some(rg) => {
                let mut g = self.gbuf.borrow_mut();
                g.fill(0.0);
                let val = self.solver.constraint(data, &x, Some(&mut g));
                self.red.fold_gradient(&g, rg);
                val
            }
        }
    }
}
