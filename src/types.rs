use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, KnitError>`
/// instead of panicking.  The FFI layer translates these into integer
/// result codes + a diagnostic line on stderr.
#[derive(Debug)]
pub enum KnitError {
    /// An index-based setter or getter was called outside the allocated
    /// cardinality.
    IndexOutOfRange { what: &'static str, index: usize, len: usize },
    /// A node references an edge index outside the allocated edge count.
    EdgeOutOfRange { node: usize, edge: usize, num_edges: usize },
    /// An alias defines a variable with negative terms but no positive
    /// ones (`x_i = −Σ x_k` has no feasible positive value).
    AliasInvalid { index: usize },
    /// After resolution, an alias still references another aliased
    /// variable — the blue/green separation the reducer relies on does
    /// not hold for this graph.
    AliasConflict { index: usize, referenced: usize },
    /// Alias definitions form a cycle and cannot be resolved.
    AliasCycle { index: usize },
    /// The underlying optimizer reported an error.
    Solver(String),
}

impl fmt::Display for KnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { what, index, len } =>
                write!(f, "{what} index {index} out of range (len {len})"),
            Self::EdgeOutOfRange { node, edge, num_edges } =>
                write!(f, "node {node} references edge {edge} (only {num_edges} edges)"),
            Self::AliasInvalid { index } =>
                write!(f, "alias for variable {index} has negative terms but no positive ones"),
            Self::AliasConflict { index, referenced } =>
                write!(f, "alias for variable {index} references aliased variable {referenced}"),
            Self::AliasCycle { index } =>
                write!(f, "alias definitions form a cycle through variable {index}"),
            Self::Solver(msg) => write!(f, "solver error: {msg}"),
        }
    }
}

impl std::error::Error for KnitError {}

impl From<argmin::core::Error> for KnitError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Solve status  (integer result codes for the host runtime)
// ─────────────────────────────────────────────────────────────

/// Termination status of a solve, mapped to the integer codes the host
/// runtime expects: positive = success, negative = optimizer failure.
/// `Aborted` (0) is reserved for solves that died with an exception-like
/// error before the optimizer could report a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Aborted,
    Success,
    StopvalReached,
    FtolReached,
    XtolReached,
    MaxEvalReached,
    MaxTimeReached,
    Failure,
    InvalidArgs,
    OutOfMemory,
    RoundoffLimited,
    ForcedStop,
}

impl SolveStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Aborted => 0,
            Self::Success => 1,
            Self::StopvalReached => 2,
            Self::FtolReached => 3,
            Self::XtolReached => 4,
            Self::MaxEvalReached => 5,
            Self::MaxTimeReached => 6,
            Self::Failure => -1,
            Self::InvalidArgs => -2,
            Self::OutOfMemory => -3,
            Self::RoundoffLimited => -4,
            Self::ForcedStop => -5,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() > 0
    }
}

// ─────────────────────────────────────────────────────────────
//  Algorithm selection
// ─────────────────────────────────────────────────────────────

/// Outer / local optimization algorithms.
///
/// The augmented-Lagrangian variants run a sequence of penalised smooth
/// subproblems solved by the configured local algorithm; the others
/// minimize the raw objective directly and ignore registered
/// constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    SteepestDescent,
    Lbfgs,
    Auglag,
    AuglagEq,
}

impl Algorithm {
    pub fn code(self) -> i32 {
        match self {
            Self::SteepestDescent => 0,
            Self::Lbfgs => 1,
            Self::Auglag => 2,
            Self::AuglagEq => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::SteepestDescent),
            1 => Some(Self::Lbfgs),
            2 => Some(Self::Auglag),
            3 => Some(Self::AuglagEq),
            _ => None,
        }
    }

    /// Augmented-Lagrangian variants wrap a local optimizer.
    pub fn is_auglag(self) -> bool {
        matches!(self, Self::Auglag | Self::AuglagEq)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SteepestDescent => "steepest-descent",
            Self::Lbfgs => "L-BFGS",
            Self::Auglag => "augmented-Lagrangian",
            Self::AuglagEq => "augmented-Lagrangian (eq)",
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Shared solver options
// ─────────────────────────────────────────────────────────────

/// Evaluation cap applied when `max_eval` is left at 0.
pub const DEFAULT_MAX_EVAL: usize = 1000;

/// Options shared by all three sampling solvers.  Per-variant defaults
/// differ only in `main_algo` and the fallback evaluation cap (see each
/// solver's constructor).
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub main_algo: Algorithm,
    pub local_algo: Algorithm,
    pub use_constraints: bool,
    pub main_ftol_rel: f64,
    pub local_ftol_rel: f64,
    /// 0 = fall back to the variant's default cap (the solve must
    /// terminate).
    pub max_eval: usize,
    /// Wall-clock budget in seconds; 0 = unlimited.
    pub max_time: f64,
    pub constraint_tol: f64,
    pub seed: u64,
    pub gaussian_start: bool,
    /// Sticky per-evaluation tracing; independent from the `verbose`
    /// argument of `solve`, which gates setup diagnostics.
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            main_algo: Algorithm::Auglag,
            local_algo: Algorithm::Lbfgs,
            use_constraints: true,
            main_ftol_rel: 0.0,
            local_ftol_rel: 1e-3,
            max_eval: DEFAULT_MAX_EVAL,
            max_time: 0.0,
            constraint_tol: 1e-1,
            seed: 0xDEAD_BEEF,
            gaussian_start: false,
            verbose: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Course-graph node
// ─────────────────────────────────────────────────────────────

/// A vertex of the course flow graph, grouping incoming and outgoing
/// edge indices.
///
/// Simple nodes carry a shaping ratio and exactly one input and one
/// output; interface nodes enforce Σin = Σout.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub index: usize,
    pub simple: bool,
    pub inp_edges: Vec<usize>,
    pub out_edges: Vec<usize>,
}

impl Node {
    pub fn has_interface_constraint(&self) -> bool {
        !self.inp_edges.is_empty() && !self.out_edges.is_empty() && !self.simple
    }

    pub fn has_range_constraint(&self) -> bool {
        self.simple
    }

    /// First input edge.  Only meaningful for simple nodes.
    pub fn inp(&self) -> usize {
        self.inp_edges[0]
    }

    /// First output edge.  Only meaningful for simple nodes.
    pub fn out(&self) -> usize {
        self.out_edges[0]
    }
}

// ─────────────────────────────────────────────────────────────
//  Constraint callback data  (tagged, no void pointers)
// ─────────────────────────────────────────────────────────────

/// Ratio-bound kinds for the course-interval solver.  `First*`/`Last*`
/// anchor against the fixed boundary values, `Next*` relate adjacent
/// positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    FirstMin,
    FirstMax,
    NextMin,
    NextMax,
    LastMin,
    LastMax,
}

/// What a registered constraint function operates on.  The solver that
/// registered the constraint dispatches on this tag when the optimizer
/// calls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackData {
    /// Interface equality Σin − Σout = 0 for the node at this index.
    InterfaceNode(usize),
    /// Upper shaping range x_in ≤ x_out · w for the node at this index.
    UpperRange(usize),
    /// Lower shaping range x_in ≥ x_out / w for the node at this index.
    LowerRange(usize),
    /// Alias lower-bound inequality for the alias at this variable index.
    Alias(usize),
    /// Ratio bound between sequence positions.
    SeqBound { index: usize, kind: BoundKind },
}
