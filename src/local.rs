//! Course-interval solver.
//!
//! Assigns a stitch count to every position of a linear course
//! sequence whose endpoints are pinned to known boundary counts.
//! Adjacent positions must stay within the shaping factor `F`
//! (`x_{i+1} ∈ [x_i/F, x_i·F]`); the boundary ratios are folded into
//! per-position variable bounds and only the adjacent (`Next*`) pairs
//! are registered as explicit inequality constraints.

use crate::gradcheck::gradient_error;
use crate::optimizer::{
    self, ConstraintKind, ConstraintSpec, OptimizerConfig, SamplingProblem,
};
use crate::types::{
    BoundKind, CallbackData, KnitError, SolveStatus, SolverOptions, DEFAULT_MAX_EVAL,
};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

#[inline]
fn squared(x: f64) -> f64 {
    x * x
}

/// Hard caps applied to the boundary-derived bound boxes.
const BOUND_FLOOR: f64 = 2.0;
const BOUND_CEIL: f64 = 1e4;

// ─────────────────────────────────────────────────────────────
//  Solver state
// ─────────────────────────────────────────────────────────────

/// One course-interval sampling problem.
#[derive(Debug)]
pub struct LocalSolver {
    // inputs
    course: Vec<f64>,
    ns_start: f64,
    ns_end: f64,
    /// Shaping factor, clamped into [1.01, 2.0] at set time.
    f_ratio: f64,
    inv_f: f64,
    w_c: f64,
    w_s: f64,
    pub options: SolverOptions,
    // outputs
    vars: Vec<f64>,
    objval: f64,
}

impl Default for LocalSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSolver {
    pub fn new() -> Self {
        Self {
            course: Vec::new(),
            ns_start: 0.0,
            ns_end: 0.0,
            f_ratio: 2.0,
            inv_f: 0.5,
            w_c: 1.0,
            w_s: 0.1,
            options: SolverOptions::default(),
            vars: Vec::new(),
            objval: 0.0,
        }
    }

    // ── lifecycle ──────────────────────────────────────────

    pub fn reset(&mut self) {
        self.course.clear();
        self.vars.clear();
        self.objval = 0.0;
    }

    pub fn allocate(&mut self, num_positions: usize) {
        self.reset();
        self.course = vec![0.0; num_positions];
        self.vars = vec![0.0; num_positions];
    }

    // ── input setters ──────────────────────────────────────

    pub fn set_course(&mut self, index: usize, value: f64) -> Result<(), KnitError> {
        let len = self.course.len();
        *self
            .course
            .get_mut(index)
            .ok_or(KnitError::IndexOutOfRange { what: "position", index, len })? = value;
        Ok(())
    }

    pub fn set_start(&mut self, value: f64) {
        self.ns_start = value;
    }

    pub fn set_end(&mut self, value: f64) {
        self.ns_end = value;
    }

    /// Set the shaping factor; values outside [1.01, 2.0] are clamped.
    pub fn set_shaping(&mut self, shaping: f64) {
        self.f_ratio = shaping.max(1.01).min(2.0);
        self.inv_f = 1.0 / self.f_ratio;
    }

    pub fn set_weights(&mut self, w_c: f64, w_s: f64) {
        self.w_c = w_c;
        self.w_s = w_s;
    }

    // ── output readers ─────────────────────────────────────

    pub fn variable_number(&self) -> usize {
        self.vars.len()
    }

    pub fn variable_value(&self, index: usize) -> Result<f64, KnitError> {
        self.vars
            .get(index)
            .copied()
            .ok_or(KnitError::IndexOutOfRange { what: "position", index, len: self.vars.len() })
    }

    pub fn variables(&self) -> &[f64] {
        &self.vars
    }

    pub fn objective_value(&self) -> f64 {
        self.objval
    }

    // ── objective + gradient ───────────────────────────────

    /// `E = w_c·Ec + w_s·Es` with the boundary counts acting as extra
    /// simplicity anchors on the first and last positions.  Accumulates
    /// the gradient into a caller-zeroed buffer when present.
    pub fn objective(&self, x: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        let n = x.len();
        if n == 0 {
            return 0.0;
        }
        let mut ec = 0.0;
        let mut es = 0.0;

        // fixed first value
        let diff0 = x[0] - self.ns_start;
        es += squared(diff0);
        if let Some(g) = grad.as_deref_mut() {
            g[0] += self.w_s * 2.0 * diff0;
        }

        for i in 0..n {
            // course accuracy
            let diff = x[i] - self.course[i];
            ec += squared(diff);
            if let Some(g) = grad.as_deref_mut() {
                g[i] += self.w_c * 2.0 * diff;
            }

            // simplicity between adjacent positions
            if i + 1 < n {
                let diff = x[i] - x[i + 1];
                es += squared(diff);
                if let Some(g) = grad.as_deref_mut() {
                    g[i] += self.w_s * 2.0 * diff;
                    g[i + 1] -= self.w_s * 2.0 * diff;
                }
            }
        }

        // fixed last value
        let diff = x[n - 1] - self.ns_end;
        es += squared(diff);
        if let Some(g) = grad.as_deref_mut() {
            g[n - 1] += self.w_s * 2.0 * diff;
        }

        ec * self.w_c + es * self.w_s
    }

    // ── constraint kernel ──────────────────────────────────

    /// Linear ratio bound for the given tag, overwriting only the
    /// touched gradient entries.
    pub fn constraint(&self, data: &CallbackData, x: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        let (i, kind) = match *data {
            CallbackData::SeqBound { index, kind } => (index, kind),
            _ => return 0.0, // graph tags never reach the sequence kernel
        };
        match kind {
            BoundKind::FirstMin => {
                // ns_start/F ≤ x_0  ⟺  ns_start·iF − x_0 ≤ 0
                if let Some(g) = grad.as_deref_mut() {
                    g[0] = -1.0;
                }
                self.ns_start * self.inv_f - x[0]
            }
            BoundKind::FirstMax => {
                // x_0 ≤ ns_start·F  ⟺  −ns_start·F + x_0 ≤ 0
                if let Some(g) = grad.as_deref_mut() {
                    g[0] = 1.0;
                }
                -self.ns_start * self.f_ratio + x[0]
            }
            BoundKind::NextMin => {
                // x_i/F ≤ x_{i+1}  ⟺  x_i·iF − x_{i+1} ≤ 0
                if let Some(g) = grad.as_deref_mut() {
                    g[i] = self.inv_f;
                    g[i + 1] = -1.0;
                }
                x[i] * self.inv_f - x[i + 1]
            }
            BoundKind::NextMax => {
                // x_{i+1} ≤ x_i·F  ⟺  −x_i·F + x_{i+1} ≤ 0
                if let Some(g) = grad.as_deref_mut() {
                    g[i] = -self.f_ratio;
                    g[i + 1] = 1.0;
                }
                -x[i] * self.f_ratio + x[i + 1]
            }
            BoundKind::LastMin => {
                // ns_end/F ≤ x_i  ⟺  ns_end·iF − x_i ≤ 0
                if let Some(g) = grad.as_deref_mut() {
                    g[i] = -1.0;
                }
                self.ns_end * self.inv_f - x[i]
            }
            BoundKind::LastMax => {
                // x_i ≤ ns_end·F  ⟺  x_i − ns_end·F ≤ 0
                if let Some(g) = grad.as_deref_mut() {
                    g[i] = 1.0;
                }
                x[i] - self.ns_end * self.f_ratio
            }
        }
    }

    /// The ratio-bound set: boundary pairs are optional because the
    /// driver folds them into the variable bounds.
    fn ratio_bounds(&self, use_first: bool, use_last: bool) -> Vec<CallbackData> {
        let n = self.course.len();
        let mut bounds = Vec::new();
        if use_first && n > 0 {
            bounds.push(CallbackData::SeqBound { index: 0, kind: BoundKind::FirstMin });
            bounds.push(CallbackData::SeqBound { index: 0, kind: BoundKind::FirstMax });
        }
        for i in 0..n.saturating_sub(1) {
            bounds.push(CallbackData::SeqBound { index: i, kind: BoundKind::NextMin });
            bounds.push(CallbackData::SeqBound { index: i, kind: BoundKind::NextMax });
        }
        if use_last && n > 0 {
            bounds.push(CallbackData::SeqBound { index: n - 1, kind: BoundKind::LastMin });
            bounds.push(CallbackData::SeqBound { index: n - 1, kind: BoundKind::LastMax });
        }
        bounds
    }

    // ── constraint error reporters ─────────────────────────

    /// Signed sum over the full constraint set (including the boundary
    /// pairs the driver encodes as variable bounds).
    pub fn constraint_error(&self) -> f64 {
        self.ratio_bounds(true, true)
            .iter()
            .map(|b| self.constraint(b, &self.vars, None))
            .sum()
    }

    /// Largest positive violation over the full constraint set.
    pub fn constraint_max_error(&self) -> f64 {
        self.ratio_bounds(true, true)
            .iter()
            .map(|b| self.constraint(b, &self.vars, None))
            .fold(0.0_f64, f64::max)
    }

    pub fn constraint_mean_error(&self) -> f64 {
        let nc = 2 * self.vars.len() + 2;
        self.constraint_error() / nc as f64
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
    /// the registered `Next*` constraints.  Diagnostic only.
    pub fn check_gradient(&self, print: bool, eps: f64) -> f64 {
        let mut max_err =
            self.gradient_error_at_both(&|x, grad| self.objective(x, grad), eps);

        for bound in self.ratio_bounds(false, false) {
            max_err = max_err
                .max(self.gradient_error_at_both(&|x, g| self.constraint(&bound, x, g), eps));
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
        let n = self.vars.len();
        let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed);

        if verbose {
            eprintln!("Using algorithm: {}", self.options.main_algo.name());
        }

        // per-position bounds: intersection of the boxes reachable from
        // the two fixed boundary counts, with the initial guess clipped
        // into the intersection
        let mut lower = vec![0.0; n];
        let mut upper = vec![0.0; n];
        for i in 0..n {
            let nss_min = (self.ns_start * self.inv_f.powi(i as i32 + 1)).max(BOUND_FLOOR);
            let nss_max = (self.ns_start * self.f_ratio.powi(i as i32 + 1)).min(BOUND_CEIL);
            let nse_min = (self.ns_end * self.inv_f.powi((n - i) as i32)).max(BOUND_FLOOR);
            let nse_max = (self.ns_end * self.f_ratio.powi((n - i) as i32)).min(BOUND_CEIL);
            lower[i] = nss_min.max(nse_min);
            upper[i] = nss_max.min(nse_max);
            self.vars[i] = self.course[i].max(lower[i]).min(upper[i]);
            if verbose {
                eprintln!(
                    "Using bounds[{i}]: min={}, max={}, init={}",
                    lower[i], upper[i], self.vars[i]
                );
            }
            if lower[i] > upper[i] {
                if verbose {
                    eprintln!("Empty bound intersection at position {i}");
                }
                return Ok(SolveStatus::InvalidArgs);
            }
        }

        // boundary ratios are already encoded in the variable bounds,
        // so only the adjacent pairs become explicit constraints
        let constraints: Vec<ConstraintSpec> = if self.options.use_constraints {
            self.ratio_bounds(false, false)
                .into_iter()
                .map(|data| ConstraintSpec { kind: ConstraintKind::Inequality, data })
                .collect()
        } else {
            Vec::new()
        };

        if self.options.gaussian_start {
            for (i, v) in self.vars.iter_mut().enumerate() {
                let noise: f64 = rng.sample(StandardNormal);
                *v = (*v + noise).max(lower[i]).min(upper[i]);
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

        let mut x = self.vars.clone();
        let outcome = {
            let problem = IntervalProblem { solver: self };
            optimizer::minimize(&problem, &constraints, &lower, &upper, &config, &mut x)?
        };
        self.vars.copy_from_slice(&x);
        self.objval = outcome.objval;

        if verbose {
            eprintln!("Solved after {} iterations", outcome.iterations);
        }
        Ok(outcome.status)
    }
}

// ─────────────────────────────────────────────────────────────
//  Optimizer problem wrapper
// ─────────────────────────────────────────────────────────────

struct IntervalProblem<'a> {
    solver: &'a LocalSolver,
}

impl<'a> SamplingProblem for IntervalProblem<'a> {
    fn objective(&self, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
        self.solver.objective(x, grad)
    }

    fn constraint(&self, data: &CallbackData, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
        self.solver.constraint(data, x, grad)
    }
}
