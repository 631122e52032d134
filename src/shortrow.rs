//! Short-row / wale solver.
//!
//! Assigns a wale count to every sample of a short-row region, trading
//! accuracy against the chosen simplicity flavor between neighbors:
//! L2 spreads differences smoothly, L1 concentrates them into few
//! jumps.  Circular regions add the wrap-around pair (0, N−1).

use crate::gradcheck::gradient_error;
use crate::optimizer::{self, OptimizerConfig, SamplingProblem};
use crate::types::{Algorithm, CallbackData, KnitError, SolveStatus, SolverOptions};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

#[inline]
fn squared(x: f64) -> f64 {
    x * x
}

/// Default evaluation cap when `max_eval` is 0; short-row problems are
/// small and unconstrained, so the budget is tighter than the graph
/// solvers'.
const DEFAULT_MAX_EVAL_SR: usize = 100;

// ─────────────────────────────────────────────────────────────
//  Solver state
// ─────────────────────────────────────────────────────────────

/// One short-row sampling problem.
#[derive(Debug)]
pub struct ShortRowSolver {
    // inputs
    wale: Vec<f64>,
    circular: bool,
    simp_l2: bool,
    w_w: f64,
    w_s: f64,
    pub options: SolverOptions,
    // outputs
    vars: Vec<f64>,
    objval: f64,
}

impl Default for ShortRowSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ShortRowSolver {
    pub fn new() -> Self {
        Self {
            wale: Vec::new(),
            circular: false,
            simp_l2: true,
            w_w: 1.0,
            w_s: 0.1,
            options: SolverOptions { main_algo: Algorithm::Lbfgs, ..SolverOptions::default() },
            vars: Vec::new(),
            objval: 0.0,
        }
    }

    // ── lifecycle ──────────────────────────────────────────

    pub fn reset(&mut self) {
        self.wale.clear();
        self.vars.clear();
        self.objval = 0.0;
    }

    pub fn allocate(&mut self, num_samples: usize) {
        self.reset();
        self.wale = vec![0.0; num_samples];
        self.vars = vec![0.0; num_samples];
    }

    // ── input setters ──────────────────────────────────────

    pub fn set_wale(&mut self, index: usize, value: f64) -> Result<(), KnitError> {
        let len = self.wale.len();
        *self
            .wale
            .get_mut(index)
            .ok_or(KnitError::IndexOutOfRange { what: "sample", index, len })? = value;
        Ok(())
    }

    pub fn set_circular(&mut self, circular: bool) {
        self.circular = circular;
    }

    /// Select the simplicity flavor by exponent: 1 = L1, 2 = L2.
    /// Anything else is diagnosed and leaves the state unchanged.
    pub fn set_simplicity_power(&mut self, power: i32) {
        match power {
            1 => self.simp_l2 = false,
            2 => self.simp_l2 = true,
            _ => eprintln!("Power not supported: {power}"),
        }
    }

    pub fn set_weights(&mut self, w_w: f64, w_s: f64) {
        self.w_w = w_w;
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
            .ok_or(KnitError::IndexOutOfRange { what: "sample", index, len: self.vars.len() })
    }

    pub fn variables(&self) -> &[f64] {
        &self.vars
    }

    pub fn objective_value(&self) -> f64 {
        self.objval
    }

    // ── objective + gradient ───────────────────────────────

    /// Simplicity between samples `i0` and `i1`, accumulating gradients
    /// into a caller-zeroed buffer when present.
    fn simplicity(&self, x: &[f64], grad: &mut Option<&mut [f64]>, i0: usize, i1: usize) -> f64 {
        let diff = x[i0] - x[i1];
        if self.simp_l2 {
            if let Some(g) = grad.as_deref_mut() {
                g[i0] += self.w_s * 2.0 * diff;
                g[i1] -= self.w_s * 2.0 * diff;
            }
            squared(diff)
        } else {
            let sign = if diff >= 0.0 { 1.0 } else { -1.0 };
            if let Some(g) = grad.as_deref_mut() {
                g[i0] += self.w_s * sign;
                g[i1] -= self.w_s * sign;
            }
            sign * diff
        }
    }

    /// `E = w_w·Ew + w_s·Es`, accumulating the gradient into a
    /// caller-zeroed buffer when present.
    pub fn objective(&self, x: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        let n = x.len();
        let mut ew = 0.0;
        let mut es = 0.0;

        for i in 0..n {
            // wale accuracy
            let diff = x[i] - self.wale[i];
            ew += squared(diff);
            if let Some(g) = grad.as_deref_mut() {
                g[i] += self.w_w * 2.0 * diff;
            }

            // simplicity between adjacent samples
            if i > 0 {
                es += self.simplicity(x, &mut grad, i, i - 1);
            }
        }
        if self.circular && n > 1 {
            es += self.simplicity(x, &mut grad, 0, n - 1);
        }

        ew * self.w_w + es * self.w_s
    }

    // ── gradient checking ──────────────────────────────────

    /// Worst relative finite-difference error of the objective at both
    /// the wale targets and the current variables.  Diagnostic only.
    pub fn check_gradient(&self, print: bool, eps: f64) -> f64 {
        let f = |x: &[f64], grad: Option<&mut [f64]>| self.objective(x, grad);
        let max_err =
            gradient_error(&f, &self.wale, eps, true).max(gradient_error(&f, &self.vars, eps, true));
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

        // wale counts are only bounded below; initial point is the
        // clipped target data
        let lower = vec![0.0; n];
        let upper = vec![f64::INFINITY; n];
        for (v, &c) in self.vars.iter_mut().zip(self.wale.iter()) {
            *v = c.max(0.0);
        }

        if self.options.gaussian_start {
            for v in self.vars.iter_mut() {
                let noise: f64 = rng.sample(StandardNormal);
                *v = (*v + noise).max(0.0);
            }
        }

        let max_eval =
            if self.options.max_eval > 0 { self.options.max_eval } else { DEFAULT_MAX_EVAL_SR };
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
            let problem = WaleProblem { solver: self };
            optimizer::minimize(&problem, &[], &lower, &upper, &config, &mut x)?
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

struct WaleProblem<'a> {
    solver: &'a ShortRowSolver,
}

impl<'a> SamplingProblem for WaleProblem<'a> {
    fn objective(&self, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
        self.solver.objective(x, grad)
    }

    fn constraint(&self, _data: &CallbackData, _x: &[f64], _grad: Option<&mut [f64]>) -> f64 {
        0.0 // the wale solver registers no constraints
    }
}
