//! Optimization driver shared by the three sampling solvers.
//!
//! Wraps a [`SamplingProblem`] (objective + tagged constraint callbacks)
//! into argmin's `CostFunction` + `Gradient` traits and runs either a
//! direct smooth solve (L-BFGS / steepest descent with More–Thuente
//! line search) or an augmented-Lagrangian outer loop for the
//! constrained algorithms:
//!
//!   min  E(x)  +  Σ_eq [λ_k g_k + (μ/2) g_k²]
//!              +  Σ_ineq (μ/2) [max(0, λ_k/μ + g_k)]²
//!
//! After each inner solve the multipliers and penalty are updated:
//!
//!   λ_k ← λ_k + μ g_k            (equality)
//!   λ_k ← max(0, λ_k + μ g_k)    (inequality)
//!   μ   ← min(μ_max, α μ)
//!
//! Variable bounds are enforced with a smooth softplus barrier during
//! iteration and a final clamp of the returned iterate, so results are
//! always inside `[lb, ub]`.
//!
//! Uses `Vec<f64>` as the argmin parameter type throughout.

use crate::types::{Algorithm, CallbackData, KnitError, SolveStatus};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::gradientdescent::SteepestDescent;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use std::cell::{Cell, RefCell};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────
//  Problem interface
// ─────────────────────────────────────────────────────────────

/// A smooth sampling problem: one objective plus the constraint kernels
/// the driver registered, all with analytic gradients.
///
/// Gradient contract: the objective *accumulates* into a caller-zeroed
/// buffer; constraint kernels *overwrite* only the entries they touch
/// (the driver zeroes its scratch between constraint evaluations).
pub trait SamplingProblem {
    fn objective(&self, x: &[f64], grad: Option<&mut [f64]>) -> f64;
    fn constraint(&self, data: &CallbackData, x: &[f64], grad: Option<&mut [f64]>) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// g(x) = 0
    Equality,
    /// g(x) ≤ 0
    Inequality,
}

/// One registered constraint: the kind plus the tag the problem
/// dispatches on.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintSpec {
    pub kind: ConstraintKind,
    pub data: CallbackData,
}

/// Per-solve optimizer configuration, distilled from the solver options
/// by each driver.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub algorithm: Algorithm,
    pub local_algorithm: Algorithm,
    pub ftol_rel: f64,
    pub local_ftol_rel: f64,
    /// Inner iteration cap (already defaulted by the driver).
    pub max_eval: usize,
    /// Wall-clock budget in seconds; 0 = unlimited.
    pub max_time: f64,
    pub constraint_tol: f64,
    /// Per-evaluation tracing.
    pub trace: bool,
    /// Driver diagnostics.
    pub verbose: bool,
}

/// What a solve produced: the objective value at the returned iterate
/// (without penalty terms) and the translated termination status.
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    pub objval: f64,
    pub status: SolveStatus,
    pub iterations: u64,
}

// ─────────────────────────────────────────────────────────────
//  Augmented-Lagrangian state
// ─────────────────────────────────────────────────────────────

const MU_INIT: f64 = 10.0;
const MU_FACTOR: f64 = 5.0;
const MU_MAX: f64 = 1e8;
const MAX_OUTER_ITERS: usize = 20;

#[derive(Debug, Clone)]
struct AlState {
    /// One multiplier per registered constraint.
    lambdas: Vec<f64>,
    mu: f64,
}

// ─────────────────────────────────────────────────────────────
//  Softplus bound barrier
// ─────────────────────────────────────────────────────────────

const BARRIER_WEIGHT: f64 = 1e3;
const BARRIER_SHARPNESS: f64 = 10.0;

/// Numerically stable log(1 + exp(z)).
#[inline]
fn log1pexp(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Smooth one-sided barrier.
/// `k < 0` ⟹ penalise x < b (lower bound), `k > 0` ⟹ penalise x > b.
#[inline]
fn softplus(x: f64, b: f64, k: f64) -> f64 {
    log1pexp(-k * (b - x) - 1.0)
}

/// d/dx softplus = k · σ(z)  where z = −k(b−x)−1.
#[inline]
fn softplus_grad(x: f64, b: f64, k: f64) -> f64 {
    let z = -k * (b - x) - 1.0;
    k / (1.0 + (-z).exp())
}

// ─────────────────────────────────────────────────────────────
//  Penalised argmin problem
// ─────────────────────────────────────────────────────────────

/// The smooth subproblem handed to argmin: objective + AL penalties +
/// bound barrier.
///
/// `RefCell` because argmin's traits take `&self` while we want to
/// reuse scratch buffers; the solve is single-threaded so the borrows
/// never conflict.
///
/// argmin calls `cost(x)` and `gradient(x)` separately at the same x
/// each iteration, so the last `(x, value, gradient)` triple is cached
/// and the expensive evaluation runs once per unique x.
struct PenalisedProblem<'a, P> {
    inner: &'a P,
    constraints: &'a [ConstraintSpec],
    al: Option<&'a AlState>,
    lower: &'a [f64],
    upper: &'a [f64],
    scratch: RefCell<Vec<f64>>,
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
    eval_count: Cell<usize>,
    trace: bool,
}

impl<'a, P: SamplingProblem> PenalisedProblem<'a, P> {
    fn new(
        inner: &'a P,
        constraints: &'a [ConstraintSpec],
        al: Option<&'a AlState>,
        lower: &'a [f64],
        upper: &'a [f64],
        dim: usize,
        trace: bool,
    ) -> Self {
        Self {
            inner,
            constraints,
            al,
            lower,
            upper,
            scratch: RefCell::new(vec![0.0; dim]),
            last_eval: RefCell::new(None),
            eval_count: Cell::new(0),
            trace,
        }
    }

    /// Ensure the cache holds results for `x`; evaluates on a miss.
    fn ensure_evaluated(&self, x: &[f64]) -> Result<(), argmin::core::Error> {
        {
            let cached = self.last_eval.borrow();
            if let Some((ref t, _, _)) = *cached {
                if t == x {
                    return Ok(());
                }
            }
        }

        let n = x.len();
        let mut grad = vec![0.0; n];
        let mut val = self.inner.objective(x, Some(&mut grad));

        // augmented-Lagrangian penalty terms
        if let Some(al) = self.al {
            let mut scratch = self.scratch.borrow_mut();
            for (k, spec) in self.constraints.iter().enumerate() {
                scratch.fill(0.0);
                let g = self.inner.constraint(&spec.data, x, Some(&mut scratch));
                let (penalty, slope) = match spec.kind {
                    ConstraintKind::Equality => {
                        (al.lambdas[k] * g + 0.5 * al.mu * g * g, al.lambdas[k] + al.mu * g)
                    }
                    ConstraintKind::Inequality => {
                        let t = al.lambdas[k] / al.mu + g;
                        if t > 0.0 {
                            (0.5 * al.mu * t * t, al.mu * t)
                        } else {
                            (0.0, 0.0)
                        }
                    }
                };
                val += penalty;
                if slope != 0.0 {
                    for i in 0..n {
                        grad[i] += slope * scratch[i];
                    }
                }
            }
        }

        // bound barrier
        for i in 0..n {
            if self.lower[i].is_finite() {
                val += BARRIER_WEIGHT * softplus(x[i], self.lower[i], -BARRIER_SHARPNESS);
                grad[i] += BARRIER_WEIGHT * softplus_grad(x[i], self.lower[i], -BARRIER_SHARPNESS);
            }
            if self.upper[i].is_finite() {
                val += BARRIER_WEIGHT * softplus(x[i], self.upper[i], BARRIER_SHARPNESS);
                grad[i] += BARRIER_WEIGHT * softplus_grad(x[i], self.upper[i], BARRIER_SHARPNESS);
            }
        }

        let count = self.eval_count.get() + 1;
        self.eval_count.set(count);
        if self.trace {
            eprintln!("eval {count}: {val:.6e}");
        }

        *self.last_eval.borrow_mut() = Some((x.to_vec(), val, grad));
        Ok(())
    }
}

impl<'a, P: SamplingProblem> CostFunction for PenalisedProblem<'a, P> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.ensure_evaluated(x)?;
        let cached = self.last_eval.borrow();
        Ok(cached.as_ref().unwrap().1)
    }
}

impl<'a, P: SamplingProblem> Gradient for PenalisedProblem<'a, P> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.ensure_evaluated(x)?;
        let cached = self.last_eval.borrow();
        Ok(cached.as_ref().unwrap().2.clone())
    }
}

// ─────────────────────────────────────────────────────────────
//  Inner smooth solve
// ─────────────────────────────────────────────────────────────

fn translate_termination(reason: Option<&TerminationReason>) -> SolveStatus {
    match reason {
        Some(TerminationReason::SolverConverged) => SolveStatus::FtolReached,
        Some(TerminationReason::TargetCostReached) => SolveStatus::StopvalReached,
        Some(TerminationReason::MaxItersReached) => SolveStatus::MaxEvalReached,
        Some(TerminationReason::Timeout) => SolveStatus::MaxTimeReached,
        Some(TerminationReason::Interrupt) => SolveStatus::ForcedStop,
        Some(TerminationReason::SolverExit(_)) => SolveStatus::Failure,
        None => SolveStatus::Success,
    }
}

/// One smooth solve with the given algorithm, returning the best
/// iterate, its penalised cost, and the translated status.
fn run_inner<P: SamplingProblem>(
    problem: &P,
    constraints: &[ConstraintSpec],
    al: Option<&AlState>,
    lower: &[f64],
    upper: &[f64],
    algorithm: Algorithm,
    ftol_rel: f64,
    config: &OptimizerConfig,
    x0: Vec<f64>,
) -> Result<(Vec<f64>, f64, SolveStatus, u64), KnitError> {
    let dim = x0.len();
    let penalised =
        PenalisedProblem::new(problem, constraints, al, lower, upper, dim, config.trace);

    // Already at a stationary point (common when the targets are
    // self-consistent): the line search has no descent direction to
    // work with, so report convergence directly.
    penalised.ensure_evaluated(&x0).map_err(KnitError::from)?;
    {
        let cached = penalised.last_eval.borrow();
        let (_, val0, ref grad0) = *cached.as_ref().unwrap();
        let gnorm = grad0.iter().fold(0.0_f64, |m, &g| m.max(g.abs()));
        if gnorm <= 1e-8 {
            return Ok((x0, val0, SolveStatus::FtolReached, 0));
        }
    }

    let linesearch = MoreThuenteLineSearch::new();

    match algorithm {
        Algorithm::SteepestDescent => {
            let solver = SteepestDescent::new(linesearch);
            let mut executor = Executor::new(penalised, solver).configure(|state| {
                state
                    .param(x0)
                    .max_iters(config.max_eval as u64)
                    .target_cost(f64::NEG_INFINITY)
            });
            if config.max_time > 0.0 {
                executor = executor.timeout(Duration::from_secs_f64(config.max_time));
            }
            let result = executor.run()?;
            let state = result.state();
            let best = state
                .get_best_param()
                .cloned()
                .ok_or_else(|| KnitError::Solver("no best parameters returned".into()))?;
            let status = translate_termination(state.get_termination_reason());
            Ok((best, state.get_best_cost(), status, state.get_iter()))
        }
        _ => {
            // L-BFGS backs both the direct path and the AL subproblems
            let mut solver = LBFGS::new(linesearch, 10);
            if ftol_rel > 0.0 {
                solver = solver.with_tolerance_cost(ftol_rel)?;
            }
            let mut executor = Executor::new(penalised, solver).configure(|state| {
                state
                    .param(x0)
                    .max_iters(config.max_eval as u64)
                    .target_cost(f64::NEG_INFINITY)
            });
            if config.max_time > 0.0 {
                executor = executor.timeout(Duration::from_secs_f64(config.max_time));
            }
            let result = executor.run()?;
            let state = result.state();
            let best = state
                .get_best_param()
                .cloned()
                .ok_or_else(|| KnitError::Solver("no best parameters returned".into()))?;
            let status = translate_termination(state.get_termination_reason());
            Ok((best, state.get_best_cost(), status, state.get_iter()))
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Top-level entry point
// ─────────────────────────────────────────────────────────────

/// Violation of one constraint at `x`: |g| for equalities, max(0, g)
/// for inequalities.
fn violation<P: SamplingProblem>(problem: &P, spec: &ConstraintSpec, x: &[f64]) -> f64 {
    let g = problem.constraint(&spec.data, x, None);
    match spec.kind {
        ConstraintKind::Equality => g.abs(),
        ConstraintKind::Inequality => g.max(0.0),
    }
}

/// Minimize the problem starting from `x`, honoring bounds and the
/// registered constraints.  `x` is updated in place with the final
/// (clamped) iterate.
pub fn minimize<P: SamplingProblem>(
    problem: &P,
    constraints: &[ConstraintSpec],
    lower: &[f64],
    upper: &[f64],
    config: &OptimizerConfig,
    x: &mut Vec<f64>,
) -> Result<Outcome, KnitError> {
    let use_al = config.algorithm.is_auglag() && !constraints.is_empty();

    // the AL ids are not smooth solvers themselves; without constraints
    // they degrade to their local algorithm
    let direct_algo = if config.algorithm.is_auglag() {
        config.local_algorithm
    } else {
        config.algorithm
    };

    if !use_al {
        let (best, _, status, iterations) = run_inner(
            problem,
            &[],
            None,
            lower,
            upper,
            direct_algo,
            config.ftol_rel,
            config,
            x.clone(),
        )?;
        *x = best;
        clamp_into_bounds(x, lower, upper);
        let objval = problem.objective(x, None);
        return Ok(Outcome { objval, status, iterations });
    }

    let mut al = AlState { lambdas: vec![0.0; constraints.len()], mu: MU_INIT };
    let mut best = x.clone();
    let mut status = SolveStatus::Success;
    let mut total_iters = 0u64;
    let mut prev_cost = f64::INFINITY;

    for outer in 0..MAX_OUTER_ITERS {
        let (b, cost, s, iters) = run_inner(
            problem,
            constraints,
            Some(&al),
            lower,
            upper,
            config.local_algorithm,
            config.local_ftol_rel,
            config,
            best.clone(),
        )?;
        best = b;
        status = s;
        total_iters += iters;

        let viol = constraints
            .iter()
            .map(|spec| violation(problem, spec, &best))
            .fold(0.0_f64, f64::max);

        if config.verbose {
            eprintln!(
                "AL outer {}: mu={:.2e}, max_violation={:.4e}, cost={:.6e}",
                outer + 1,
                al.mu,
                viol,
                cost
            );
        }

        if viol < config.constraint_tol {
            break;
        }
        if config.ftol_rel > 0.0
            && (prev_cost - cost).abs() <= config.ftol_rel * cost.abs().max(1.0)
        {
            status = SolveStatus::FtolReached;
            break;
        }
        prev_cost = cost;

        for (k, spec) in constraints.iter().enumerate() {
            let g = problem.constraint(&spec.data, &best, None);
            al.lambdas[k] = match spec.kind {
                ConstraintKind::Equality => al.lambdas[k] + al.mu * g,
                ConstraintKind::Inequality => (al.lambdas[k] + al.mu * g).max(0.0),
            };
        }
        al.mu = (al.mu * MU_FACTOR).min(MU_MAX);
    }

    *x = best;
    clamp_into_bounds(x, lower, upper);
    let objval = problem.objective(x, None);
    Ok(Outcome { objval, status, iterations: total_iters })
}

fn clamp_into_bounds(x: &mut [f64], lower: &[f64], upper: &[f64]) {
    for i in 0..x.len() {
        x[i] = x[i].max(lower[i]).min(upper[i]);
    }
}
