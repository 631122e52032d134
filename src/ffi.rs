//! C-compatible FFI for the host runtime.
//!
//! All functions are `#[no_mangle] extern "C"`.  Each solver variant is
//! backed by one process-wide, mutex-guarded instance (`ks_global_*`,
//! `ks_local_*`, `ks_shortrow_*`); the core solver types themselves
//! hold no global state.
//!
//! Conventions:
//!   - Setters taking an index silently diagnose out-of-range calls on
//!     stderr; state is unchanged.
//!   - `solve` returns the integer status code (positive = success,
//!     negative = optimizer failure, 0 = aborted on a setup/solver
//!     error).
//!   - Value getters return 0.0 / 0 on out-of-range access.

use crate::global::GlobalSolver;
use crate::local::LocalSolver;
use crate::reduction::AliasingLevel;
use crate::shortrow::ShortRowSolver;
use crate::types::{Algorithm, SolveStatus};
use std::sync::{LazyLock, Mutex, MutexGuard};

static GLOBAL: LazyLock<Mutex<GlobalSolver>> = LazyLock::new(|| Mutex::new(GlobalSolver::new()));
static LOCAL: LazyLock<Mutex<LocalSolver>> = LazyLock::new(|| Mutex::new(LocalSolver::new()));
static SHORTROW: LazyLock<Mutex<ShortRowSolver>> =
    LazyLock::new(|| Mutex::new(ShortRowSolver::new()));

fn global() -> MutexGuard<'static, GlobalSolver> {
    GLOBAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn local() -> MutexGuard<'static, LocalSolver> {
    LOCAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn shortrow() -> MutexGuard<'static, ShortRowSolver> {
    SHORTROW.lock().unwrap_or_else(|e| e.into_inner())
}

fn diagnose<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        eprintln!("knitshape: {e}");
    }
}

// ─────────────────────────────────────────────────────────────
//  Global (course-graph) solver
// ─────────────────────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn ks_global_reset() {
    global().reset();
}

#[no_mangle]
pub extern "C" fn ks_global_allocate(num_edges: usize, num_nodes: usize) {
    global().allocate(num_edges, num_nodes);
}

#[no_mangle]
pub extern "C" fn ks_global_set_course(index: usize, value: f64) {
    diagnose(global().set_course(index, value));
}

#[no_mangle]
pub extern "C" fn ks_global_set_shaping(index: usize, value: f64) {
    diagnose(global().set_shaping(index, value));
}

#[no_mangle]
pub extern "C" fn ks_global_allocate_node(
    index: usize,
    simple: bool,
    num_inputs: usize,
    num_outputs: usize,
) {
    diagnose(global().allocate_node(index, simple, num_inputs, num_outputs));
}

#[no_mangle]
pub extern "C" fn ks_global_set_node_input(node_index: usize, slot: usize, edge_index: usize) {
    diagnose(global().set_node_input(node_index, slot, edge_index));
}

#[no_mangle]
pub extern "C" fn ks_global_set_node_output(node_index: usize, slot: usize, edge_index: usize) {
    diagnose(global().set_node_output(node_index, slot, edge_index));
}

#[no_mangle]
pub extern "C" fn ks_global_set_weights(w_c: f64, w_s: f64) {
    global().set_weights(w_c, w_s);
}

#[no_mangle]
pub extern "C" fn ks_global_set_aliasing_level(level: i32) {
    match AliasingLevel::from_code(level) {
        Some(l) => global().set_aliasing_level(l),
        None => eprintln!("knitshape: unknown aliasing level {level}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_global_set_global_shaping(enabled: bool) {
    global().set_global_shaping(enabled);
}

#[no_mangle]
pub extern "C" fn ks_global_set_use_constraints(use_constraints: bool) {
    global().options.use_constraints = use_constraints;
}

#[no_mangle]
pub extern "C" fn ks_global_set_seed(seed: u64) {
    global().options.seed = seed;
}

#[no_mangle]
pub extern "C" fn ks_global_use_noise(noise: bool) {
    global().options.gaussian_start = noise;
}

#[no_mangle]
pub extern "C" fn ks_global_set_verbose(verbose: bool) {
    global().options.verbose = verbose;
}

#[no_mangle]
pub extern "C" fn ks_global_set_main_algorithm(algo: i32) {
    match Algorithm::from_code(algo) {
        Some(a) => global().options.main_algo = a,
        None => eprintln!("knitshape: unknown algorithm {algo}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_global_get_main_algorithm() -> i32 {
    global().options.main_algo.code()
}

#[no_mangle]
pub extern "C" fn ks_global_set_local_algorithm(algo: i32) {
    match Algorithm::from_code(algo) {
        Some(a) => global().options.local_algo = a,
        None => eprintln!("knitshape: unknown algorithm {algo}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_global_get_local_algorithm() -> i32 {
    global().options.local_algo.code()
}

#[no_mangle]
pub extern "C" fn ks_global_set_max_eval(max_eval: usize) {
    global().options.max_eval = max_eval;
}

#[no_mangle]
pub extern "C" fn ks_global_set_max_time(max_time: f64) {
    global().options.max_time = max_time;
}

#[no_mangle]
pub extern "C" fn ks_global_set_main_ftol_rel(tol: f64) {
    global().options.main_ftol_rel = tol;
}

#[no_mangle]
pub extern "C" fn ks_global_set_local_ftol_rel(tol: f64) {
    global().options.local_ftol_rel = tol;
}

#[no_mangle]
pub extern "C" fn ks_global_set_constraint_tol(tol: f64) {
    global().options.constraint_tol = tol;
}

#[no_mangle]
pub extern "C" fn ks_global_solve(verbose: bool) -> i32 {
    match global().solve(verbose) {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("knitshape: {e}");
            SolveStatus::Aborted.code()
        }
    }
}

#[no_mangle]
pub extern "C" fn ks_global_get_variable_number() -> usize {
    global().variable_number()
}

#[no_mangle]
pub extern "C" fn ks_global_get_variable_value(index: usize) -> f64 {
    global().variable_value(index).unwrap_or_else(|e| {
        eprintln!("knitshape: {e}");
        0.0
    })
}

#[no_mangle]
pub extern "C" fn ks_global_get_objective_value() -> f64 {
    global().objective_value()
}

#[no_mangle]
pub extern "C" fn ks_global_get_num_constraints() -> usize {
    global().num_constraints()
}

#[no_mangle]
pub extern "C" fn ks_global_get_constraint_error() -> f64 {
    global().constraint_error()
}

#[no_mangle]
pub extern "C" fn ks_global_get_constraint_max_error() -> f64 {
    global().constraint_max_error()
}

#[no_mangle]
pub extern "C" fn ks_global_get_constraint_mean_error() -> f64 {
    global().constraint_mean_error()
}

#[no_mangle]
pub extern "C" fn ks_global_check_gradient(print: bool, eps: f64) -> f64 {
    global().check_gradient(print, eps)
}

// ─────────────────────────────────────────────────────────────
//  Local (course-interval) solver
// ─────────────────────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn ks_local_reset() {
    local().reset();
}

#[no_mangle]
pub extern "C" fn ks_local_allocate(num_positions: usize) {
    local().allocate(num_positions);
}

#[no_mangle]
pub extern "C" fn ks_local_set_course(index: usize, value: f64) {
    diagnose(local().set_course(index, value));
}

#[no_mangle]
pub extern "C" fn ks_local_set_start(value: f64) {
    local().set_start(value);
}

#[no_mangle]
pub extern "C" fn ks_local_set_end(value: f64) {
    local().set_end(value);
}

#[no_mangle]
pub extern "C" fn ks_local_set_shaping(shaping: f64) {
    local().set_shaping(shaping);
}

#[no_mangle]
pub extern "C" fn ks_local_set_weights(w_c: f64, w_s: f64) {
    local().set_weights(w_c, w_s);
}

#[no_mangle]
pub extern "C" fn ks_local_set_use_constraints(use_constraints: bool) {
    local().options.use_constraints = use_constraints;
}

#[no_mangle]
pub extern "C" fn ks_local_set_seed(seed: u64) {
    local().options.seed = seed;
}

#[no_mangle]
pub extern "C" fn ks_local_use_noise(noise: bool) {
    local().options.gaussian_start = noise;
}

#[no_mangle]
pub extern "C" fn ks_local_set_verbose(verbose: bool) {
    local().options.verbose = verbose;
}

#[no_mangle]
pub extern "C" fn ks_local_set_main_algorithm(algo: i32) {
    match Algorithm::from_code(algo) {
        Some(a) => local().options.main_algo = a,
        None => eprintln!("knitshape: unknown algorithm {algo}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_local_get_main_algorithm() -> i32 {
    local().options.main_algo.code()
}

#[no_mangle]
pub extern "C" fn ks_local_set_local_algorithm(algo: i32) {
    match Algorithm::from_code(algo) {
        Some(a) => local().options.local_algo = a,
        None => eprintln!("knitshape: unknown algorithm {algo}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_local_get_local_algorithm() -> i32 {
    local().options.local_algo.code()
}

#[no_mangle]
pub extern "C" fn ks_local_set_max_eval(max_eval: usize) {
    local().options.max_eval = max_eval;
}

#[no_mangle]
pub extern "C" fn ks_local_set_max_time(max_time: f64) {
    local().options.max_time = max_time;
}

#[no_mangle]
pub extern "C" fn ks_local_set_main_ftol_rel(tol: f64) {
    local().options.main_ftol_rel = tol;
}

#[no_mangle]
pub extern "C" fn ks_local_set_local_ftol_rel(tol: f64) {
    local().options.local_ftol_rel = tol;
}

#[no_mangle]
pub extern "C" fn ks_local_set_constraint_tol(tol: f64) {
    local().options.constraint_tol = tol;
}

#[no_mangle]
pub extern "C" fn ks_local_solve(verbose: bool) -> i32 {
    match local().solve(verbose) {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("knitshape: {e}");
            SolveStatus::Aborted.code()
        }
    }
}

#[no_mangle]
pub extern "C" fn ks_local_get_variable_number() -> usize {
    local().variable_number()
}

#[no_mangle]
pub extern "C" fn ks_local_get_variable_value(index: usize) -> f64 {
    local().variable_value(index).unwrap_or_else(|e| {
        eprintln!("knitshape: {e}");
        0.0
    })
}

#[no_mangle]
pub extern "C" fn ks_local_get_objective_value() -> f64 {
    local().objective_value()
}

#[no_mangle]
pub extern "C" fn ks_local_get_constraint_error() -> f64 {
    local().constraint_error()
}

#[no_mangle]
pub extern "C" fn ks_local_get_constraint_max_error() -> f64 {
    local().constraint_max_error()
}

#[no_mangle]
pub extern "C" fn ks_local_get_constraint_mean_error() -> f64 {
    local().constraint_mean_error()
}

#[no_mangle]
pub extern "C" fn ks_local_check_gradient(print: bool, eps: f64) -> f64 {
    local().check_gradient(print, eps)
}

// ─────────────────────────────────────────────────────────────
//  Short-row (wale) solver
// ─────────────────────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn ks_shortrow_reset() {
    shortrow().reset();
}

#[no_mangle]
pub extern "C" fn ks_shortrow_allocate(num_samples: usize) {
    shortrow().allocate(num_samples);
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_wale(index: usize, value: f64) {
    diagnose(shortrow().set_wale(index, value));
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_circular(circular: bool) {
    shortrow().set_circular(circular);
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_simplicity_power(power: i32) {
    shortrow().set_simplicity_power(power);
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_weights(w_w: f64, w_s: f64) {
    shortrow().set_weights(w_w, w_s);
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_seed(seed: u64) {
    shortrow().options.seed = seed;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_use_noise(noise: bool) {
    shortrow().options.gaussian_start = noise;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_verbose(verbose: bool) {
    shortrow().options.verbose = verbose;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_main_algorithm(algo: i32) {
    match Algorithm::from_code(algo) {
        Some(a) => shortrow().options.main_algo = a,
        None => eprintln!("knitshape: unknown algorithm {algo}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_shortrow_get_main_algorithm() -> i32 {
    shortrow().options.main_algo.code()
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_local_algorithm(algo: i32) {
    match Algorithm::from_code(algo) {
        Some(a) => shortrow().options.local_algo = a,
        None => eprintln!("knitshape: unknown algorithm {algo}"),
    }
}

#[no_mangle]
pub extern "C" fn ks_shortrow_get_local_algorithm() -> i32 {
    shortrow().options.local_algo.code()
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_max_eval(max_eval: usize) {
    shortrow().options.max_eval = max_eval;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_max_time(max_time: f64) {
    shortrow().options.max_time = max_time;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_main_ftol_rel(tol: f64) {
    shortrow().options.main_ftol_rel = tol;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_local_ftol_rel(tol: f64) {
    shortrow().options.local_ftol_rel = tol;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_set_constraint_tol(tol: f64) {
    shortrow().options.constraint_tol = tol;
}

#[no_mangle]
pub extern "C" fn ks_shortrow_solve(verbose: bool) -> i32 {
    match shortrow().solve(verbose) {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("knitshape: {e}");
            SolveStatus::Aborted.code()
        }
    }
}

#[no_mangle]
pub extern "C" fn ks_shortrow_get_variable_number() -> usize {
    shortrow().variable_number()
}

#[no_mangle]
pub extern "C" fn ks_shortrow_get_variable_value(index: usize) -> f64 {
    shortrow().variable_value(index).unwrap_or_else(|e| {
        eprintln!("knitshape: {e}");
        0.0
    })
}

#[no_mangle]
pub extern "C" fn ks_shortrow_get_objective_value() -> f64 {
    shortrow().objective_value()
}

#[no_mangle]
pub extern "C" fn ks_shortrow_check_gradient(print: bool, eps: f64) -> f64 {
    shortrow().check_gradient(print, eps)
}
