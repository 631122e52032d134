//! End-to-end solves for all three samplers.
//!
//! Each test builds a small problem through the public setter surface,
//! runs `solve`, and checks the solution against the analytically
//! expected outcome: targets recovered when they are self-consistent,
//! interface conservation holding through the aliasing reduction, and
//! ratio/bound feasibility everywhere else.

use approx::assert_abs_diff_eq;
use knitshape::global::GlobalSolver;
use knitshape::local::LocalSolver;
use knitshape::reduction::AliasingLevel;
use knitshape::shortrow::ShortRowSolver;

// ─────────────────────────────────────────────────────────────
//  Global solver
// ─────────────────────────────────────────────────────────────

/// Straight chain e0 → (A) → e1 → (B) → e2 with uniform targets.
/// Trivial aliasing collapses the chain onto a single variable, and
/// the consistent targets make the optimum exact.
#[test]
fn global_chain_collapses_and_recovers_targets() {
    let mut s = GlobalSolver::new();
    s.allocate(3, 3);
    for i in 0..3 {
        s.set_course(i, 5.0).unwrap();
    }
    s.allocate_node(0, false, 1, 1).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_output(0, 0, 1).unwrap();
    s.allocate_node(1, false, 1, 1).unwrap();
    s.set_node_input(1, 0, 1).unwrap();
    s.set_node_output(1, 0, 2).unwrap();
    s.allocate_node(2, false, 1, 0).unwrap();
    s.set_node_input(2, 0, 2).unwrap();
    s.set_aliasing_level(AliasingLevel::Trivial);

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");
    for i in 0..3 {
        assert_abs_diff_eq!(s.variable_value(i).unwrap(), 5.0, epsilon = 1e-9);
    }
    assert!(s.objective_value() < 1e-12);
    assert!(s.constraint_max_error() < 1e-9);
}

/// 1→2 split with consistent targets under basic aliasing: the input
/// edge is rewritten as the sum of the outputs, so conservation is
/// exact by construction.
#[test]
fn global_split_conserves_flow() {
    let mut s = GlobalSolver::new();
    s.allocate(3, 1);
    for (i, c) in [10.0, 6.0, 4.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.allocate_node(0, false, 1, 2).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_output(0, 0, 1).unwrap();
    s.set_node_output(0, 1, 2).unwrap();
    s.set_aliasing_level(AliasingLevel::Basic);

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");

    let x0 = s.variable_value(0).unwrap();
    let x1 = s.variable_value(1).unwrap();
    let x2 = s.variable_value(2).unwrap();
    assert!((x0 - x1 - x2).abs() < 1e-6, "conservation broken: {x0} vs {x1}+{x2}");
    assert!(s.constraint_max_error() < 1e-6);
    assert_abs_diff_eq!(x1, 6.0, epsilon = 1e-2);
    assert_abs_diff_eq!(x2, 4.0, epsilon = 1e-2);
}

/// 2→2 node under complex aliasing: x2 = x0 + x1 − x3.  The rewritten
/// variable must stay above the derived lower bound and conservation
/// must hold to constraint precision.
#[test]
fn global_complex_aliasing_respects_lower_bound() {
    let mut s = GlobalSolver::new();
    s.allocate(4, 1);
    for (i, c) in [3.0, 4.0, 2.0, 5.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.allocate_node(0, false, 2, 2).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_input(0, 1, 1).unwrap();
    s.set_node_output(0, 0, 2).unwrap();
    s.set_node_output(0, 1, 3).unwrap();
    s.set_aliasing_level(AliasingLevel::Complex);

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");

    let x: Vec<f64> = (0..4).map(|i| s.variable_value(i).unwrap()).collect();
    assert!((x[0] + x[1] - x[2] - x[3]).abs() < 1e-3, "conservation broken: {x:?}");
    assert!(x[2] >= 2.0 - 1e-6, "aliased variable below bound: {}", x[2]);
    for (i, c) in [3.0, 4.0, 2.0, 5.0].into_iter().enumerate() {
        assert_abs_diff_eq!(x[i], c, epsilon = 0.2);
    }
}

/// With `aliasing_level = NONE` and a node no level can reduce at
/// TRIVIAL, the reduced path is an identity mapping and must reproduce
/// the unreduced trajectory bit for bit.
#[test]
fn global_identity_reduction_matches_unreduced() {
    let solve_with = |level: AliasingLevel| -> Vec<f64> {
        let mut s = GlobalSolver::new();
        s.allocate(4, 1);
        for (i, c) in [4.0, 4.0, 3.0, 6.0].into_iter().enumerate() {
            s.set_course(i, c).unwrap();
        }
        // 2→2 node: trivial aliasing has nothing to rewrite here
        s.allocate_node(0, false, 2, 2).unwrap();
        s.set_node_input(0, 0, 0).unwrap();
        s.set_node_input(0, 1, 1).unwrap();
        s.set_node_output(0, 0, 2).unwrap();
        s.set_node_output(0, 1, 3).unwrap();
        s.set_aliasing_level(level);
        let status = s.solve(false).unwrap();
        assert!(status.is_success(), "status {status:?}");
        (0..4).map(|i| s.variable_value(i).unwrap()).collect()
    };

    let unreduced = solve_with(AliasingLevel::None);
    let reduced = solve_with(AliasingLevel::Trivial);
    assert_eq!(unreduced, reduced);
}

/// Without registered constraints the solver just matches the targets,
/// leaving the interface residual visible in the error reporters.
#[test]
fn global_unconstrained_solve_reports_residual() {
    let mut s = GlobalSolver::new();
    s.allocate(3, 1);
    for (i, c) in [12.0, 5.0, 4.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.allocate_node(0, false, 1, 2).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_output(0, 0, 1).unwrap();
    s.set_node_output(0, 1, 2).unwrap();
    s.options.use_constraints = false;

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");
    assert_eq!(s.num_constraints(), 1);
    assert!(s.constraint_error() > 1.0, "residual {}", s.constraint_error());
}

/// Identical inputs and seed must reproduce the solution exactly, even
/// with the Gaussian start perturbation enabled.
#[test]
fn global_gaussian_start_is_deterministic() {
    let mut s = GlobalSolver::new();
    s.allocate(4, 1);
    for (i, c) in [4.0, 4.0, 3.0, 6.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.allocate_node(0, false, 2, 2).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_input(0, 1, 1).unwrap();
    s.set_node_output(0, 0, 2).unwrap();
    s.set_node_output(0, 1, 3).unwrap();
    s.options.gaussian_start = true;
    s.options.seed = 42;

    assert!(s.solve(false).unwrap().is_success());
    let first: Vec<f64> = (0..4).map(|i| s.variable_value(i).unwrap()).collect();

    assert!(s.solve(false).unwrap().is_success());
    let second: Vec<f64> = (0..4).map(|i| s.variable_value(i).unwrap()).collect();
    assert_eq!(first, second);
}

/// Editing node topology after a solve invalidates the cached aliasing;
/// the next solve must see the new graph.
#[test]
fn global_topology_edit_invalidates_reduction() {
    let mut s = GlobalSolver::new();
    s.allocate(3, 3);
    for (i, c) in [5.0, 5.0, 9.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.allocate_node(0, false, 1, 1).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_output(0, 0, 1).unwrap();
    s.allocate_node(1, false, 1, 1).unwrap();
    s.set_node_input(1, 0, 1).unwrap();
    s.set_node_output(1, 0, 2).unwrap();
    s.allocate_node(2, false, 1, 0).unwrap();
    s.set_node_input(2, 0, 2).unwrap();
    s.set_aliasing_level(AliasingLevel::Trivial);

    assert!(s.solve(false).unwrap().is_success());
    // chained aliases force all three edges equal: mean of targets
    let chained = s.variable_value(2).unwrap();
    assert_abs_diff_eq!(chained, (5.0 + 5.0 + 9.0) / 3.0, epsilon = 1e-6);

    // cut the second link: edge 2 becomes independent again
    s.allocate_node(1, false, 1, 0).unwrap();
    s.set_node_input(1, 0, 1).unwrap();
    assert!(s.solve(false).unwrap().is_success());
    let freed = s.variable_value(2).unwrap();
    assert_abs_diff_eq!(freed, 9.0, epsilon = 1e-2);
}

// ─────────────────────────────────────────────────────────────
//  Local solver
// ─────────────────────────────────────────────────────────────

/// Monotone doubling ramp: targets satisfy the ratio constraints
/// exactly, so the solution stays near them and within all bounds.
#[test]
fn local_monotone_ramp() {
    let mut s = LocalSolver::new();
    s.allocate(4);
    let targets = [4.0, 8.0, 12.0, 16.0];
    for (i, c) in targets.into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.set_start(4.0);
    s.set_end(16.0);
    s.set_shaping(2.0);

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");

    let n = 4;
    let (f, inv_f): (f64, f64) = (2.0, 0.5);
    for i in 0..n {
        let x = s.variable_value(i).unwrap();
        assert_abs_diff_eq!(x, targets[i], epsilon = 0.7);

        // recompute the driver's bound boxes and verify feasibility
        let lb = (4.0 * inv_f.powi(i as i32 + 1))
            .max(2.0)
            .max((16.0 * inv_f.powi((n - i) as i32)).max(2.0));
        let ub = (4.0 * f.powi(i as i32 + 1))
            .min(1e4)
            .min((16.0 * f.powi((n - i) as i32)).min(1e4));
        assert!(x >= lb - 1e-9 && x <= ub + 1e-9, "x[{i}]={x} outside [{lb}, {ub}]");
    }
    assert!(s.constraint_max_error() <= s.options.constraint_tol + 1e-6);
}

/// An interval whose boundary boxes cannot intersect is rejected with
/// the invalid-argument status.
#[test]
fn local_empty_bound_intersection_is_invalid() {
    let mut s = LocalSolver::new();
    s.allocate(2);
    s.set_course(0, 10.0).unwrap();
    s.set_course(1, 10.0).unwrap();
    // start and end too far apart to connect in two steps at F ≤ 2
    s.set_start(2.0);
    s.set_end(4000.0);
    s.set_shaping(2.0);

    let status = s.solve(false).unwrap();
    assert_eq!(status.code(), -2);
}

// ─────────────────────────────────────────────────────────────
//  Short-row solver
// ─────────────────────────────────────────────────────────────

/// Uniform circular targets under L1 simplicity: the start point is
/// already optimal and must be returned untouched.
#[test]
fn shortrow_circular_l1_uniform_targets() {
    let mut s = ShortRowSolver::new();
    s.allocate(4);
    for i in 0..4 {
        s.set_wale(i, 3.0).unwrap();
    }
    s.set_circular(true);
    s.set_simplicity_power(1);
    s.set_weights(1.0, 0.1);

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");
    for i in 0..4 {
        assert_abs_diff_eq!(s.variable_value(i).unwrap(), 3.0, epsilon = 1e-12);
    }
    assert_abs_diff_eq!(s.objective_value(), 0.0, epsilon = 1e-12);
}

/// Non-uniform open sequence under L2: the spike is pulled toward its
/// neighbors and the flanks are pulled up.
#[test]
fn shortrow_l2_smooths_spike() {
    let mut s = ShortRowSolver::new();
    s.allocate(3);
    for (i, c) in [1.0, 10.0, 1.0].into_iter().enumerate() {
        s.set_wale(i, c).unwrap();
    }

    let status = s.solve(false).unwrap();
    assert!(status.is_success(), "status {status:?}");

    let x0 = s.variable_value(0).unwrap();
    let x1 = s.variable_value(1).unwrap();
    let x2 = s.variable_value(2).unwrap();
    assert!(x1 < 10.0 - 1e-3, "spike not smoothed: {x1}");
    assert!(x0 > 1.0 + 1e-4 && x2 > 1.0 + 1e-4, "flanks not lifted: {x0}, {x2}");
    assert_abs_diff_eq!(x0, x2, epsilon = 1e-6);
}

/// An exhausted evaluation budget is reported as status 5, keeping the
/// last iterate available.
#[test]
fn shortrow_eval_budget_reports_maxeval() {
    let mut s = ShortRowSolver::new();
    s.allocate(3);
    for (i, c) in [5.0, 1.0, 9.0].into_iter().enumerate() {
        s.set_wale(i, c).unwrap();
    }
    s.options.max_eval = 1;

    let status = s.solve(false).unwrap();
    assert_eq!(status.code(), 5);
    assert_eq!(s.variable_number(), 3);
    for i in 0..3 {
        assert!(s.variable_value(i).unwrap().is_finite());
    }
}
