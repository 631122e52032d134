//! Finite-difference gradient tests for every objective and constraint
//! kernel, in full and reduced variable space.
//!
//! Each analytic gradient component is compared against a central-
//! difference estimate:
//!
//!     dE/dx_i  ≈  [ E(x + h eᵢ) − E(x − h eᵢ) ] / 2h
//!
//! The quadratic kernels are exercised through the crate's own
//! `gradient_error` helper (the same code backing `check_gradient`);
//! the reduced-space chain rule is checked with a hand-rolled central
//! difference against the folded full-space gradient.

use knitshape::gradcheck::gradient_error;
use knitshape::global::GlobalSolver;
use knitshape::local::LocalSolver;
use knitshape::reduction::{AliasingLevel, Reduction};
use knitshape::shortrow::ShortRowSolver;
use knitshape::types::{BoundKind, CallbackData, Node};

const EPS: f64 = 1e-4;
const TOL: f64 = 1e-3;

// ─────────────────────────────────────────────────────────────
//  Helpers: a small mixed course graph
// ─────────────────────────────────────────────────────────────

/// Five edges, three nodes:
///
///   e0 ──► (n0) ──► e1, e2          interface split 1→2
///   e1 ──► (n1) ──► e3              simple (shaping) node
///   e2, e3 ──► (n2) ──► e4          interface merge 2→1
fn make_graph_solver() -> GlobalSolver {
    let mut s = GlobalSolver::new();
    s.allocate(5, 3);
    for (i, c) in [10.0, 6.0, 4.0, 7.0, 11.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.allocate_node(0, false, 1, 2).unwrap();
    s.set_node_input(0, 0, 0).unwrap();
    s.set_node_output(0, 0, 1).unwrap();
    s.set_node_output(0, 1, 2).unwrap();

    s.allocate_node(1, true, 1, 1).unwrap();
    s.set_node_input(1, 0, 1).unwrap();
    s.set_node_output(1, 0, 3).unwrap();
    s.set_shaping(1, 1.5).unwrap();

    s.allocate_node(2, false, 2, 1).unwrap();
    s.set_node_input(2, 0, 2).unwrap();
    s.set_node_input(2, 1, 3).unwrap();
    s.set_node_output(2, 0, 4).unwrap();
    s
}

// ─────────────────────────────────────────────────────────────
//  Global solver
// ─────────────────────────────────────────────────────────────

#[test]
fn global_objective_gradient() {
    let s = make_graph_solver();
    let x = [9.3, 5.1, 4.8, 7.9, 10.2];
    let f = |x: &[f64], grad: Option<&mut [f64]>| s.objective(x, grad);
    let err = gradient_error(&f, &x, EPS, true);
    assert!(err < TOL, "objective gradient error {err}");
}

#[test]
fn global_constraint_gradients() {
    let s = make_graph_solver();
    let x = [9.3, 5.1, 4.8, 7.9, 10.2];
    for data in [
        CallbackData::InterfaceNode(0),
        CallbackData::InterfaceNode(2),
        CallbackData::UpperRange(1),
        CallbackData::LowerRange(1),
    ] {
        let f = |x: &[f64], grad: Option<&mut [f64]>| s.constraint(&data, x, grad);
        let err = gradient_error(&f, &x, EPS, true);
        assert!(err < TOL, "constraint {data:?} gradient error {err}");
    }
}

#[test]
fn global_check_gradient_reports_small_error() {
    let mut s = make_graph_solver();
    s.set_global_shaping(true);
    let err = s.check_gradient(false, EPS);
    assert!(err < TOL, "check_gradient reported {err}");
}

// ─────────────────────────────────────────────────────────────
//  Reduced-space chain rule
// ─────────────────────────────────────────────────────────────

/// The folded gradient must match a central difference of the reduced
/// objective E(expand(r)) — this is exactly the chain rule through the
/// alias expansion.
#[test]
fn reduced_gradient_matches_finite_difference() {
    let s = make_graph_solver();
    let nodes: Vec<Node> = (0..3)
        .map(|i| match i {
            0 => Node { index: 0, simple: false, inp_edges: vec![0], out_edges: vec![1, 2] },
            1 => Node { index: 1, simple: true, inp_edges: vec![1], out_edges: vec![3] },
            _ => Node { index: 2, simple: false, inp_edges: vec![2, 3], out_edges: vec![4] },
        })
        .collect();
    let red = Reduction::compute(5, &nodes, AliasingLevel::Complex).unwrap();
    let rdim = red.reduced_len();
    assert!(rdim < 5, "complex aliasing should eliminate variables");

    let r0: Vec<f64> = (0..rdim).map(|j| 4.0 + 1.3 * j as f64).collect();

    // analytic: full gradient folded through the transpose
    let mut x = vec![0.0; 5];
    red.expand(&r0, &mut x);
    let mut g_full = vec![0.0; 5];
    s.objective(&x, Some(&mut g_full));
    let mut rg = vec![0.0; rdim];
    red.fold_gradient(&g_full, &mut rg);

    // numeric: central difference of E(expand(r))
    let mut r = r0.clone();
    for j in 0..rdim {
        r[j] = r0[j] + EPS;
        red.expand(&r, &mut x);
        let f_p = s.objective(&x, None);
        r[j] = r0[j] - EPS;
        red.expand(&r, &mut x);
        let f_n = s.objective(&x, None);
        r[j] = r0[j];

        let num = (f_p - f_n) / (2.0 * EPS);
        let rel = (rg[j] - num).abs() / rg[j].abs().max(1e-8);
        assert!(rel < TOL, "reduced grad [{j}]: analytic {} vs numeric {num}", rg[j]);
    }
}

// ─────────────────────────────────────────────────────────────
//  Local solver
// ─────────────────────────────────────────────────────────────

fn make_interval_solver() -> LocalSolver {
    let mut s = LocalSolver::new();
    s.allocate(4);
    for (i, c) in [4.0, 8.0, 12.0, 16.0].into_iter().enumerate() {
        s.set_course(i, c).unwrap();
    }
    s.set_start(4.0);
    s.set_end(16.0);
    s.set_shaping(2.0);
    s
}

#[test]
fn local_objective_gradient() {
    let s = make_interval_solver();
    let x = [4.4, 7.1, 12.9, 15.3];
    let f = |x: &[f64], grad: Option<&mut [f64]>| s.objective(x, grad);
    let err = gradient_error(&f, &x, EPS, true);
    assert!(err < TOL, "objective gradient error {err}");
}

#[test]
fn local_ratio_bound_gradients() {
    let s = make_interval_solver();
    let x = [4.4, 7.1, 12.9, 15.3];
    let bounds = [
        CallbackData::SeqBound { index: 0, kind: BoundKind::FirstMin },
        CallbackData::SeqBound { index: 0, kind: BoundKind::FirstMax },
        CallbackData::SeqBound { index: 1, kind: BoundKind::NextMin },
        CallbackData::SeqBound { index: 1, kind: BoundKind::NextMax },
        CallbackData::SeqBound { index: 3, kind: BoundKind::LastMin },
        CallbackData::SeqBound { index: 3, kind: BoundKind::LastMax },
    ];
    for data in bounds {
        let f = |x: &[f64], grad: Option<&mut [f64]>| s.constraint(&data, x, grad);
        let err = gradient_error(&f, &x, EPS, true);
        assert!(err < TOL, "bound {data:?} gradient error {err}");
    }
}

#[test]
fn local_check_gradient_reports_small_error() {
    let s = make_interval_solver();
    let err = s.check_gradient(false, EPS);
    assert!(err < TOL, "check_gradient reported {err}");
}

// ─────────────────────────────────────────────────────────────
//  Short-row solver
// ─────────────────────────────────────────────────────────────

#[test]
fn shortrow_l2_gradient() {
    let mut s = ShortRowSolver::new();
    s.allocate(4);
    for (i, c) in [3.0, 5.0, 2.0, 6.0].into_iter().enumerate() {
        s.set_wale(i, c).unwrap();
    }
    s.set_circular(true);
    let x = [2.7, 5.4, 2.2, 5.8];
    let f = |x: &[f64], grad: Option<&mut [f64]>| s.objective(x, grad);
    let err = gradient_error(&f, &x, EPS, true);
    assert!(err < TOL, "L2 gradient error {err}");
}

/// L1 simplicity is non-smooth at equal neighbors, so the check point
/// keeps every adjacent pair strictly apart.
#[test]
fn shortrow_l1_gradient_away_from_kinks() {
    let mut s = ShortRowSolver::new();
    s.allocate(4);
    for (i, c) in [3.0, 5.0, 2.0, 6.0].into_iter().enumerate() {
        s.set_wale(i, c).unwrap();
    }
    s.set_circular(true);
    s.set_simplicity_power(1);
    let x = [2.5, 5.5, 1.75, 6.25];
    let f = |x: &[f64], grad: Option<&mut [f64]>| s.objective(x, grad);
    let err = gradient_error(&f, &x, EPS, false);
    assert!(err < TOL, "L1 gradient error {err}");
}

#[test]
fn shortrow_check_gradient_reports_small_error() {
    let mut s = ShortRowSolver::new();
    s.allocate(3);
    for (i, c) in [1.0, 10.0, 1.0].into_iter().enumerate() {
        s.set_wale(i, c).unwrap();
    }
    let err = s.check_gradient(false, EPS);
    assert!(err < TOL, "check_gradient reported {err}");
}
