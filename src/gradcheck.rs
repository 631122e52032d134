//! Central finite-difference gradient checking.
//!
//! Diagnostic only: the solvers expose `check_gradient` so hosts can
//! verify the analytic gradients of every active function against
//!
//! ```text
//! dE/dx_i  ≈  [ E(x + ε eᵢ) − E(x − ε eᵢ) ] / 2ε
//! ```
//!
//! without aborting a solve on drift.

/// Worst per-component gradient error of `f` at `x`.
///
/// `f` follows the objective convention: it accumulates its gradient
/// into the provided zeroed buffer.  With `relative` set, each
/// component error is divided by the analytic component when that
/// exceeds `1e-8` and reported as an absolute error otherwise.
pub fn gradient_error<F>(f: &F, x: &[f64], epsilon: f64, relative: bool) -> f64
where
    F: Fn(&[f64], Option<&mut [f64]>) -> f64 + ?Sized,
{
    let n = x.len();
    let mut grad_ana = vec![0.0; n];
    f(x, Some(&mut grad_ana));

    let mut x_delta = x.to_vec();
    let mut max_err = 0.0_f64;
    for i in 0..n {
        x_delta[i] = x[i] + epsilon;
        let f_p = f(&x_delta, None);
        x_delta[i] = x[i] - epsilon;
        let f_n = f(&x_delta, None);
        x_delta[i] = x[i];

        let grad_num = (f_p - f_n) / (2.0 * epsilon);
        let abs_err = (grad_ana[i] - grad_num).abs();
        let err = if relative && grad_ana[i] > 1e-8 {
            abs_err / grad_ana[i]
        } else {
            abs_err
        };
        max_err = max_err.max(err);
    }
    max_err
}
