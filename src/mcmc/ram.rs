use nalgebra::{DMatrix, DVector};

use crate::utils::linalg::{chol_rank1_update, ZERO_TOL};

/// Robust Adaptive Metropolis update of the proposal covariance root:
/// `S S'` moves by `eta (alpha - target)` along the standardized proposal
/// direction, with `eta = min(1, p i^-gamma)`. Implemented as a rank-1
/// Cholesky update or downdate of `S`.
pub fn adjust_s(
    s: &mut DMatrix<f64>,
    u: &DVector<f64>,
    accept_prob: f64,
    target: f64,
    iteration: usize,
    gamma: f64,
) {
    let p = s.nrows() as f64;
    let change = accept_prob - target;
    let norm = u.norm();
    if norm < ZERO_TOL || change == 0.0 {
        return;
    }
    let eta = (p * (iteration as f64).powf(-gamma)).min(1.0);
    let v = &*s * u * ((eta * change.abs()).sqrt() / norm);
    chol_rank1_update(s, v, change < 0.0);
}
