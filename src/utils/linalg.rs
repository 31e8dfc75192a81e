//! Small numeric kernels shared by the filters and the sampler.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// Tolerance below which a prediction variance or a covariance diagonal is
/// treated as exactly zero.
pub const ZERO_TOL: f64 = 1e-8;

pub const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Scalar normal log-density.
pub fn log_dnorm(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * (LOG_2PI + z * z) - sd.ln()
}

/// Force exact symmetry, `(A + A') / 2`.
pub fn symmetrize(a: &mut DMatrix<f64>) {
    let n = a.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (a[(i, j)] + a[(j, i)]);
            a[(i, j)] = v;
            a[(j, i)] = v;
        }
    }
}

/// Lower Cholesky factor of a PSD matrix that may have zero rows/columns.
///
/// The factor is computed on the submatrix of indices with positive diagonal;
/// rows and columns with a (numerically) zero diagonal stay zero, i.e. those
/// coordinates carry a point mass.
pub fn partial_cholesky(a: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = a.nrows();
    let live: Vec<usize> = (0..n).filter(|&i| a[(i, i)] > ZERO_TOL).collect();
    let mut lower = DMatrix::zeros(n, n);
    if live.is_empty() {
        return Ok(lower);
    }
    let sub = a.select_rows(live.as_slice()).select_columns(live.as_slice());
    let chol = nalgebra::Cholesky::new(sub).ok_or(Error::NotPsd)?;
    let l = chol.l();
    for (bi, &i) in live.iter().enumerate() {
        for (bj, &j) in live.iter().enumerate().take(bi + 1) {
            lower[(i, j)] = l[(bi, bj)];
        }
    }
    Ok(lower)
}

/// Rank-1 update (or downdate) of a lower Cholesky factor in place, so that
/// `L L'` gains (loses) `x x'`.
///
/// A downdate that would destroy positive definiteness stops early, leaving
/// the factor valid for the part already processed.
pub fn chol_rank1_update(l: &mut DMatrix<f64>, mut x: DVector<f64>, downdate: bool) {
    let sign = if downdate { -1.0 } else { 1.0 };
    let n = l.nrows();
    for k in 0..n {
        let lkk = l[(k, k)];
        let r2 = lkk * lkk + sign * x[k] * x[k];
        if r2 <= 0.0 || !r2.is_finite() {
            return;
        }
        let r = r2.sqrt();
        let c = r / lkk;
        let s = x[k] / lkk;
        l[(k, k)] = r;
        for j in (k + 1)..n {
            l[(j, k)] = (l[(j, k)] + sign * s * x[j]) / c;
            x[j] = c * x[j] - s * l[(j, k)];
        }
    }
}

/// Multivariate normal log-density given a (partial) lower Cholesky factor of
/// the covariance. Coordinates with a zero factor row are point masses and do
/// not contribute; the value is a density on the live subspace.
pub fn log_dmvnorm(x: &DVector<f64>, mean: &DVector<f64>, lower: &DMatrix<f64>) -> f64 {
    let n = x.len();
    let diff = x - mean;
    let mut z = DVector::zeros(n);
    let mut logdet = 0.0;
    let mut live = 0usize;
    for i in 0..n {
        if lower[(i, i)] <= 0.0 {
            continue;
        }
        let mut s = diff[i];
        for j in 0..i {
            s -= lower[(i, j)] * z[j];
        }
        z[i] = s / lower[(i, i)];
        logdet += lower[(i, i)].ln();
        live += 1;
    }
    -0.5 * (live as f64 * LOG_2PI + z.dot(&z)) - logdet
}

/// One univariate Kalman update. Returns the filtered state, filtered
/// covariance and the log-likelihood contribution; a missing observation or a
/// degenerate prediction variance skips the update.
pub fn filter_update(
    y: f64,
    z: &DVector<f64>,
    hh: f64,
    a: &DVector<f64>,
    p: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>, f64) {
    let pz = p * z;
    let f = z.dot(&pz) + hh;
    if !y.is_finite() || f <= ZERO_TOL {
        return (a.clone(), p.clone(), 0.0);
    }
    let k = pz / f;
    let v = y - z.dot(a);
    let att = a + &k * v;
    let mut ptt = p - &k * k.transpose() * f;
    symmetrize(&mut ptt);
    let ll = -0.5 * (LOG_2PI + f.ln() + v * v / f);
    (att, ptt, ll)
}

/// One prediction step, `a <- T a`, `P <- T P T' + RR` (symmetrized).
pub fn filter_predict(
    t: &DMatrix<f64>,
    rr: &DMatrix<f64>,
    att: &DVector<f64>,
    ptt: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let a = t * att;
    let mut p = t * ptt * t.transpose() + rr;
    symmetrize(&mut p);
    (a, p)
}
