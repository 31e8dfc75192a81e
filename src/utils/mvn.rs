use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;
use crate::utils::linalg::{log_dmvnorm, partial_cholesky};

/// Multivariate normal with a possibly singular covariance.
///
/// Coordinates whose covariance diagonal is zero are treated as point masses
/// at the mean, so initial state distributions with fixed components sample
/// and evaluate correctly.
pub struct MultiVariateNormal {
    mean: DVector<f64>,
    lower: DMatrix<f64>,
}

impl MultiVariateNormal {
    pub fn new(mean: &DVector<f64>, cov: &DMatrix<f64>) -> Result<Self> {
        Ok(Self {
            mean: mean.clone(),
            lower: partial_cholesky(cov)?,
        })
    }

    pub fn sample(&self, rng: &mut StdRng) -> DVector<f64> {
        let u = DVector::from_fn(self.mean.len(), |_, _| rng.sample(StandardNormal));
        &self.mean + &self.lower * u
    }

    /// Log-density on the non-degenerate subspace.
    pub fn log_pdf(&self, x: &DVector<f64>) -> f64 {
        log_dmvnorm(x, &self.mean, &self.lower)
    }
}
