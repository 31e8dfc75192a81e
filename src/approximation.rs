//! Local Gaussian approximation of non-Gaussian models, used as an importance
//! proposal by the ψ-filter and as the surrogate target of the approximate
//! samplers.

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::kalman::KalmanFilter;
use crate::models::{Distribution, LatentLinear, LinearGaussian, NonGaussian};
use crate::utils::linalg::log_dnorm;

/// Pseudo-Gaussian model matching the first two derivatives of the
/// observation log-density at the mode. Borrows the backbone of the model it
/// approximates, so the whole Kalman engine applies to it directly.
pub struct GaussianApprox<'a, M: NonGaussian> {
    base: &'a M,
    y: DVector<f64>,
    h: Vec<f64>,
    hh: Vec<f64>,
    /// Signal mode (including the regression mean) the expansion is built at.
    pub mode: DVector<f64>,
    /// Log-weight base: sum over observed times of the non-Gaussian minus the
    /// pseudo-Gaussian observation log-density at the mode.
    pub scaling: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub trait Approximate: NonGaussian + Sized {
    /// Iteratively reweighted approximation: rebuild the pseudo-observations
    /// at the current mode, smooth, move the mode, until the largest relative
    /// change drops below `conv_tol` or `max_iter` is hit. `max_iter = 0`
    /// builds the expansion at `initial_mode` without iterating.
    fn approximate(
        &self,
        initial_mode: &DVector<f64>,
        max_iter: usize,
        conv_tol: f64,
    ) -> GaussianApprox<'_, Self>;
}

impl<M: NonGaussian> Approximate for M {
    fn approximate(
        &self,
        initial_mode: &DVector<f64>,
        max_iter: usize,
        conv_tol: f64,
    ) -> GaussianApprox<'_, Self> {
        let n = self.series_len();
        let mut mode = initial_mode.clone();
        let mut approx = build(self, &mode);
        let mut converged = max_iter == 0;
        let mut iterations = 0;
        for iter in 1..=max_iter {
            iterations = iter;
            let alphahat = approx.fast_smoother();
            let mut new_mode = DVector::zeros(n);
            let mut rel_change: f64 = 0.0;
            for t in 0..n {
                new_mode[t] = self.signal(t, &alphahat.column(t).clone_owned());
                let denom = mode[t].abs().max(1e-10);
                rel_change = rel_change.max((new_mode[t] - mode[t]).abs() / denom);
            }
            mode = new_mode;
            approx = build(self, &mode);
            if rel_change < conv_tol {
                converged = true;
                break;
            }
        }
        if !converged {
            warn!("Gaussian approximation did not converge in {max_iter} iterations");
        }
        approx.iterations = iterations;
        approx.converged = converged;
        approx
    }
}

fn build<'a, M: NonGaussian>(model: &'a M, mode: &DVector<f64>) -> GaussianApprox<'a, M> {
    let n = model.series_len();
    let mut y = DVector::from_element(n, f64::NAN);
    let mut h = vec![1.0; n];
    let mut hh = vec![1.0; n];
    let mut scaling = 0.0;
    for t in 0..n {
        if model.y_raw(t).is_finite() {
            let (ytilde, var) = model.pseudo_obs(t, mode[t]);
            y[t] = ytilde;
            hh[t] = var;
            h[t] = var.sqrt();
            scaling += model.log_obs_density(t, mode[t]) - log_dnorm(ytilde, mode[t], h[t]);
        }
    }
    GaussianApprox {
        base: model,
        y,
        h,
        hh,
        mode: mode.clone(),
        scaling,
        iterations: 0,
        converged: false,
    }
}

impl<M: NonGaussian> LatentLinear for GaussianApprox<'_, M> {
    fn series_len(&self) -> usize {
        self.base.series_len()
    }

    fn state_dim(&self) -> usize {
        self.base.state_dim()
    }

    fn noise_dim(&self) -> usize {
        self.base.noise_dim()
    }

    fn y_raw(&self, t: usize) -> f64 {
        self.y[t]
    }

    fn xbeta(&self, t: usize) -> f64 {
        self.base.xbeta(t)
    }

    fn z_col(&self, t: usize) -> &DVector<f64> {
        self.base.z_col(t)
    }

    fn t_slice(&self, t: usize) -> &DMatrix<f64> {
        self.base.t_slice(t)
    }

    fn r_slice(&self, t: usize) -> &DMatrix<f64> {
        self.base.r_slice(t)
    }

    fn rr_slice(&self, t: usize) -> &DMatrix<f64> {
        self.base.rr_slice(t)
    }

    fn a1(&self) -> &DVector<f64> {
        self.base.a1()
    }

    fn p1(&self) -> &DMatrix<f64> {
        self.base.p1()
    }
}

impl<M: NonGaussian> LinearGaussian for GaussianApprox<'_, M> {
    fn h_at(&self, t: usize) -> f64 {
        self.h[t]
    }

    fn hh_at(&self, t: usize) -> f64 {
        self.hh[t]
    }
}

/// A crude but serviceable starting mode for the approximation, on the signal
/// scale of each family.
pub fn default_initial_mode<M: NonGaussian>(model: &M) -> DVector<f64> {
    let n = model.series_len();
    DVector::from_fn(n, |t, _| {
        let y = model.y_raw(t);
        if !y.is_finite() {
            return 0.0;
        }
        let phi = model.phi_at(t);
        match model.distribution() {
            Distribution::Poisson | Distribution::NegativeBinomial => ((y + 0.1) / phi).ln(),
            Distribution::Binomial => {
                let p = (y + 0.5) / (phi + 1.0);
                (p / (1.0 - p)).ln()
            }
            Distribution::StochasticVolatility => (y * y).max(1e-4).ln(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Distribution, NonGaussianModel};
    use crate::prior::{Prior, PriorSpec};

    fn poisson_model() -> NonGaussianModel {
        let prior = PriorSpec::new(vec![Prior::Normal { mean: 0.0, sd: 2.0 }]).unwrap();
        NonGaussianModel::local_level(
            nalgebra::DVector::from_vec(vec![0.0, 1.0, 2.0, 1.0, 3.0]),
            0.3,
            0.0,
            10.0,
            Distribution::Poisson,
            vec![1.0],
            prior,
        )
        .unwrap()
    }

    #[test]
    fn poisson_approximation_converges_quickly() {
        let model = poisson_model();
        let mode0 = default_initial_mode(&model);
        let approx = model.approximate(&mode0, 50, 1e-8);
        assert!(approx.converged);
        assert!(approx.iterations <= 10);
        assert!(approx.scaling.is_finite());
        assert!(approx.mode.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn converged_mode_is_a_fixed_point_of_the_smoother() {
        let model = poisson_model();
        let mode0 = default_initial_mode(&model);
        let approx = model.approximate(&mode0, 100, 1e-10);
        let alphahat = approx.fast_smoother();
        for t in 0..model.series_len() {
            let signal = model.signal(t, &alphahat.column(t).clone_owned());
            assert!((signal - approx.mode[t]).abs() / approx.mode[t].abs().max(1e-10) < 1e-6);
        }
    }

    #[test]
    fn zero_iterations_keeps_the_initial_mode() {
        let model = poisson_model();
        let mode0 = default_initial_mode(&model);
        let approx = model.approximate(&mode0, 0, 1e-8);
        assert_eq!(approx.mode, mode0);
        assert!(approx.converged);
    }
}
