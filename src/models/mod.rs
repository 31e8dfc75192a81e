//! Model families and the capability traits shared by the inference engines.

pub mod gaussian;
pub mod nongaussian;
pub mod nonlinear;
pub mod sde;

pub use gaussian::GaussianModel;
pub use nongaussian::NonGaussianModel;
pub use nonlinear::NonlinearModel;
pub use sde::SdeModel;

use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::ln_gamma;

use crate::utils::linalg::LOG_2PI;

/// Parameter interface every model exposes to the samplers.
///
/// `update` must be idempotent in `theta`: the sampler applies a proposal by
/// updating and reverts a rejection by updating with the retained value.
pub trait StateSpace {
    fn theta(&self) -> DVector<f64>;

    fn update(&mut self, theta: &DVector<f64>);

    fn log_prior(&self, theta: &DVector<f64>) -> f64;

    /// Whether `theta` lies in the prior support.
    fn in_support(&self, theta: &DVector<f64>) -> bool {
        self.log_prior(theta).is_finite()
    }

    /// Log-Jacobian correction for reparameterized sampling (e.g. parameters
    /// proposed in log space). Added to the acceptance log-ratio.
    fn proposal_adjustment(&self, current: &DVector<f64>, proposed: &DVector<f64>) -> f64 {
        let _ = (current, proposed);
        0.0
    }
}

/// Linear latent backbone: `alpha[t+1] = T[t] alpha[t] + R[t] eta[t]`,
/// observed through the loading `Z[t]` plus an optional regression mean.
///
/// Accessors take the raw time index; implementations fold in the
/// time-varying flag (`t * tv` indexing), so a static matrix is stored once.
pub trait LatentLinear {
    fn series_len(&self) -> usize;

    fn state_dim(&self) -> usize;

    fn noise_dim(&self) -> usize;

    /// Raw observation; NaN marks a missing value.
    fn y_raw(&self, t: usize) -> f64;

    fn xbeta(&self, t: usize) -> f64;

    fn z_col(&self, t: usize) -> &DVector<f64>;

    fn t_slice(&self, t: usize) -> &DMatrix<f64>;

    fn r_slice(&self, t: usize) -> &DMatrix<f64>;

    /// `R[t] R[t]'`, the state noise covariance.
    fn rr_slice(&self, t: usize) -> &DMatrix<f64>;

    fn a1(&self) -> &DVector<f64>;

    fn p1(&self) -> &DMatrix<f64>;

    /// Linear predictor of the observation equation.
    fn signal(&self, t: usize, alpha: &DVector<f64>) -> f64 {
        self.z_col(t).dot(alpha) + self.xbeta(t)
    }
}

/// Gaussian observation equation, `y[t] = Z[t]' alpha[t] + xbeta[t] + H[t] eps`.
pub trait LinearGaussian: LatentLinear {
    /// Observation noise standard deviation.
    fn h_at(&self, t: usize) -> f64;

    /// Observation noise variance.
    fn hh_at(&self, t: usize) -> f64;

    /// Observation with the regression mean removed. The filters run on this.
    fn obs(&self, t: usize) -> f64 {
        self.y_raw(t) - self.xbeta(t)
    }
}

/// Observation families for the non-Gaussian models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Poisson,
    Binomial,
    NegativeBinomial,
    StochasticVolatility,
}

/// Exponential-family or stochastic-volatility observation equation on top of
/// the linear backbone. `phi` is the exposure (Poisson), number of trials
/// (binomial), dispersion (negative binomial) or volatility scale (SV).
pub trait NonGaussian: LatentLinear {
    fn distribution(&self) -> Distribution;

    fn phi_at(&self, t: usize) -> f64;

    /// Observation log-density at signal `s` (assumes `y_raw(t)` is finite).
    fn log_obs_density(&self, t: usize, s: f64) -> f64 {
        let y = self.y_raw(t);
        let phi = self.phi_at(t);
        match self.distribution() {
            Distribution::Poisson => {
                let lambda = phi * s.exp();
                y * lambda.ln() - lambda - ln_gamma(y + 1.0)
            }
            Distribution::Binomial => {
                ln_gamma(phi + 1.0) - ln_gamma(y + 1.0) - ln_gamma(phi - y + 1.0) + y * s
                    - phi * s.exp().ln_1p()
            }
            Distribution::NegativeBinomial => {
                let lambda = s.exp();
                ln_gamma(y + phi) - ln_gamma(phi) - ln_gamma(y + 1.0)
                    + phi * (phi.ln() - (phi + lambda).ln())
                    + y * (lambda.ln() - (phi + lambda).ln())
            }
            Distribution::StochasticVolatility => {
                -0.5 * (LOG_2PI + s) - phi.ln() - y * y * (-s).exp() / (2.0 * phi * phi)
            }
        }
    }

    /// Pseudo-observation and pseudo-variance matching the first two
    /// derivatives of the observation log-density at `mode`. Used by the
    /// local Gaussian approximation.
    fn pseudo_obs(&self, t: usize, mode: f64) -> (f64, f64) {
        let y = self.y_raw(t);
        if !y.is_finite() {
            return (f64::NAN, 1.0);
        }
        let phi = self.phi_at(t);
        match self.distribution() {
            Distribution::Poisson => {
                let hh = 1.0 / (phi * mode.exp());
                (mode + y * hh - 1.0, hh)
            }
            Distribution::Binomial => {
                let p = mode.exp() / (1.0 + mode.exp());
                let hh = 1.0 / (phi * p * (1.0 - p));
                (mode + hh * (y - phi * p), hh)
            }
            Distribution::NegativeBinomial => {
                let lambda = mode.exp();
                let d1 = y - (y + phi) * lambda / (lambda + phi);
                let d2 = (y + phi) * phi * lambda / ((lambda + phi) * (lambda + phi));
                let hh = 1.0 / d2;
                (mode + hh * d1, hh)
            }
            Distribution::StochasticVolatility => {
                let ysq = (y * y).max(1e-8);
                let hh = 2.0 * phi * phi * mode.exp() / ysq;
                (mode + 1.0 - phi * phi * mode.exp() / ysq, hh)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Stub {
        y: f64,
        phi: f64,
        distribution: Distribution,
        z: DVector<f64>,
        t: DMatrix<f64>,
        a1: DVector<f64>,
        p1: DMatrix<f64>,
    }

    impl Stub {
        fn new(y: f64, phi: f64, distribution: Distribution) -> Self {
            Self {
                y,
                phi,
                distribution,
                z: DVector::from_element(1, 1.0),
                t: DMatrix::identity(1, 1),
                a1: DVector::zeros(1),
                p1: DMatrix::identity(1, 1),
            }
        }
    }

    impl LatentLinear for Stub {
        fn series_len(&self) -> usize {
            1
        }
        fn state_dim(&self) -> usize {
            1
        }
        fn noise_dim(&self) -> usize {
            1
        }
        fn y_raw(&self, _t: usize) -> f64 {
            self.y
        }
        fn xbeta(&self, _t: usize) -> f64 {
            0.0
        }
        fn z_col(&self, _t: usize) -> &DVector<f64> {
            &self.z
        }
        fn t_slice(&self, _t: usize) -> &DMatrix<f64> {
            &self.t
        }
        fn r_slice(&self, _t: usize) -> &DMatrix<f64> {
            &self.t
        }
        fn rr_slice(&self, _t: usize) -> &DMatrix<f64> {
            &self.t
        }
        fn a1(&self) -> &DVector<f64> {
            &self.a1
        }
        fn p1(&self) -> &DMatrix<f64> {
            &self.p1
        }
    }

    impl NonGaussian for Stub {
        fn distribution(&self) -> Distribution {
            self.distribution
        }
        fn phi_at(&self, _t: usize) -> f64 {
            self.phi
        }
    }

    #[test]
    fn poisson_log_density_matches_closed_form() {
        let model = Stub::new(3.0, 2.0, Distribution::Poisson);
        let s: f64 = 0.4;
        let lambda: f64 = 2.0 * s.exp();
        let expected = 3.0 * lambda.ln() - lambda - (6.0f64).ln();
        assert_relative_eq!(model.log_obs_density(0, s), expected, epsilon = 1e-12);
    }

    #[test]
    fn pseudo_obs_matches_derivatives_numerically() {
        for distribution in [
            Distribution::Poisson,
            Distribution::Binomial,
            Distribution::NegativeBinomial,
            Distribution::StochasticVolatility,
        ] {
            let y = if distribution == Distribution::StochasticVolatility {
                0.8
            } else {
                2.0
            };
            let phi = if distribution == Distribution::Binomial {
                5.0
            } else {
                1.5
            };
            let model = Stub::new(y, phi, distribution);
            let mode = 0.3;
            let eps = 1e-5;
            let f = |s: f64| model.log_obs_density(0, s);
            let d1 = (f(mode + eps) - f(mode - eps)) / (2.0 * eps);
            let d2 = (f(mode + eps) - 2.0 * f(mode) + f(mode - eps)) / (eps * eps);
            let (ytilde, hh) = model.pseudo_obs(0, mode);
            assert_relative_eq!(hh, -1.0 / d2, max_relative = 1e-4);
            assert_relative_eq!(ytilde, mode - d1 / d2, max_relative = 1e-4);
        }
    }
}
