//! Posterior-predictive forecasts. The model's series is expected to carry
//! the forecast horizon as trailing missing observations (with regressors
//! supplied over the full span), so the filters run straight through it.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Binomial, Distribution as RandDistribution, Poisson, StandardNormal};
use statrs::function::erf::erf;

use crate::error::{Error, Result};
use crate::kalman::KalmanFilter;
use crate::models::{Distribution, LinearGaussian, NonGaussian, StateSpace};
use crate::particle::randn_vec;

/// Whether forecast uncertainty covers the state only or the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalType {
    State,
    Observation,
}

/// Closed-form forecast: per-sample predictive means and standard deviations
/// over the horizon, plus posterior mixture quantiles.
pub struct Forecast {
    /// `n_samples x n_ahead` predictive means.
    pub mean: DMatrix<f64>,
    /// `n_samples x n_ahead` predictive standard deviations.
    pub sd: DMatrix<f64>,
    /// `n_ahead x probs` quantiles of the posterior predictive mixture.
    pub intervals: DMatrix<f64>,
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Quantile of a weighted mixture of normals by bisection on its CDF.
fn mixture_quantile(means: &[f64], sds: &[f64], weights: &[f64], prob: f64) -> f64 {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for (m, s) in means.iter().zip(sds) {
        lo = lo.min(m - 10.0 * s - 1e-8);
        hi = hi.max(m + 10.0 * s + 1e-8);
    }
    let cdf = |q: f64| -> f64 {
        means
            .iter()
            .zip(sds)
            .zip(weights)
            .map(|((m, s), w)| w * norm_cdf((q - m) / s.max(1e-12)))
            .sum()
    };
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if cdf(mid) < prob {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

fn validate_horizon(n: usize, n_ahead: usize, probs: &[f64]) -> Result<()> {
    if n_ahead == 0 || n_ahead > n {
        return Err(Error::OutOfRange {
            name: "n_ahead",
            range: "[1, n]",
            value: n_ahead as f64,
        });
    }
    for &p in probs {
        if !(p > 0.0 && p < 1.0) {
            return Err(Error::OutOfRange {
                name: "probs",
                range: "(0, 1)",
                value: p,
            });
        }
    }
    Ok(())
}

/// Gaussian closed-form forecast over the trailing `n_ahead` steps: for each
/// posterior sample run the filter and read off the predictive mean `Z'a`
/// (plus the regression mean) and variance `Z'PZ` (plus the observation
/// variance for observation intervals); quantiles are solved on the
/// count-weighted mixture.
pub fn predict_interval<M: LinearGaussian + StateSpace>(
    model: &mut M,
    theta: &[DVector<f64>],
    counts: &[u32],
    probs: &[f64],
    n_ahead: usize,
    interval: IntervalType,
) -> Result<Forecast> {
    let n = model.series_len();
    validate_horizon(n, n_ahead, probs)?;
    if theta.is_empty() || theta.len() != counts.len() {
        return Err(Error::ShapeMismatch(
            "theta and counts must be aligned and non-empty".into(),
        ));
    }

    let n_samples = theta.len();
    let mut mean = DMatrix::zeros(n_samples, n_ahead);
    let mut sd = DMatrix::zeros(n_samples, n_ahead);
    for (j, sample) in theta.iter().enumerate() {
        model.update(sample);
        let out = model.filter();
        for h in 0..n_ahead {
            let t = n - n_ahead + h;
            let z = model.z_col(t);
            let mut var = z.dot(&(&out.pt[t] * z));
            if interval == IntervalType::Observation {
                var += model.hh_at(t);
            }
            mean[(j, h)] = z.dot(&out.at.column(t).clone_owned()) + model.xbeta(t);
            sd[(j, h)] = var.max(0.0).sqrt();
        }
    }

    let total: f64 = counts.iter().map(|&c| c as f64).sum();
    let weights: Vec<f64> = counts.iter().map(|&c| c as f64 / total).collect();
    let mut intervals = DMatrix::zeros(n_ahead, probs.len());
    for h in 0..n_ahead {
        let means: Vec<f64> = (0..n_samples).map(|j| mean[(j, h)]).collect();
        let sds: Vec<f64> = (0..n_samples).map(|j| sd[(j, h)]).collect();
        for (q, &p) in probs.iter().enumerate() {
            intervals[(h, q)] = mixture_quantile(&means, &sds, &weights, p);
        }
    }
    Ok(Forecast { mean, sd, intervals })
}

/// Simulation forecast for Gaussian models: propagate the transition forward
/// from sampled terminal states and add observation noise when requested.
/// One path per stored sample per visit count.
pub fn predict_sample<M: LinearGaussian + StateSpace>(
    model: &mut M,
    theta: &[DVector<f64>],
    alpha_last: &[DVector<f64>],
    counts: &[u32],
    n_ahead: usize,
    interval: IntervalType,
    rng: &mut StdRng,
) -> Result<Vec<DVector<f64>>> {
    let n = model.series_len();
    validate_horizon(n.saturating_sub(1), n_ahead, &[])?;
    if theta.len() != alpha_last.len() || theta.len() != counts.len() {
        return Err(Error::ShapeMismatch(
            "theta, alpha_last and counts must be aligned".into(),
        ));
    }
    let k = model.noise_dim();
    let mut paths = Vec::new();
    for ((sample, a0), &count) in theta.iter().zip(alpha_last).zip(counts) {
        model.update(sample);
        for _ in 0..count {
            let mut state = a0.clone();
            let mut path = DVector::zeros(n_ahead);
            for h in 0..n_ahead {
                let t = n - n_ahead + h;
                state = model.t_slice(t - 1) * &state + model.r_slice(t - 1) * randn_vec(k, rng);
                path[h] = model.signal(t, &state);
                if interval == IntervalType::Observation {
                    let eps: f64 = rng.sample(StandardNormal);
                    path[h] += model.h_at(t) * eps;
                }
            }
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Simulation forecast for non-Gaussian models: propagate the latent process
/// forward and, for observation intervals, sample from the observation
/// family.
pub fn predict_sample_nongaussian<M: NonGaussian + StateSpace>(
    model: &mut M,
    theta: &[DVector<f64>],
    alpha_last: &[DVector<f64>],
    counts: &[u32],
    n_ahead: usize,
    interval: IntervalType,
    rng: &mut StdRng,
) -> Result<Vec<DVector<f64>>> {
    let n = model.series_len();
    validate_horizon(n.saturating_sub(1), n_ahead, &[])?;
    if theta.len() != alpha_last.len() || theta.len() != counts.len() {
        return Err(Error::ShapeMismatch(
            "theta, alpha_last and counts must be aligned".into(),
        ));
    }
    let k = model.noise_dim();
    let mut paths = Vec::new();
    for ((sample, a0), &count) in theta.iter().zip(alpha_last).zip(counts) {
        model.update(sample);
        for _ in 0..count {
            let mut state = a0.clone();
            let mut path = DVector::zeros(n_ahead);
            for h in 0..n_ahead {
                let t = n - n_ahead + h;
                state = model.t_slice(t - 1) * &state + model.r_slice(t - 1) * randn_vec(k, rng);
                let signal = model.signal(t, &state);
                path[h] = if interval == IntervalType::Observation {
                    sample_observation(model, t, signal, rng)?
                } else {
                    signal
                };
            }
            paths.push(path);
        }
    }
    Ok(paths)
}

fn sample_observation<M: NonGaussian>(
    model: &M,
    t: usize,
    signal: f64,
    rng: &mut StdRng,
) -> Result<f64> {
    let phi = model.phi_at(t);
    let bad = |value: f64| Error::OutOfRange {
        name: "observation parameter",
        range: "family dependent",
        value,
    };
    match model.distribution() {
        Distribution::Poisson => {
            let lambda = phi * signal.exp();
            let dist = Poisson::new(lambda).map_err(|_| bad(lambda))?;
            Ok(dist.sample(rng))
        }
        Distribution::Binomial => {
            let p = signal.exp() / (1.0 + signal.exp());
            let dist = Binomial::new(phi.round() as u64, p).map_err(|_| bad(p))?;
            Ok(dist.sample(rng) as f64)
        }
        Distribution::NegativeBinomial => {
            // gamma-Poisson mixture
            let lambda = signal.exp();
            let gamma = rand_distr::Gamma::new(phi, lambda / phi).map_err(|_| bad(phi))?;
            let rate: f64 = gamma.sample(rng);
            if rate <= 0.0 {
                return Ok(0.0);
            }
            let dist = Poisson::new(rate).map_err(|_| bad(rate))?;
            Ok(dist.sample(rng))
        }
        Distribution::StochasticVolatility => {
            let eps: f64 = rng.sample(StandardNormal);
            Ok(phi * (signal / 2.0).exp() * eps)
        }
    }
}
