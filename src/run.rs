//! Entry points wiring models to sampling strategies, with all configuration
//! validated up front.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::approximation::Approximate;
use crate::error::{Error, Result};
use crate::kalman::KalmanFilter;
use crate::mcmc::{Estimate, Mcmc, McmcSettings};
use crate::models::{
    GaussianModel, LatentLinear, LinearGaussian, NonGaussian, NonGaussianModel, SdeModel,
};
use crate::particle::{
    filter_smoother, filter_summary, weighted_summary, GaussianParticle, NonGaussianParticle,
    ParticleOutput,
};
use crate::predict::{predict_interval, Forecast, IntervalType};
use crate::utils::linalg::log_dnorm;

/// Particle back-end used by the pseudo-marginal, delayed-acceptance and
/// importance-sampling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMethod {
    /// ψ-auxiliary particle filter against the local Gaussian approximation.
    Psi,
    /// Bootstrap particle filter.
    Bsf,
    /// Simulation-smoother importance sampling (IS correction only).
    Spdk,
}

/// Settings for the local Gaussian approximation of non-Gaussian models.
/// With `local_approx` unset the expansion is built once at `initial_mode`
/// without iterating.
#[derive(Debug, Clone)]
pub struct ApproxSettings {
    pub initial_mode: DVector<f64>,
    pub max_iter: usize,
    pub conv_tol: f64,
    pub local_approx: bool,
}

impl ApproxSettings {
    fn effective_iter(&self) -> usize {
        if self.local_approx {
            self.max_iter
        } else {
            0
        }
    }
}

/// Posterior sample container returned by every MCMC entry point.
pub struct McmcOutput {
    /// `n_stored x p` unique parameter samples.
    pub theta: DMatrix<f64>,
    /// Stored log-posterior values (up to the importance correction).
    pub posterior: DVector<f64>,
    /// Visit counts per stored sample.
    pub counts: Vec<u32>,
    /// Sampled state trajectories, when the strategy produces them.
    pub alpha: Vec<DMatrix<f64>>,
    /// Importance weights (IS-corrected strategies only).
    pub weights: Option<DVector<f64>>,
    pub acceptance_rate: f64,
    /// Adapted proposal covariance root.
    pub s: DMatrix<f64>,
}

fn into_output(chain: Mcmc) -> McmcOutput {
    let n_stored = chain.theta.len();
    let p = chain.theta.first().map_or(0, |t| t.len());
    let mut theta = DMatrix::zeros(n_stored, p);
    for (i, sample) in chain.theta.iter().enumerate() {
        for j in 0..p {
            theta[(i, j)] = sample[j];
        }
    }
    McmcOutput {
        theta,
        posterior: DVector::from_vec(chain.posterior.clone()),
        counts: chain.counts.clone(),
        alpha: chain.alpha,
        weights: if chain.weights.is_empty() {
            None
        } else {
            Some(DVector::from_vec(chain.weights.clone()))
        },
        acceptance_rate: chain.acceptance_rate,
        s: chain.s,
    }
}

fn theta_rows(output: &McmcOutput) -> Vec<DVector<f64>> {
    (0..output.theta.nrows())
        .map(|i| output.theta.row(i).transpose())
        .collect()
}

fn check_positive(name: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::OutOfRange {
            name,
            range: "[1, inf)",
            value: 0.0,
        });
    }
    Ok(())
}

/// Exact-likelihood adaptive MH for Gaussian models; optionally draws state
/// trajectories for the stored samples afterwards, in parallel with one seed
/// per worker.
pub fn gaussian_mcmc(
    model: &mut GaussianModel,
    settings: &McmcSettings,
    sim_states: bool,
    nsim_states: usize,
    seeds: &[u64],
) -> Result<McmcOutput> {
    if model.prior().len() != model.n_par() {
        return Err(Error::PriorLength {
            expected: model.n_par(),
            found: model.prior().len(),
        });
    }
    let mut chain = Mcmc::new(settings.clone(), settings.n_thin == 1)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    chain.pseudo_marginal(
        model,
        |m, _| {
            Ok(Estimate {
                loglik: m.log_likelihood(),
                trajectory: None,
            })
        },
        &mut rng,
    )?;
    if sim_states {
        check_positive("nsim_states", nsim_states)?;
        chain.state_posterior(
            model,
            |m: &mut GaussianModel, nsim, rng: &mut StdRng| m.simulation_smoother(nsim, rng),
            nsim_states,
            seeds,
        )?;
    }
    Ok(into_output(chain))
}

/// Parameter chain plus the running posterior state summary (weighted
/// Welford over per-sample exact smoothing).
pub fn gaussian_mcmc_summary(
    model: &mut GaussianModel,
    settings: &McmcSettings,
) -> Result<(McmcOutput, DMatrix<f64>, Vec<DMatrix<f64>>)> {
    let output = gaussian_mcmc(model, settings, false, 1, &[])?;
    let mut chain = Mcmc::new(settings.clone(), settings.n_thin == 1)?;
    chain.theta = theta_rows(&output);
    chain.posterior = output.posterior.iter().copied().collect();
    chain.counts = output.counts.clone();
    let (alphahat, vt) = chain.summarize_states(model, |m| {
        let out = m.smoother();
        (out.alphahat, out.vt)
    });
    Ok((output, alphahat, vt))
}

fn nongaussian_estimator<'a>(
    method: SimulationMethod,
    nsim: usize,
    approx: &'a ApproxSettings,
) -> Result<
    impl FnMut(&mut NonGaussianModel, &mut StdRng) -> Result<Estimate> + 'a,
> {
    if method == SimulationMethod::Spdk {
        return Err(Error::Unsupported(
            "SPDK is only available for the IS-corrected sampler",
        ));
    }
    Ok(move |m: &mut NonGaussianModel, rng: &mut StdRng| {
        let out = match method {
            SimulationMethod::Psi => {
                let ap = m.approximate(&approx.initial_mode, approx.effective_iter(), approx.conv_tol);
                m.psi_filter(&ap, nsim, rng)?
            }
            _ => NonGaussianParticle::bsf_filter(m, nsim, rng)?,
        };
        let trajectory = if out.loglik.is_finite() {
            Some(out.sample_trajectory(rng))
        } else {
            None
        };
        Ok(Estimate {
            loglik: out.loglik,
            trajectory,
        })
    })
}

fn approx_loglik(m: &NonGaussianModel, approx: &ApproxSettings) -> f64 {
    let ap = m.approximate(&approx.initial_mode, approx.effective_iter(), approx.conv_tol);
    ap.log_likelihood() + ap.scaling
}

/// Pseudo-marginal MH for non-Gaussian models: the particle estimate stands
/// in for the likelihood and is retained on acceptance.
pub fn nongaussian_pm_mcmc(
    model: &mut NonGaussianModel,
    settings: &McmcSettings,
    method: SimulationMethod,
    nsim: usize,
    approx: &ApproxSettings,
) -> Result<McmcOutput> {
    check_positive("nsim", nsim)?;
    let mut chain = Mcmc::new(settings.clone(), true)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let estimator = nongaussian_estimator(method, nsim, approx)?;
    chain.pseudo_marginal(model, estimator, &mut rng)?;
    Ok(into_output(chain))
}

/// Delayed-acceptance MH: the approximation's Gaussian likelihood plus its
/// scaling screens proposals before the particle estimate is paid for.
pub fn nongaussian_da_mcmc(
    model: &mut NonGaussianModel,
    settings: &McmcSettings,
    method: SimulationMethod,
    nsim: usize,
    approx: &ApproxSettings,
) -> Result<McmcOutput> {
    check_positive("nsim", nsim)?;
    let mut chain = Mcmc::new(settings.clone(), true)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let estimator = nongaussian_estimator(method, nsim, approx)?;
    chain.delayed_acceptance(
        model,
        |m, _| Ok(approx_loglik(m, approx)),
        estimator,
        &mut rng,
    )?;
    Ok(into_output(chain))
}

/// IS-corrected approximate MH: a fast chain targets the approximate
/// posterior, then every unique sample gets an independent particle weight
/// (in parallel, deterministically seeded).
#[allow(clippy::too_many_arguments)]
pub fn nongaussian_is_mcmc(
    model: &mut NonGaussianModel,
    settings: &McmcSettings,
    method: SimulationMethod,
    nsim: usize,
    approx: &ApproxSettings,
    const_sim: bool,
    n_threads: usize,
) -> Result<McmcOutput> {
    check_positive("nsim", nsim)?;
    check_positive("n_threads", n_threads)?;
    let mut chain = Mcmc::new(settings.clone(), true)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    chain.pseudo_marginal(
        model,
        |m, _| {
            Ok(Estimate {
                loglik: approx_loglik(m, approx),
                trajectory: None,
            })
        },
        &mut rng,
    )?;

    let weight_fn = |m: &mut NonGaussianModel, nsim_i: usize, rng: &mut StdRng| {
        let ap = m.approximate(&approx.initial_mode, approx.effective_iter(), approx.conv_tol);
        match method {
            SimulationMethod::Psi => {
                let out = m.psi_filter(&ap, nsim_i, rng)?;
                let traj = out.loglik.is_finite().then(|| out.sample_trajectory(rng));
                Ok((out.loglik, traj))
            }
            SimulationMethod::Bsf => {
                let out = NonGaussianParticle::bsf_filter(&*m, nsim_i, rng)?;
                let traj = out.loglik.is_finite().then(|| out.sample_trajectory(rng));
                Ok((out.loglik, traj))
            }
            SimulationMethod::Spdk => {
                let draws = ap.simulation_smoother(nsim_i, rng)?;
                let n = m.series_len();
                let v: Vec<f64> = draws
                    .iter()
                    .map(|draw| {
                        (0..n)
                            .filter(|&t| m.y_raw(t).is_finite())
                            .map(|t| {
                                let signal = m.signal(t, &draw.column(t).clone_owned());
                                m.log_obs_density(t, signal)
                                    - log_dnorm(ap.y_raw(t), signal, ap.h_at(t))
                            })
                            .sum()
                    })
                    .collect();
                let mx = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if !mx.is_finite() {
                    return Ok((f64::NEG_INFINITY, None));
                }
                let shifted: Vec<f64> = v.iter().map(|&x| (x - mx).exp()).collect();
                let mean = shifted.iter().sum::<f64>() / shifted.len() as f64;
                let loglik = ap.log_likelihood() + mx + mean.ln();
                let sum: f64 = shifted.iter().sum();
                let wnorm: Vec<f64> = shifted.iter().map(|&x| x / sum).collect();
                let pick = crate::particle::sample_index(&wnorm, rng);
                Ok((loglik, Some(draws[pick].clone())))
            }
        }
    };
    chain.importance_correction(model, weight_fn, nsim, const_sim, n_threads, settings.seed)?;
    Ok(into_output(chain))
}

/// Pseudo-marginal MH for SDE models at a fixed refinement level.
pub fn sde_pm_mcmc(
    model: &mut SdeModel,
    settings: &McmcSettings,
    nsim: usize,
    level: u32,
) -> Result<McmcOutput> {
    check_positive("nsim", nsim)?;
    let mut chain = Mcmc::new(settings.clone(), true)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    chain.pseudo_marginal(
        model,
        |m, rng| {
            let out = m.bsf_filter(nsim, level, rng)?;
            let trajectory = if out.loglik.is_finite() {
                Some(out.sample_trajectory(rng))
            } else {
                None
            };
            Ok(Estimate {
                loglik: out.loglik,
                trajectory,
            })
        },
        &mut rng,
    )?;
    Ok(into_output(chain))
}

/// Delayed-acceptance MH for SDE models: a coarse-level filter screens
/// proposals for the fine-level estimate.
pub fn sde_da_mcmc(
    model: &mut SdeModel,
    settings: &McmcSettings,
    nsim: usize,
    l_coarse: u32,
    l_fine: u32,
) -> Result<McmcOutput> {
    check_positive("nsim", nsim)?;
    if l_coarse >= l_fine {
        return Err(Error::OutOfRange {
            name: "l_coarse",
            range: "[0, l_fine)",
            value: l_coarse as f64,
        });
    }
    let mut chain = Mcmc::new(settings.clone(), true)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    chain.delayed_acceptance(
        model,
        |m, rng| Ok(m.bsf_filter(nsim, l_coarse, rng)?.loglik),
        |m, rng| {
            let out = m.bsf_filter(nsim, l_fine, rng)?;
            let trajectory = if out.loglik.is_finite() {
                Some(out.sample_trajectory(rng))
            } else {
                None
            };
            Ok(Estimate {
                loglik: out.loglik,
                trajectory,
            })
        },
        &mut rng,
    )?;
    Ok(into_output(chain))
}

/// IS-corrected sampler for SDE models: a coarse-level chain is reweighted
/// with fine-level filter estimates.
#[allow(clippy::too_many_arguments)]
pub fn sde_is_mcmc(
    model: &mut SdeModel,
    settings: &McmcSettings,
    nsim: usize,
    l_coarse: u32,
    l_fine: u32,
    const_sim: bool,
    n_threads: usize,
) -> Result<McmcOutput> {
    check_positive("nsim", nsim)?;
    check_positive("n_threads", n_threads)?;
    if l_coarse >= l_fine {
        return Err(Error::OutOfRange {
            name: "l_coarse",
            range: "[0, l_fine)",
            value: l_coarse as f64,
        });
    }
    let mut chain = Mcmc::new(settings.clone(), true)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    chain.pseudo_marginal(
        model,
        |m, rng| {
            Ok(Estimate {
                loglik: m.bsf_filter(nsim, l_coarse, rng)?.loglik,
                trajectory: None,
            })
        },
        &mut rng,
    )?;
    chain.importance_correction(
        model,
        |m: &mut SdeModel, nsim_i: usize, rng: &mut StdRng| {
            let out = m.bsf_filter(nsim_i, l_fine, rng)?;
            let traj = out.loglik.is_finite().then(|| out.sample_trajectory(rng));
            Ok((out.loglik, traj))
        },
        nsim,
        const_sim,
        n_threads,
        settings.seed,
    )?;
    Ok(into_output(chain))
}

/// Filtered particle summaries for a Gaussian model.
pub fn bootstrap_filter_gaussian(
    model: &GaussianModel,
    nsim: usize,
    seed: u64,
) -> Result<(ParticleOutput, DMatrix<f64>, DMatrix<f64>)> {
    check_positive("nsim", nsim)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let out = GaussianParticle::bsf_filter(model, nsim, &mut rng)?;
    let (at, att, _, _) = filter_summary(&out);
    Ok((out, at, att))
}

/// Filtered particle summaries for a non-Gaussian model.
pub fn bootstrap_filter_nongaussian(
    model: &NonGaussianModel,
    nsim: usize,
    seed: u64,
) -> Result<(ParticleOutput, DMatrix<f64>, DMatrix<f64>)> {
    check_positive("nsim", nsim)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let out = NonGaussianParticle::bsf_filter(model, nsim, &mut rng)?;
    let (at, att, _, _) = filter_summary(&out);
    Ok((out, at, att))
}

/// Bootstrap filter for a callback-driven nonlinear model.
pub fn bootstrap_filter_nonlinear(
    model: &crate::models::NonlinearModel,
    nsim: usize,
    seed: u64,
) -> Result<(ParticleOutput, DMatrix<f64>, DMatrix<f64>)> {
    check_positive("nsim", nsim)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let out = model.bsf_filter(nsim, &mut rng)?;
    let (at, att, _, _) = filter_summary(&out);
    Ok((out, at, att))
}

/// Bootstrap filter for an SDE model at the given refinement level.
pub fn bootstrap_filter_sde(
    model: &SdeModel,
    nsim: usize,
    level: u32,
    seed: u64,
) -> Result<(ParticleOutput, DMatrix<f64>, DMatrix<f64>)> {
    check_positive("nsim", nsim)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let out = model.bsf_filter(nsim, level, &mut rng)?;
    let (at, att, _, _) = filter_summary(&out);
    Ok((out, at, att))
}

/// Particle smoothing: ancestor-traced trajectories summarized with the
/// terminal weights.
pub fn particle_smoother_gaussian(
    model: &GaussianModel,
    nsim: usize,
    seed: u64,
) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>, f64)> {
    check_positive("nsim", nsim)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = GaussianParticle::bsf_filter(model, nsim, &mut rng)?;
    filter_smoother(&mut out);
    let (alphahat, vt) = weighted_summary(&out);
    Ok((alphahat, vt, out.loglik))
}

/// Closed-form Gaussian forecast from a finished chain.
pub fn gaussian_predict(
    model: &mut GaussianModel,
    output: &McmcOutput,
    probs: &[f64],
    n_ahead: usize,
    interval: IntervalType,
) -> Result<Forecast> {
    predict_interval(
        model,
        &theta_rows(output),
        &output.counts,
        probs,
        n_ahead,
        interval,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approximation::default_initial_mode;
    use crate::models::Distribution;
    use crate::prior::{Prior, PriorSpec};
    use std::sync::Arc;

    fn settings(n_iter: usize, n_burnin: usize, p: usize, seed: u64) -> McmcSettings {
        McmcSettings {
            n_iter,
            n_burnin,
            n_thin: 1,
            gamma: 0.66,
            target_acceptance: 0.234,
            s0: DMatrix::identity(p, p) * 0.1,
            end_ram: false,
            seed,
        }
    }

    fn gaussian_model() -> GaussianModel {
        let prior = PriorSpec::new(vec![
            Prior::HalfNormal { sd: 2.0 },
            Prior::HalfNormal { sd: 2.0 },
        ])
        .unwrap();
        let y = DVector::from_vec(vec![
            0.29, 0.61, 0.76, 0.84, 1.12, 1.08, 1.35, 1.62, 1.41, 1.70, 1.86, 2.02, 1.95, 2.25,
            2.18, 2.45, 2.61, 2.44, 2.78, 2.95,
        ]);
        GaussianModel::local_level(y, 0.5, 0.3, 0.0, 2.0, prior).unwrap()
    }

    fn poisson_series() -> DVector<f64> {
        DVector::from_vec(vec![
            1.0, 0.0, 2.0, 1.0, 1.0, 3.0, 2.0, 1.0, 0.0, 2.0, 2.0, 4.0, 3.0, 2.0, 3.0, 5.0, 3.0,
            4.0, 2.0, 3.0,
        ])
    }

    fn poisson_model() -> NonGaussianModel {
        let prior = PriorSpec::new(vec![Prior::Normal { mean: -1.0, sd: 1.0 }]).unwrap();
        NonGaussianModel::local_level(
            poisson_series(),
            0.3,
            0.0,
            2.0,
            Distribution::Poisson,
            vec![1.0],
            prior,
        )
        .unwrap()
    }

    fn approx_settings(model: &NonGaussianModel) -> ApproxSettings {
        ApproxSettings {
            initial_mode: default_initial_mode(model),
            max_iter: 50,
            conv_tol: 1e-8,
            local_approx: true,
        }
    }

    #[test]
    fn gaussian_chain_with_states_obeys_the_storage_laws() {
        let mut model = gaussian_model();
        let cfg = settings(1500, 500, 2, 4);
        let output = gaussian_mcmc(&mut model, &cfg, true, 1, &[10, 20]).unwrap();
        let total: u32 = output.counts.iter().sum();
        assert_eq!(total as usize, 1000);
        assert!(output.acceptance_rate > 0.0 && output.acceptance_rate <= 1.0);
        assert_eq!(output.alpha.len(), output.theta.nrows());
        assert!(output.posterior.iter().all(|x| x.is_finite()));
        assert!(output.s.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn gaussian_chain_is_seed_deterministic() {
        let cfg = settings(800, 200, 2, 9);
        let mut a = gaussian_model();
        let mut b = gaussian_model();
        let out_a = gaussian_mcmc(&mut a, &cfg, false, 1, &[]).unwrap();
        let out_b = gaussian_mcmc(&mut b, &cfg, false, 1, &[]).unwrap();
        assert_eq!(out_a.theta, out_b.theta);
        assert_eq!(out_a.counts, out_b.counts);
    }

    #[test]
    fn gaussian_summary_produces_psd_diagonals() {
        let mut model = gaussian_model();
        let cfg = settings(600, 200, 2, 12);
        let (output, alphahat, vt) = gaussian_mcmc_summary(&mut model, &cfg).unwrap();
        assert!(output.theta.nrows() > 0);
        assert_eq!(alphahat.ncols(), 20);
        assert!(vt.iter().all(|v| v[(0, 0)] > 0.0));
    }

    #[test]
    fn pm_chain_on_poisson_counts_runs_with_both_backends() {
        for method in [SimulationMethod::Bsf, SimulationMethod::Psi] {
            let mut model = poisson_model();
            let approx = approx_settings(&model);
            let cfg = settings(400, 100, 1, 8);
            let output = nongaussian_pm_mcmc(&mut model, &cfg, method, 40, &approx).unwrap();
            let total: u32 = output.counts.iter().sum();
            assert_eq!(total as usize, 300, "{method:?}");
            assert_eq!(output.alpha.len(), output.theta.nrows());
            assert!(output.posterior.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn da_chain_runs_and_accepts_some_proposals() {
        let mut model = poisson_model();
        let approx = approx_settings(&model);
        let cfg = settings(400, 100, 1, 3);
        let output =
            nongaussian_da_mcmc(&mut model, &cfg, SimulationMethod::Psi, 40, &approx).unwrap();
        assert!(output.acceptance_rate > 0.0);
        let total: u32 = output.counts.iter().sum();
        assert_eq!(total as usize, 300);
    }

    #[test]
    fn is_correction_attaches_finite_weights_to_every_unique_sample() {
        for method in [
            SimulationMethod::Psi,
            SimulationMethod::Bsf,
            SimulationMethod::Spdk,
        ] {
            let mut model = poisson_model();
            let approx = approx_settings(&model);
            let cfg = settings(300, 100, 1, 15);
            let output =
                nongaussian_is_mcmc(&mut model, &cfg, method, 30, &approx, true, 2).unwrap();
            let weights = output.weights.as_ref().expect("weights");
            assert_eq!(weights.len(), output.theta.nrows(), "{method:?}");
            assert!(weights.iter().all(|&w| w.is_finite() && w >= 0.0));
            assert_eq!(output.alpha.len(), output.theta.nrows());
        }
    }

    #[test]
    fn is_and_pm_agree_on_the_posterior_mean() {
        let mut pm_model = poisson_model();
        let approx = approx_settings(&pm_model);
        let cfg = settings(1500, 500, 1, 42);
        let pm =
            nongaussian_pm_mcmc(&mut pm_model, &cfg, SimulationMethod::Psi, 50, &approx).unwrap();

        let mut is_model = poisson_model();
        let is = nongaussian_is_mcmc(
            &mut is_model,
            &cfg,
            SimulationMethod::Psi,
            50,
            &approx,
            true,
            2,
        )
        .unwrap();

        let pm_total: f64 = pm.counts.iter().map(|&c| c as f64).sum();
        let pm_mean: f64 = (0..pm.theta.nrows())
            .map(|i| pm.theta[(i, 0)] * pm.counts[i] as f64)
            .sum::<f64>()
            / pm_total;

        let is_weights = is.weights.as_ref().expect("weights");
        let is_total: f64 = (0..is.theta.nrows())
            .map(|i| is.counts[i] as f64 * is_weights[i])
            .sum();
        let is_mean: f64 = (0..is.theta.nrows())
            .map(|i| is.theta[(i, 0)] * is.counts[i] as f64 * is_weights[i])
            .sum::<f64>()
            / is_total;

        assert!(
            (pm_mean - is_mean).abs() < 0.5,
            "pm {pm_mean} vs is {is_mean}"
        );
    }

    #[test]
    fn spdk_is_rejected_outside_the_is_sampler() {
        let mut model = poisson_model();
        let approx = approx_settings(&model);
        let cfg = settings(200, 50, 1, 2);
        assert!(matches!(
            nongaussian_pm_mcmc(&mut model, &cfg, SimulationMethod::Spdk, 20, &approx),
            Err(Error::Unsupported(_))
        ));
    }

    fn ou_sde() -> SdeModel {
        let drift: crate::models::sde::SdeFn =
            Arc::new(|x, theta: &DVector<f64>| theta[0] * (0.0 - x));
        let diffusion: crate::models::sde::SdeFn = Arc::new(|_, theta: &DVector<f64>| theta[1]);
        let ddiffusion: crate::models::sde::SdeFn = Arc::new(|_, _| 0.0);
        let obs: crate::models::sde::SdeObsFn = Arc::new(|y, x, _| log_dnorm(y, x, 0.5));
        let prior: crate::models::sde::SdePriorFn = Arc::new(|theta: &DVector<f64>| {
            if theta[0] > 0.0 && theta[0] < 5.0 && theta[1] > 0.0 && theta[1] < 5.0 {
                0.0
            } else {
                f64::NEG_INFINITY
            }
        });
        SdeModel::new(
            DVector::from_vec(vec![0.2, -0.1, 0.3, 0.1, -0.2, 0.0, 0.2, 0.1]),
            0.0,
            false,
            drift,
            diffusion,
            ddiffusion,
            obs,
            prior,
            DVector::from_vec(vec![0.8, 0.4]),
        )
        .unwrap()
    }

    #[test]
    fn sde_pm_chain_runs() {
        let mut model = ou_sde();
        let cfg = settings(300, 100, 2, 6);
        let output = sde_pm_mcmc(&mut model, &cfg, 60, 2).unwrap();
        let total: u32 = output.counts.iter().sum();
        assert_eq!(total as usize, 200);
        assert!(output.posterior.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn sde_da_and_is_chains_run_with_level_ordering() {
        let cfg = settings(250, 100, 2, 19);
        let mut model = ou_sde();
        let da = sde_da_mcmc(&mut model, &cfg, 50, 1, 3).unwrap();
        assert!(da.acceptance_rate >= 0.0);

        let mut model = ou_sde();
        let is = sde_is_mcmc(&mut model, &cfg, 50, 1, 3, true, 2).unwrap();
        assert!(is.weights.is_some());

        let mut model = ou_sde();
        assert!(sde_da_mcmc(&mut model, &cfg, 50, 3, 3).is_err());
    }

    #[test]
    fn particle_wrappers_produce_sane_summaries() {
        let model = gaussian_model();
        let (out, at, att) = bootstrap_filter_gaussian(&model, 500, 77).unwrap();
        assert!(out.loglik.is_finite());
        assert_eq!(at.ncols(), 20);
        assert_eq!(att.ncols(), 20);

        let (alphahat, vt, loglik) = particle_smoother_gaussian(&model, 500, 78).unwrap();
        assert!(loglik.is_finite());
        assert_eq!(alphahat.ncols(), 20);
        assert!(vt.iter().all(|v| v[(0, 0)] >= 0.0));
    }

    #[test]
    fn forecast_entry_point_runs_off_chain_output() {
        let prior = PriorSpec::new(vec![
            Prior::HalfNormal { sd: 2.0 },
            Prior::HalfNormal { sd: 2.0 },
        ])
        .unwrap();
        let y = DVector::from_vec(vec![0.3, 0.7, 1.1, 0.9, 1.4, f64::NAN, f64::NAN]);
        let mut model = GaussianModel::local_level(y, 0.5, 0.3, 0.0, 2.0, prior).unwrap();
        let cfg = settings(400, 100, 2, 23);
        let output = gaussian_mcmc(&mut model, &cfg, false, 1, &[]).unwrap();
        let forecast = gaussian_predict(
            &mut model,
            &output,
            &[0.05, 0.5, 0.95],
            2,
            IntervalType::Observation,
        )
        .unwrap();
        assert_eq!(forecast.intervals.nrows(), 2);
        assert_eq!(forecast.intervals.ncols(), 3);
        for h in 0..2 {
            assert!(forecast.intervals[(h, 0)] < forecast.intervals[(h, 2)]);
        }
    }
}
