//! The Metropolis-Hastings engine shared by every sampling strategy.
//!
//! One generic loop covers plain MH (exact log-likelihood closure) and
//! pseudo-marginal MH (particle estimate closure); a two-stage variant adds
//! delayed acceptance; an approximate chain plus a parallel importance
//! correction gives the IS-corrected strategy. All share the deduplicated
//! sample storage and the RAM proposal adaptation.

pub mod ram;
pub mod summary;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::mcmc::ram::adjust_s;
use crate::mcmc::summary::RunningSummary;
use crate::models::StateSpace;
use crate::particle::randn_vec;

/// Chain tuning constants, validated before the run starts.
#[derive(Debug, Clone)]
pub struct McmcSettings {
    pub n_iter: usize,
    pub n_burnin: usize,
    pub n_thin: usize,
    pub gamma: f64,
    pub target_acceptance: f64,
    pub s0: DMatrix<f64>,
    pub end_ram: bool,
    pub seed: u64,
}

impl McmcSettings {
    pub fn validate(&self, n_par: usize) -> Result<()> {
        if self.n_iter == 0 || self.n_burnin >= self.n_iter {
            return Err(Error::OutOfRange {
                name: "n_burnin",
                range: "[0, n_iter)",
                value: self.n_burnin as f64,
            });
        }
        if self.n_thin == 0 {
            return Err(Error::OutOfRange {
                name: "n_thin",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        if !(self.gamma > 0.5 && self.gamma <= 1.0) {
            return Err(Error::OutOfRange {
                name: "gamma",
                range: "(0.5, 1]",
                value: self.gamma,
            });
        }
        if !(self.target_acceptance > 0.0 && self.target_acceptance < 1.0) {
            return Err(Error::OutOfRange {
                name: "target_acceptance",
                range: "(0, 1)",
                value: self.target_acceptance,
            });
        }
        if self.s0.nrows() != n_par || self.s0.ncols() != n_par {
            return Err(Error::ProposalShape {
                expected: n_par,
                rows: self.s0.nrows(),
                cols: self.s0.ncols(),
            });
        }
        Ok(())
    }
}

/// A log-likelihood evaluation, possibly with a sampled state trajectory
/// attached (particle methods keep the trajectory of the retained estimate).
pub struct Estimate {
    pub loglik: f64,
    pub trajectory: Option<DMatrix<f64>>,
}

/// Chain state and sample storage.
///
/// Samples are stored deduplicated by default: a rejected step increments the
/// visit count of the last stored sample, so `sum(counts)` equals the number
/// of stored iterations. Thinning greater than one stores every retained
/// iteration separately and is rejected in deduplicated mode.
pub struct Mcmc {
    settings: McmcSettings,
    dedup: bool,
    pub s: DMatrix<f64>,
    pub theta: Vec<DVector<f64>>,
    pub posterior: Vec<f64>,
    pub counts: Vec<u32>,
    pub alpha: Vec<DMatrix<f64>>,
    pub weights: Vec<f64>,
    pub acceptance_rate: f64,
}

impl Mcmc {
    pub fn new(settings: McmcSettings, dedup: bool) -> Result<Self> {
        if dedup && settings.n_thin > 1 {
            return Err(Error::ThinnedBlockStorage);
        }
        let s = settings.s0.clone();
        Ok(Self {
            settings,
            dedup,
            s,
            theta: Vec::new(),
            posterior: Vec::new(),
            counts: Vec::new(),
            alpha: Vec::new(),
            weights: Vec::new(),
            acceptance_rate: 0.0,
        })
    }

    pub fn settings(&self) -> &McmcSettings {
        &self.settings
    }

    pub fn n_stored(&self) -> usize {
        self.theta.len()
    }

    fn record(
        &mut self,
        accepted_now: bool,
        theta: &DVector<f64>,
        posterior: f64,
        trajectory: Option<&DMatrix<f64>>,
    ) {
        if self.dedup && !accepted_now && !self.theta.is_empty() {
            if let Some(count) = self.counts.last_mut() {
                *count += 1;
            }
            return;
        }
        self.theta.push(theta.clone());
        self.posterior.push(posterior);
        self.counts.push(1);
        if let Some(traj) = trajectory {
            self.alpha.push(traj.clone());
        }
    }

    /// Random walk Metropolis-Hastings with a pluggable log-likelihood
    /// estimator. With an exact estimator this is plain MH; with an unbiased
    /// particle estimator it is pseudo-marginal MH, and the accepted estimate
    /// is retained so the chain targets the augmented joint.
    pub fn pseudo_marginal<M, F>(
        &mut self,
        model: &mut M,
        mut estimator: F,
        rng: &mut StdRng,
    ) -> Result<()>
    where
        M: StateSpace,
        F: FnMut(&mut M, &mut StdRng) -> Result<Estimate>,
    {
        let mut theta = model.theta();
        let p = theta.len();
        self.settings.validate(p)?;

        model.update(&theta);
        let mut est = estimator(model, rng)?;
        let mut prior = model.log_prior(&theta);
        let mut accepted = 0usize;

        if self.settings.n_burnin == 0 {
            self.record(true, &theta, prior + est.loglik, est.trajectory.as_ref());
        }

        for i in 1..self.settings.n_iter {
            let u = randn_vec(p, rng);
            let theta_prop = &theta + &self.s * &u;
            let mut accept_prob = 0.0;
            let mut accepted_now = false;
            if model.in_support(&theta_prop) {
                let prior_prop = model.log_prior(&theta_prop);
                model.update(&theta_prop);
                let est_prop = estimator(model, rng)?;
                let q = model.proposal_adjustment(&theta, &theta_prop);
                let log_ratio = est_prop.loglik + prior_prop - est.loglik - prior + q;
                accept_prob = log_ratio.exp().min(1.0);
                if rng.gen::<f64>() < accept_prob {
                    theta = theta_prop;
                    est = est_prop;
                    prior = prior_prop;
                    accepted_now = true;
                    if i >= self.settings.n_burnin {
                        accepted += 1;
                    }
                }
            }
            if i >= self.settings.n_burnin && i % self.settings.n_thin == 0 {
                self.record(accepted_now, &theta, prior + est.loglik, est.trajectory.as_ref());
            }
            if !self.settings.end_ram || i < self.settings.n_burnin {
                adjust_s(
                    &mut self.s,
                    &u,
                    accept_prob,
                    self.settings.target_acceptance,
                    i,
                    self.settings.gamma,
                );
            }
        }
        self.acceptance_rate =
            accepted as f64 / (self.settings.n_iter - self.settings.n_burnin) as f64;
        Ok(())
    }

    /// Two-stage Metropolis-Hastings: a cheap surrogate log-likelihood
    /// screens proposals, only survivors pay for the particle estimate. The
    /// proposal adapts on the first-stage acceptance probability.
    pub fn delayed_acceptance<M, S, F>(
        &mut self,
        model: &mut M,
        mut surrogate: S,
        mut estimator: F,
        rng: &mut StdRng,
    ) -> Result<()>
    where
        M: StateSpace,
        S: FnMut(&mut M, &mut StdRng) -> Result<f64>,
        F: FnMut(&mut M, &mut StdRng) -> Result<Estimate>,
    {
        let mut theta = model.theta();
        let p = theta.len();
        self.settings.validate(p)?;

        model.update(&theta);
        let mut sur = surrogate(model, rng)?;
        let mut est = estimator(model, rng)?;
        let mut prior = model.log_prior(&theta);
        let mut accepted = 0usize;

        if self.settings.n_burnin == 0 {
            self.record(true, &theta, prior + est.loglik, est.trajectory.as_ref());
        }

        for i in 1..self.settings.n_iter {
            let u = randn_vec(p, rng);
            let theta_prop = &theta + &self.s * &u;
            let mut stage_one = 0.0;
            let mut accepted_now = false;
            if model.in_support(&theta_prop) {
                let prior_prop = model.log_prior(&theta_prop);
                model.update(&theta_prop);
                let sur_prop = surrogate(model, rng)?;
                let q = model.proposal_adjustment(&theta, &theta_prop);
                stage_one = (sur_prop + prior_prop - sur - prior + q).exp().min(1.0);
                if rng.gen::<f64>() < stage_one {
                    let est_prop = estimator(model, rng)?;
                    let stage_two = ((est_prop.loglik - sur_prop) - (est.loglik - sur))
                        .exp()
                        .min(1.0);
                    if rng.gen::<f64>() < stage_two {
                        theta = theta_prop;
                        sur = sur_prop;
                        est = est_prop;
                        prior = prior_prop;
                        accepted_now = true;
                        if i >= self.settings.n_burnin {
                            accepted += 1;
                        }
                    }
                }
            }
            if i >= self.settings.n_burnin && i % self.settings.n_thin == 0 {
                self.record(accepted_now, &theta, prior + est.loglik, est.trajectory.as_ref());
            }
            if !self.settings.end_ram || i < self.settings.n_burnin {
                adjust_s(
                    &mut self.s,
                    &u,
                    stage_one,
                    self.settings.target_acceptance,
                    i,
                    self.settings.gamma,
                );
            }
        }
        self.acceptance_rate =
            accepted as f64 / (self.settings.n_iter - self.settings.n_burnin) as f64;
        Ok(())
    }

    /// Importance-sampling correction of an approximate chain: for each
    /// stored unique sample, evaluate a fresh exact estimate and weight by
    /// its ratio to the stored approximate posterior. Evaluations run in
    /// parallel with one derived RNG seed per sample, so the result does not
    /// depend on the number of threads. With `const_sim` unset the
    /// simulation size scales with the visit count.
    pub fn importance_correction<M, F>(
        &mut self,
        model: &M,
        weight_fn: F,
        nsim: usize,
        const_sim: bool,
        n_threads: usize,
        seed: u64,
    ) -> Result<()>
    where
        M: StateSpace + Clone + Send + Sync,
        F: Fn(&mut M, usize, &mut StdRng) -> Result<(f64, Option<DMatrix<f64>>)> + Sync,
    {
        if n_threads == 0 {
            return Err(Error::OutOfRange {
                name: "n_threads",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        let theta = &self.theta;
        let posterior = &self.posterior;
        let counts = &self.counts;
        let results: Result<Vec<(f64, Option<DMatrix<f64>>)>> = pool.install(|| {
            (0..theta.len())
                .into_par_iter()
                .map(|i| {
                    let mut local = model.clone();
                    let mut rng = StdRng::seed_from_u64(
                        seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                    );
                    let nsim_i = if const_sim {
                        nsim
                    } else {
                        nsim * counts[i] as usize
                    };
                    local.update(&theta[i]);
                    let (loglik, trajectory) = weight_fn(&mut local, nsim_i, &mut rng)?;
                    let approx_loglik = posterior[i] - local.log_prior(&theta[i]);
                    Ok(((loglik - approx_loglik).exp(), trajectory))
                })
                .collect()
        });
        let results = results?;
        self.weights = results.iter().map(|(w, _)| *w).collect();
        self.alpha = results
            .into_iter()
            .filter_map(|(_, traj)| traj)
            .collect();
        Ok(())
    }

    /// Parallel post-sampling of state trajectories: stored samples are split
    /// into contiguous ranges, one worker and one seeded RNG per range, so a
    /// fixed seed array gives bit-identical output for any thread count.
    pub fn state_posterior<M, F>(
        &mut self,
        model: &M,
        sampler: F,
        nsim_states: usize,
        seeds: &[u64],
    ) -> Result<()>
    where
        M: StateSpace + Clone + Send + Sync,
        F: Fn(&mut M, usize, &mut StdRng) -> Result<Vec<DMatrix<f64>>> + Sync,
    {
        let n_threads = seeds.len();
        if n_threads == 0 {
            return Err(Error::SeedCount {
                workers: 0,
                seeds: 0,
            });
        }
        let n_stored = self.theta.len();
        let chunk = n_stored.div_ceil(n_threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        let theta = &self.theta;
        let results: Result<Vec<Vec<DMatrix<f64>>>> = pool.install(|| {
            (0..n_threads)
                .into_par_iter()
                .map(|w| {
                    let mut out = Vec::new();
                    let mut local = model.clone();
                    let mut rng = StdRng::seed_from_u64(seeds[w]);
                    let lo = w * chunk;
                    let hi = ((w + 1) * chunk).min(n_stored);
                    for sample in theta.iter().take(hi).skip(lo) {
                        local.update(sample);
                        out.extend(sampler(&mut local, nsim_states, &mut rng)?);
                    }
                    Ok(out)
                })
                .collect()
        });
        self.alpha = results?.into_iter().flatten().collect();
        Ok(())
    }

    /// Weighted posterior summary of the states from per-sample exact
    /// smoothing (Gaussian models).
    pub fn summarize_states<M, F>(&self, model: &M, mut smooth: F) -> (DMatrix<f64>, Vec<DMatrix<f64>>)
    where
        M: StateSpace + Clone,
        F: FnMut(&mut M) -> (DMatrix<f64>, Vec<DMatrix<f64>>),
    {
        let mut local = model.clone();
        let mut acc: Option<RunningSummary> = None;
        for (i, sample) in self.theta.iter().enumerate() {
            local.update(sample);
            let (alphahat_i, vt_i) = smooth(&mut local);
            let weight = self.counts[i] as f64 * self.weights.get(i).copied().unwrap_or(1.0);
            let acc = acc.get_or_insert_with(|| {
                RunningSummary::new(alphahat_i.nrows(), alphahat_i.ncols())
            });
            acc.update(&alphahat_i, &vt_i, weight);
        }
        match acc {
            Some(acc) => acc.finish(),
            None => (DMatrix::zeros(0, 0), Vec::new()),
        }
    }

    /// Weighted posterior summary from stored sampled trajectories (particle
    /// strategies).
    pub fn summarize_sampled_states(&self) -> Option<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
        if self.alpha.is_empty() || self.alpha.len() != self.theta.len() {
            return None;
        }
        let mut acc = RunningSummary::new(self.alpha[0].nrows(), self.alpha[0].ncols());
        for (i, traj) in self.alpha.iter().enumerate() {
            let weight = self.counts[i] as f64 * self.weights.get(i).copied().unwrap_or(1.0);
            acc.update(traj, &[], weight);
        }
        Some(acc.finish())
    }
}
