//! Sequential Monte Carlo: bootstrap and ψ-auxiliary particle filters,
//! stratified resampling, trajectory smoothing and weighted summaries.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::approximation::GaussianApprox;
use crate::error::Result;
use crate::models::{LatentLinear, LinearGaussian, NonGaussian};
use crate::utils::linalg::{log_dmvnorm, log_dnorm, partial_cholesky, symmetrize};
use crate::utils::mvn::MultiVariateNormal;

/// Output of a particle filter run.
///
/// `alpha` holds one `m x cols` trajectory matrix per particle, `weights` the
/// per-step weights before normalization (log-shifted within each step, so
/// normalizing a column reproduces the true relative weights), `ancestors`
/// the resampling maps: `ancestors[t][i]` is the parent, at column `t`, of
/// particle `i` at column `t + 1`.
pub struct ParticleOutput {
    pub alpha: Vec<DMatrix<f64>>,
    pub weights: DMatrix<f64>,
    pub ancestors: Vec<Vec<usize>>,
    pub loglik: f64,
}

impl ParticleOutput {
    pub fn n_particles(&self) -> usize {
        self.alpha.len()
    }

    pub fn normalized_weights(&self, col: usize) -> Vec<f64> {
        let sum: f64 = self.weights.column(col).iter().sum();
        let sum = if sum > 0.0 { sum } else { 1.0 };
        self.weights.column(col).iter().map(|w| w / sum).collect()
    }

    /// Draw one trajectory by sampling a terminal particle proportional to
    /// the final weights and tracing its ancestor line.
    pub fn sample_trajectory(&self, rng: &mut StdRng) -> DMatrix<f64> {
        let cols = self.alpha[0].ncols();
        let m = self.alpha[0].nrows();
        let wnorm = self.normalized_weights(cols - 1);
        let mut idx = sample_index(&wnorm, rng);
        let mut traj = DMatrix::zeros(m, cols);
        for t in (0..cols).rev() {
            traj.set_column(t, &self.alpha[idx].column(t));
            if t > 0 {
                idx = self.ancestors[t - 1][idx];
            }
        }
        traj
    }
}

/// Stratified resampling: one uniform per stratum, `nu_i = (i + u_i) / N`,
/// returning for each stratum the smallest index whose cumulative weight
/// reaches it. Deterministic given the uniforms, variance below multinomial.
pub fn stratified_resample(wnorm: &[f64], u: &[f64]) -> Vec<usize> {
    let n = u.len();
    let mut out = vec![0usize; n];
    let mut cum = wnorm[0];
    let mut j = 0usize;
    for i in 0..n {
        let nu = (i as f64 + u[i]) / n as f64;
        while cum < nu && j + 1 < wnorm.len() {
            j += 1;
            cum += wnorm[j];
        }
        out[i] = j;
    }
    out
}

pub(crate) fn sample_index(wnorm: &[f64], rng: &mut StdRng) -> usize {
    let u: f64 = rng.gen();
    let mut cum = 0.0;
    for (i, w) in wnorm.iter().enumerate() {
        cum += w;
        if u < cum {
            return i;
        }
    }
    wnorm.len() - 1
}

pub(crate) fn randn_vec(len: usize, rng: &mut StdRng) -> DVector<f64> {
    DVector::from_fn(len, |_, _| rng.sample::<f64, _>(StandardNormal))
}

/// Shared bootstrap-filter core for models with a linear latent backbone:
/// propagate through the transition with process noise, weight with the
/// supplied observation log-density.
fn bsf_linear<M: LatentLinear + ?Sized>(
    model: &M,
    log_weight: impl Fn(usize, &DVector<f64>) -> f64,
    nsim: usize,
    rng: &mut StdRng,
) -> Result<ParticleOutput> {
    let n = model.series_len();
    let m = model.state_dim();
    let k = model.noise_dim();
    let initial = MultiVariateNormal::new(model.a1(), model.p1())?;

    let mut alpha = vec![DMatrix::zeros(m, n); nsim];
    let mut weights = DMatrix::zeros(nsim, n);
    let mut ancestors: Vec<Vec<usize>> = Vec::with_capacity(n.saturating_sub(1));
    let mut loglik = 0.0;

    let mut states: Vec<DVector<f64>> = (0..nsim).map(|_| initial.sample(rng)).collect();

    for t in 0..n {
        if t > 0 {
            let wnorm: Vec<f64> = {
                let sum: f64 = (0..nsim).map(|i| weights[(i, t - 1)]).sum();
                (0..nsim).map(|i| weights[(i, t - 1)] / sum).collect()
            };
            let u: Vec<f64> = (0..nsim).map(|_| rng.gen()).collect();
            let anc = stratified_resample(&wnorm, &u);
            let tm = model.t_slice(t - 1);
            let rm = model.r_slice(t - 1);
            states = anc
                .iter()
                .map(|&a| tm * &states[a] + rm * randn_vec(k, rng))
                .collect();
            ancestors.push(anc);
        }
        for (i, state) in states.iter().enumerate() {
            alpha[i].set_column(t, state);
        }
        if model.y_raw(t).is_finite() {
            let lw: Vec<f64> = states.iter().map(|s| log_weight(t, s)).collect();
            let mx = lw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if !mx.is_finite() {
                pad_degenerate(&mut ancestors, n, nsim);
                return Ok(ParticleOutput {
                    alpha,
                    weights,
                    ancestors,
                    loglik: f64::NEG_INFINITY,
                });
            }
            let mut sum = 0.0;
            for (i, &l) in lw.iter().enumerate() {
                let w = (l - mx).exp();
                weights[(i, t)] = w;
                sum += w;
            }
            loglik += mx + (sum / nsim as f64).ln();
        } else {
            for i in 0..nsim {
                weights[(i, t)] = 1.0;
            }
        }
    }
    Ok(ParticleOutput {
        alpha,
        weights,
        ancestors,
        loglik,
    })
}

pub(crate) fn pad_degenerate(ancestors: &mut Vec<Vec<usize>>, n: usize, nsim: usize) {
    while ancestors.len() + 1 < n {
        ancestors.push((0..nsim).collect());
    }
}

/// Bootstrap filter for linear Gaussian models; mostly useful for checking
/// the particle machinery against the exact filter.
pub trait GaussianParticle: LinearGaussian {
    fn bsf_filter(&self, nsim: usize, rng: &mut StdRng) -> Result<ParticleOutput> {
        bsf_linear(
            self,
            |t, state| log_dnorm(self.y_raw(t), self.signal(t, state), self.h_at(t)),
            nsim,
            rng,
        )
    }
}

impl<M: LinearGaussian + ?Sized> GaussianParticle for M {}

/// Particle filters for non-Gaussian observation models.
pub trait NonGaussianParticle: NonGaussian + Sized {
    /// Bootstrap filter: transition prior proposal, observation-density
    /// weights.
    fn bsf_filter(&self, nsim: usize, rng: &mut StdRng) -> Result<ParticleOutput> {
        bsf_linear(
            self,
            |t, state| self.log_obs_density(t, self.signal(t, state)),
            nsim,
            rng,
        )
    }

    /// ψ-auxiliary particle filter: proposes from the filtering distribution
    /// of the Gaussian approximation (one conditioning step on the
    /// pseudo-observation per transition) and weights with the ratio of the
    /// true to the approximate observation density times the pseudo
    /// predictive normalizer. Unbiased for the non-Gaussian likelihood.
    fn psi_filter(
        &self,
        approx: &GaussianApprox<'_, Self>,
        nsim: usize,
        rng: &mut StdRng,
    ) -> Result<ParticleOutput> {
        let n = self.series_len();
        let m = self.state_dim();
        let k = self.noise_dim();

        let mut alpha = vec![DMatrix::zeros(m, n); nsim];
        let mut weights = DMatrix::zeros(nsim, n);
        let mut ancestors: Vec<Vec<usize>> = Vec::with_capacity(n.saturating_sub(1));
        let mut loglik = 0.0;

        let mut states: Vec<DVector<f64>> = Vec::with_capacity(nsim);
        // time 0: condition the initial distribution on the pseudo-observation
        let mut lw = vec![0.0; nsim];
        if approx.y_raw(0).is_finite() {
            let z = self.z_col(0);
            let p1z = self.p1() * z;
            let f = z.dot(&p1z) + approx.hh_at(0);
            let kg = p1z / f;
            let mut cond_cov = self.p1() - &kg * kg.transpose() * f;
            symmetrize(&mut cond_cov);
            let l_cond = partial_cholesky(&cond_cov)?;
            let v = approx.obs(0) - z.dot(self.a1());
            let prior_pred = log_dnorm(approx.obs(0), z.dot(self.a1()), f.sqrt());
            let cond_mean = self.a1() + &kg * v;
            for l in lw.iter_mut() {
                let state = &cond_mean + &l_cond * randn_vec(m, rng);
                *l = self.log_obs_density(0, self.signal(0, &state)) + prior_pred
                    - log_dnorm(approx.obs(0), z.dot(&state), approx.h_at(0));
                states.push(state);
            }
        } else {
            let initial = MultiVariateNormal::new(self.a1(), self.p1())?;
            for _ in 0..nsim {
                states.push(initial.sample(rng));
            }
        }
        if !accumulate_weights(&mut weights, 0, &lw, &mut loglik, approx.y_raw(0).is_finite()) {
            for (i, state) in states.iter().enumerate() {
                alpha[i].set_column(0, state);
            }
            pad_degenerate(&mut ancestors, n, nsim);
            return Ok(ParticleOutput {
                alpha,
                weights,
                ancestors,
                loglik: f64::NEG_INFINITY,
            });
        }
        for (i, state) in states.iter().enumerate() {
            alpha[i].set_column(0, state);
        }

        for t in 1..n {
            let wnorm: Vec<f64> = {
                let sum: f64 = (0..nsim).map(|i| weights[(i, t - 1)]).sum();
                (0..nsim).map(|i| weights[(i, t - 1)] / sum).collect()
            };
            let u: Vec<f64> = (0..nsim).map(|_| rng.gen()).collect();
            let anc = stratified_resample(&wnorm, &u);
            let tm = self.t_slice(t - 1);
            let rr = self.rr_slice(t - 1);

            let mut lw = vec![0.0; nsim];
            let mut next = Vec::with_capacity(nsim);
            if approx.y_raw(t).is_finite() {
                let z = self.z_col(t);
                let rrz = rr * z;
                let f = z.dot(&rrz) + approx.hh_at(t);
                let kg = rrz / f;
                let mut cond_cov = rr - &kg * kg.transpose() * f;
                symmetrize(&mut cond_cov);
                let l_cond = partial_cholesky(&cond_cov)?;
                for (i, l) in lw.iter_mut().enumerate() {
                    let pred_mean = tm * &states[anc[i]];
                    let v = approx.obs(t) - z.dot(&pred_mean);
                    let state = &pred_mean + &kg * v + &l_cond * randn_vec(m, rng);
                    *l = self.log_obs_density(t, self.signal(t, &state))
                        + log_dnorm(approx.obs(t), z.dot(&pred_mean), f.sqrt())
                        - log_dnorm(approx.obs(t), z.dot(&state), approx.h_at(t));
                    next.push(state);
                }
            } else {
                let rm = self.r_slice(t - 1);
                for i in 0..nsim {
                    next.push(tm * &states[anc[i]] + rm * randn_vec(k, rng));
                }
            }
            ancestors.push(anc);
            states = next;
            for (i, state) in states.iter().enumerate() {
                alpha[i].set_column(t, state);
            }
            if !accumulate_weights(&mut weights, t, &lw, &mut loglik, approx.y_raw(t).is_finite())
            {
                pad_degenerate(&mut ancestors, n, nsim);
                return Ok(ParticleOutput {
                    alpha,
                    weights,
                    ancestors,
                    loglik: f64::NEG_INFINITY,
                });
            }
        }
        Ok(ParticleOutput {
            alpha,
            weights,
            ancestors,
            loglik,
        })
    }
}

impl<M: NonGaussian + Sized> NonGaussianParticle for M {}

/// Store one step of log-weights (shifted by the maximum) and accumulate the
/// likelihood; returns false when the step is degenerate.
pub(crate) fn accumulate_weights(
    weights: &mut DMatrix<f64>,
    t: usize,
    lw: &[f64],
    loglik: &mut f64,
    observed: bool,
) -> bool {
    let nsim = weights.nrows();
    if !observed {
        for i in 0..nsim {
            weights[(i, t)] = 1.0;
        }
        return true;
    }
    let mx = lw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !mx.is_finite() {
        return false;
    }
    let mut sum = 0.0;
    for (i, &l) in lw.iter().enumerate() {
        let w = (l - mx).exp();
        weights[(i, t)] = w;
        sum += w;
    }
    *loglik += mx + (sum / nsim as f64).ln();
    true
}

/// Rewrite each particle's columns to its true ancestor line. Afterwards the
/// trajectories are consistent paths (degenerate towards `t = 0`).
pub fn filter_smoother(out: &mut ParticleOutput) {
    let nsim = out.n_particles();
    let cols = out.alpha[0].ncols();
    let orig = out.alpha.clone();
    let mut idx: Vec<usize> = (0..nsim).collect();
    for t in (0..cols - 1).rev() {
        for i in 0..nsim {
            idx[i] = out.ancestors[t][idx[i]];
            out.alpha[i].set_column(t, &orig[idx[i]].column(t));
        }
    }
}

/// Draw one smoothed trajectory by backward simulation: the terminal index
/// follows the final weights, earlier indices reweight each step by the
/// transition density towards the already chosen future.
pub fn backward_simulate<M: LatentLinear + ?Sized>(
    model: &M,
    out: &ParticleOutput,
    rng: &mut StdRng,
) -> Result<DMatrix<f64>> {
    let nsim = out.n_particles();
    let cols = out.alpha[0].ncols();
    let m = model.state_dim();
    let mut traj = DMatrix::zeros(m, cols);

    let wnorm = out.normalized_weights(cols - 1);
    let mut idx = sample_index(&wnorm, rng);
    traj.set_column(cols - 1, &out.alpha[idx].column(cols - 1));

    for t in (0..cols - 1).rev() {
        let lower = partial_cholesky(model.rr_slice(t))?;
        let chosen = traj.column(t + 1).clone_owned();
        let wnorm = out.normalized_weights(t);
        let lb: Vec<f64> = (0..nsim)
            .map(|j| {
                let pred = model.t_slice(t) * out.alpha[j].column(t).clone_owned();
                wnorm[j].ln() + log_dmvnorm(&chosen, &pred, &lower)
            })
            .collect();
        let mx = lb.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let b: Vec<f64> = lb.iter().map(|&l| (l - mx).exp()).collect();
        let sum: f64 = b.iter().sum();
        let bnorm: Vec<f64> = b.iter().map(|&x| x / sum).collect();
        idx = sample_index(&bnorm, rng);
        traj.set_column(t, &out.alpha[idx].column(t));
    }
    Ok(traj)
}

/// Filtered summaries from a particle cloud: predictive moments are plain
/// averages (the cloud is an equally weighted predictive sample after
/// resampling), filtered moments use the step weights.
pub fn filter_summary(out: &ParticleOutput) -> (DMatrix<f64>, DMatrix<f64>, Vec<DMatrix<f64>>, Vec<DMatrix<f64>>) {
    let nsim = out.n_particles();
    let cols = out.alpha[0].ncols();
    let m = out.alpha[0].nrows();
    let mut at = DMatrix::zeros(m, cols);
    let mut att = DMatrix::zeros(m, cols);
    let mut pt = Vec::with_capacity(cols);
    let mut ptt = Vec::with_capacity(cols);
    for t in 0..cols {
        let uniform = vec![1.0 / nsim as f64; nsim];
        let wnorm = out.normalized_weights(t);
        let (mean_p, cov_p) = weighted_moments(&out.alpha, t, &uniform);
        let (mean_f, cov_f) = weighted_moments(&out.alpha, t, &wnorm);
        at.set_column(t, &mean_p);
        att.set_column(t, &mean_f);
        pt.push(cov_p);
        ptt.push(cov_f);
    }
    (at, att, pt, ptt)
}

/// Smoothed mean and covariance per time step using the terminal weights;
/// call [`filter_smoother`] first so trajectories are ancestor-consistent.
pub fn weighted_summary(out: &ParticleOutput) -> (DMatrix<f64>, Vec<DMatrix<f64>>) {
    let cols = out.alpha[0].ncols();
    let m = out.alpha[0].nrows();
    let wnorm = out.normalized_weights(cols - 1);
    let mut alphahat = DMatrix::zeros(m, cols);
    let mut vt = Vec::with_capacity(cols);
    for t in 0..cols {
        let (mean, cov) = weighted_moments(&out.alpha, t, &wnorm);
        alphahat.set_column(t, &mean);
        vt.push(cov);
    }
    (alphahat, vt)
}

fn weighted_moments(
    alpha: &[DMatrix<f64>],
    t: usize,
    wnorm: &[f64],
) -> (DVector<f64>, DMatrix<f64>) {
    let m = alpha[0].nrows();
    let mut mean = DVector::zeros(m);
    for (i, a) in alpha.iter().enumerate() {
        mean += a.column(t) * wnorm[i];
    }
    let mut cov = DMatrix::zeros(m, m);
    for (i, a) in alpha.iter().enumerate() {
        let d = a.column(t) - &mean;
        cov += &d * d.transpose() * wnorm[i];
    }
    (mean, cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::KalmanFilter;
    use crate::models::{Distribution, GaussianModel, NonGaussianModel};
    use crate::approximation::{default_initial_mode, Approximate};
    use crate::prior::{Prior, PriorSpec};
    use rand::SeedableRng;

    fn local_level(y: Vec<f64>) -> GaussianModel {
        let prior = PriorSpec::new(vec![
            Prior::HalfNormal { sd: 2.0 },
            Prior::HalfNormal { sd: 2.0 },
        ])
        .unwrap();
        GaussianModel::local_level(nalgebra::DVector::from_vec(y), 0.5, 0.3, 0.0, 2.0, prior)
            .unwrap()
    }

    fn poisson_model() -> NonGaussianModel {
        let prior = PriorSpec::new(vec![Prior::Normal { mean: 0.0, sd: 2.0 }]).unwrap();
        NonGaussianModel::local_level(
            nalgebra::DVector::from_vec(vec![0.0, 1.0, 2.0, 1.0, 3.0]),
            0.3,
            0.0,
            2.0,
            Distribution::Poisson,
            vec![1.0],
            prior,
        )
        .unwrap()
    }

    #[test]
    fn stratified_resampling_tracks_expected_counts() {
        let w = vec![0.5, 0.25, 0.125, 0.125];
        let u = vec![0.5; 8];
        let anc = stratified_resample(&w, &u);
        let mut counts = [0usize; 4];
        for &a in &anc {
            counts[a] += 1;
        }
        // each index appears within one of N * w_i
        assert!((counts[0] as f64 - 4.0).abs() <= 1.0);
        assert!((counts[1] as f64 - 2.0).abs() <= 1.0);
        assert!((counts[2] as f64 - 1.0).abs() <= 1.0);
        assert!((counts[3] as f64 - 1.0).abs() <= 1.0);
        // deterministic given the uniforms
        assert_eq!(anc, stratified_resample(&w, &u));
    }

    #[test]
    fn bootstrap_loglik_tracks_the_kalman_filter() {
        let y = vec![0.2, 0.5, -0.1, 0.4, 0.9, 1.2, 0.8, 1.1, 1.4, 1.0];
        let model = local_level(y);
        let exact = model.log_likelihood();
        let mut rng = StdRng::seed_from_u64(42);
        let out = GaussianParticle::bsf_filter(&model, 2000, &mut rng).unwrap();
        assert!(
            (out.loglik - exact).abs() < 0.6,
            "bsf {} vs exact {}",
            out.loglik,
            exact
        );
    }

    #[test]
    fn missing_observations_get_uniform_weights() {
        let model = local_level(vec![0.2, f64::NAN, 0.4]);
        let mut rng = StdRng::seed_from_u64(1);
        let out = GaussianParticle::bsf_filter(&model, 50, &mut rng).unwrap();
        for i in 0..50 {
            assert_eq!(out.weights[(i, 1)], 1.0);
        }
        assert!(out.loglik.is_finite());
    }

    #[test]
    fn smoothed_cloud_tracks_the_exact_smoother() {
        let y = vec![0.2, 0.5, -0.1, 0.4, 0.9];
        let model = local_level(y);
        let truth = model.smoother();
        let mut rng = StdRng::seed_from_u64(9);
        let mut out = GaussianParticle::bsf_filter(&model, 3000, &mut rng).unwrap();
        filter_smoother(&mut out);
        let (alphahat, _) = weighted_summary(&out);
        for t in 0..5 {
            assert!(
                (alphahat[(0, t)] - truth.alphahat[(0, t)]).abs() < 0.25,
                "t={t}: {} vs {}",
                alphahat[(0, t)],
                truth.alphahat[(0, t)]
            );
        }
    }

    #[test]
    fn psi_and_bootstrap_estimate_the_same_likelihood() {
        let model = poisson_model();
        let mode0 = default_initial_mode(&model);
        let approx = model.approximate(&mode0, 100, 1e-8);
        let mut rng = StdRng::seed_from_u64(5);
        let psi = model.psi_filter(&approx, 1000, &mut rng).unwrap();
        let mut rng = StdRng::seed_from_u64(6);
        let bsf = NonGaussianParticle::bsf_filter(&model, 4000, &mut rng).unwrap();
        assert!(
            (psi.loglik - bsf.loglik).abs() < 0.8,
            "psi {} vs bsf {}",
            psi.loglik,
            bsf.loglik
        );
    }

    #[test]
    fn backward_simulation_yields_consistent_trajectories() {
        let model = local_level(vec![0.2, 0.5, -0.1, 0.4]);
        let mut rng = StdRng::seed_from_u64(3);
        let out = GaussianParticle::bsf_filter(&model, 200, &mut rng).unwrap();
        let traj = backward_simulate(&model, &out, &mut rng).unwrap();
        assert_eq!(traj.ncols(), 4);
        assert!(traj.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn sampled_trajectory_follows_an_ancestor_line() {
        let model = local_level(vec![0.2, 0.5, -0.1, 0.4]);
        let mut rng = StdRng::seed_from_u64(8);
        let out = GaussianParticle::bsf_filter(&model, 100, &mut rng).unwrap();
        let traj = out.sample_trajectory(&mut rng);
        // every column must be one of the particle values at that time
        for t in 0..4 {
            let found = (0..100).any(|i| (out.alpha[i][(0, t)] - traj[(0, t)]).abs() < 1e-14);
            assert!(found);
        }
    }
}
