use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::models::StateSpace;
use crate::particle::{
    accumulate_weights, pad_degenerate, randn_vec, stratified_resample, ParticleOutput,
};
use crate::utils::linalg::{
    log_dnorm, partial_cholesky, symmetrize, LOG_2PI, ZERO_TOL,
};

/// User-supplied system functions. All take the current state, the parameter
/// vector, the time index, the known constants and the known time-varying
/// constants (one column per time step).
pub type ObsFn =
    Arc<dyn Fn(&DVector<f64>, &DVector<f64>, usize, &DVector<f64>, &DMatrix<f64>) -> f64 + Send + Sync>;
pub type ObsSdFn =
    Arc<dyn Fn(&DVector<f64>, &DVector<f64>, usize, &DVector<f64>, &DMatrix<f64>) -> f64 + Send + Sync>;
pub type StateFn = Arc<
    dyn Fn(&DVector<f64>, &DVector<f64>, usize, &DVector<f64>, &DMatrix<f64>) -> DVector<f64>
        + Send
        + Sync,
>;
pub type NoiseFn = Arc<
    dyn Fn(&DVector<f64>, &DVector<f64>, usize, &DVector<f64>, &DMatrix<f64>) -> DMatrix<f64>
        + Send
        + Sync,
>;
pub type ObsGradFn = Arc<
    dyn Fn(&DVector<f64>, &DVector<f64>, usize, &DVector<f64>, &DMatrix<f64>) -> DVector<f64>
        + Send
        + Sync,
>;
pub type StateJacFn = NoiseFn;
pub type InitMeanFn = Arc<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>;
pub type InitCovFn = Arc<dyn Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync>;
pub type PriorFn = Arc<dyn Fn(&DVector<f64>) -> f64 + Send + Sync>;

/// Nonlinear state space model driven by opaque callables: scalar observation
/// `y[t] = Z(alpha) + H(alpha) eps`, state `alpha[t+1] = T(alpha) + R(alpha) eta`.
///
/// `Zg` and `Tg` are the Jacobians used by the extended Kalman filter.
#[derive(Clone)]
pub struct NonlinearModel {
    y: DVector<f64>,
    z_fn: ObsFn,
    h_fn: ObsSdFn,
    t_fn: StateFn,
    r_fn: NoiseFn,
    zg_fn: ObsGradFn,
    tg_fn: StateJacFn,
    a1_fn: InitMeanFn,
    p1_fn: InitCovFn,
    log_prior_fn: PriorFn,
    theta: DVector<f64>,
    known_params: DVector<f64>,
    known_tv_params: DMatrix<f64>,
    /// Which of Z, H, T, R actually depend on the time index; static
    /// functions are always called with `t = 0`.
    time_varying: [bool; 4],
    m: usize,
    k: usize,
}

impl NonlinearModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        y: DVector<f64>,
        z_fn: ObsFn,
        h_fn: ObsSdFn,
        t_fn: StateFn,
        r_fn: NoiseFn,
        zg_fn: ObsGradFn,
        tg_fn: StateJacFn,
        a1_fn: InitMeanFn,
        p1_fn: InitCovFn,
        log_prior_fn: PriorFn,
        theta: DVector<f64>,
        known_params: DVector<f64>,
        known_tv_params: DMatrix<f64>,
        time_varying: [bool; 4],
        m: usize,
        k: usize,
    ) -> Result<Self> {
        if y.is_empty() {
            return Err(Error::EmptySeries);
        }
        Ok(Self {
            y,
            z_fn,
            h_fn,
            t_fn,
            r_fn,
            zg_fn,
            tg_fn,
            a1_fn,
            p1_fn,
            log_prior_fn,
            theta,
            known_params,
            known_tv_params,
            time_varying,
            m,
            k,
        })
    }

    pub fn series_len(&self) -> usize {
        self.y.len()
    }

    pub fn state_dim(&self) -> usize {
        self.m
    }

    fn zt(&self, t: usize) -> usize {
        t * self.time_varying[0] as usize
    }

    fn ht(&self, t: usize) -> usize {
        t * self.time_varying[1] as usize
    }

    fn tt(&self, t: usize) -> usize {
        t * self.time_varying[2] as usize
    }

    fn rt(&self, t: usize) -> usize {
        t * self.time_varying[3] as usize
    }

    fn obs_pred(&self, alpha: &DVector<f64>, t: usize) -> f64 {
        (self.z_fn)(alpha, &self.theta, self.zt(t), &self.known_params, &self.known_tv_params)
    }

    fn obs_sd(&self, alpha: &DVector<f64>, t: usize) -> f64 {
        (self.h_fn)(alpha, &self.theta, self.ht(t), &self.known_params, &self.known_tv_params)
    }

    fn state_pred(&self, alpha: &DVector<f64>, t: usize) -> DVector<f64> {
        (self.t_fn)(alpha, &self.theta, self.tt(t), &self.known_params, &self.known_tv_params)
    }

    fn noise_load(&self, alpha: &DVector<f64>, t: usize) -> DMatrix<f64> {
        (self.r_fn)(alpha, &self.theta, self.rt(t), &self.known_params, &self.known_tv_params)
    }

    /// Bootstrap particle filter with the transition as proposal.
    pub fn bsf_filter(&self, nsim: usize, rng: &mut StdRng) -> Result<ParticleOutput> {
        let n = self.y.len();
        let m = self.m;
        let a1 = (self.a1_fn)(&self.theta);
        let l_p1 = partial_cholesky(&(self.p1_fn)(&self.theta))?;

        let mut alpha = vec![DMatrix::zeros(m, n); nsim];
        let mut weights = DMatrix::zeros(nsim, n);
        let mut ancestors: Vec<Vec<usize>> = Vec::with_capacity(n.saturating_sub(1));
        let mut loglik = 0.0;

        let mut states: Vec<DVector<f64>> = (0..nsim)
            .map(|_| &a1 + &l_p1 * randn_vec(m, rng))
            .collect();

        for t in 0..n {
            if t > 0 {
                let wnorm: Vec<f64> = {
                    let sum: f64 = (0..nsim).map(|i| weights[(i, t - 1)]).sum();
                    (0..nsim).map(|i| weights[(i, t - 1)] / sum).collect()
                };
                let u: Vec<f64> = (0..nsim).map(|_| rng.gen()).collect();
                let anc = stratified_resample(&wnorm, &u);
                states = anc
                    .iter()
                    .map(|&a| {
                        self.state_pred(&states[a], t - 1)
                            + self.noise_load(&states[a], t - 1) * randn_vec(self.k, rng)
                    })
                    .collect();
                ancestors.push(anc);
            }
            for (i, state) in states.iter().enumerate() {
                alpha[i].set_column(t, state);
            }
            let observed = self.y[t].is_finite();
            let lw: Vec<f64> = if observed {
                states
                    .iter()
                    .map(|s| log_dnorm(self.y[t], self.obs_pred(s, t), self.obs_sd(s, t)))
                    .collect()
            } else {
                vec![0.0; nsim]
            };
            if !accumulate_weights(&mut weights, t, &lw, &mut loglik, observed) {
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

    /// Extended Kalman filter: linearize the system functions with their
    /// Jacobians and run the exact Gaussian recursions on the linearization.
    /// Returns predicted and filtered moments plus the approximate
    /// log-likelihood.
    pub fn ekf_filter(&self) -> (DMatrix<f64>, DMatrix<f64>, Vec<DMatrix<f64>>, Vec<DMatrix<f64>>, f64) {
        let n = self.y.len();
        let m = self.m;
        let mut at = DMatrix::zeros(m, n + 1);
        let mut att = DMatrix::zeros(m, n);
        let mut pt = Vec::with_capacity(n + 1);
        let mut ptt = Vec::with_capacity(n);
        let mut loglik = 0.0;

        let mut a = (self.a1_fn)(&self.theta);
        let mut p = (self.p1_fn)(&self.theta);
        for t in 0..n {
            at.set_column(t, &a);
            pt.push(p.clone());
            let (af, pf) = if self.y[t].is_finite() {
                let zg = (self.zg_fn)(
                    &a,
                    &self.theta,
                    self.zt(t),
                    &self.known_params,
                    &self.known_tv_params,
                );
                let hh = self.obs_sd(&a, t).powi(2);
                let pz = &p * &zg;
                let f = zg.dot(&pz) + hh;
                if f > ZERO_TOL {
                    let k = pz / f;
                    let v = self.y[t] - self.obs_pred(&a, t);
                    loglik += -0.5 * (LOG_2PI + f.ln() + v * v / f);
                    let mut pf = &p - &k * k.transpose() * f;
                    symmetrize(&mut pf);
                    (&a + &k * v, pf)
                } else {
                    (a.clone(), p.clone())
                }
            } else {
                (a.clone(), p.clone())
            };
            att.set_column(t, &af);
            ptt.push(pf.clone());

            let tg = (self.tg_fn)(
                &af,
                &self.theta,
                self.tt(t),
                &self.known_params,
                &self.known_tv_params,
            );
            let r = self.noise_load(&af, t);
            a = self.state_pred(&af, t);
            p = &tg * pf * tg.transpose() + &r * r.transpose();
            symmetrize(&mut p);
        }
        at.set_column(n, &a);
        pt.push(p);
        (at, att, pt, ptt, loglik)
    }

    /// Simulate observations (or states) forward from sampled terminal
    /// states, one path per stored parameter sample repeated by its count.
    pub fn predict_sample(
        &mut self,
        theta: &[DVector<f64>],
        alpha_last: &[DVector<f64>],
        counts: &[u32],
        n_ahead: usize,
        observation: bool,
        rng: &mut StdRng,
    ) -> Result<Vec<DVector<f64>>> {
        if theta.len() != alpha_last.len() || theta.len() != counts.len() {
            return Err(Error::ShapeMismatch(
                "theta, alpha_last and counts must be aligned".into(),
            ));
        }
        let offset = self.y.len();
        let mut paths = Vec::new();
        for ((th, a0), &count) in theta.iter().zip(alpha_last).zip(counts) {
            self.update(th);
            for _ in 0..count {
                let mut state = a0.clone();
                let mut path = DVector::zeros(n_ahead);
                for h in 0..n_ahead {
                    let t = offset + h;
                    state = self.state_pred(&state, t)
                        + self.noise_load(&state, t) * randn_vec(self.k, rng);
                    path[h] = if observation {
                        let eps: f64 = rng.sample(StandardNormal);
                        self.obs_pred(&state, t) + self.obs_sd(&state, t) * eps
                    } else {
                        self.obs_pred(&state, t)
                    };
                }
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

impl StateSpace for NonlinearModel {
    fn theta(&self) -> DVector<f64> {
        self.theta.clone()
    }

    fn update(&mut self, theta: &DVector<f64>) {
        self.theta = theta.clone();
    }

    fn log_prior(&self, theta: &DVector<f64>) -> f64 {
        (self.log_prior_fn)(theta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    /// Linear model expressed through the callback surface, so the EKF and
    /// the particle filter can be checked against the exact Kalman filter.
    fn linear_as_nonlinear(y: Vec<f64>) -> NonlinearModel {
        let z: ObsFn = Arc::new(|a, _, _, _, _| a[0]);
        let h: ObsSdFn = Arc::new(|_, theta, _, _, _| theta[0]);
        let t: StateFn = Arc::new(|a, _, _, _, _| a.clone());
        let r: NoiseFn = Arc::new(|_, theta, _, _, _| DMatrix::from_element(1, 1, theta[1]));
        let zg: ObsGradFn = Arc::new(|_, _, _, _, _| DVector::from_element(1, 1.0));
        let tg: StateJacFn = Arc::new(|_, _, _, _, _| DMatrix::identity(1, 1));
        let a1: InitMeanFn = Arc::new(|_| DVector::zeros(1));
        let p1: InitCovFn = Arc::new(|_| DMatrix::from_element(1, 1, 10.0));
        let prior: PriorFn = Arc::new(|_| 0.0);
        NonlinearModel::new(
            DVector::from_vec(y),
            z,
            h,
            t,
            r,
            zg,
            tg,
            a1,
            p1,
            prior,
            DVector::from_vec(vec![0.5, 0.3]),
            DVector::zeros(0),
            DMatrix::zeros(0, 0),
            [false; 4],
            1,
            1,
        )
        .unwrap()
    }

    #[test]
    fn ekf_matches_kalman_on_a_linear_model() {
        let model = linear_as_nonlinear(vec![1.0, 2.0, f64::NAN, 3.5]);
        let (at, _, pt, _, loglik) = model.ekf_filter();
        assert_relative_eq!(loglik, -7.599932374472253, epsilon = 1e-10);
        assert_relative_eq!(at[(0, 4)], 2.654133282786676, epsilon = 1e-10);
        assert_relative_eq!(pt[4][(0, 0)], 0.2309176405403632, epsilon = 1e-10);
    }

    #[test]
    fn bootstrap_filter_tracks_the_ekf_on_a_linear_model() {
        let model = linear_as_nonlinear(vec![0.2, 0.5, -0.1, 0.4, 0.9, 1.2]);
        let (_, _, _, _, exact) = model.ekf_filter();
        let mut rng = StdRng::seed_from_u64(17);
        let out = model.bsf_filter(2000, &mut rng).unwrap();
        assert!((out.loglik - exact).abs() < 0.6);
    }

    #[test]
    fn forward_prediction_has_the_requested_shape() {
        let mut model = linear_as_nonlinear(vec![0.2, 0.5]);
        let theta = vec![DVector::from_vec(vec![0.5, 0.3])];
        let alpha = vec![DVector::from_element(1, 0.4)];
        let mut rng = StdRng::seed_from_u64(2);
        let paths = model
            .predict_sample(&theta, &alpha, &[3], 4, true, &mut rng)
            .unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| p.len() == 4 && p.iter().all(|x| x.is_finite())));
    }
}
