//! Exact filtering, smoothing and simulation smoothing for linear Gaussian
//! models, written as an extension trait so every [`LinearGaussian`] model
//! gets the whole engine.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;
use crate::models::LinearGaussian;
use crate::utils::linalg::{
    filter_predict, filter_update, partial_cholesky, symmetrize, ZERO_TOL,
};

/// Filtering recursions output. `at`/`pt` are one-step predictions (the last
/// entry predicts past the sample), `att`/`ptt` the filtered quantities.
pub struct FilterOutput {
    pub at: DMatrix<f64>,
    pub att: DMatrix<f64>,
    pub pt: Vec<DMatrix<f64>>,
    pub ptt: Vec<DMatrix<f64>>,
    pub loglik: f64,
}

pub struct SmootherOutput {
    pub alphahat: DMatrix<f64>,
    pub vt: Vec<DMatrix<f64>>,
}

/// Innovation quantities cached by [`KalmanFilter::fast_smoother_cached`] so
/// the simulation smoother can re-smooth synthetic series without refiltering
/// covariances.
pub struct SmootherCache {
    ft: Vec<f64>,
    kt: Vec<DVector<f64>>,
    lt: Vec<DMatrix<f64>>,
    used: Vec<bool>,
}

pub trait KalmanFilter: LinearGaussian {
    /// Marginal log-likelihood by the prediction error decomposition.
    /// Missing observations and degenerate prediction variances contribute
    /// nothing.
    fn log_likelihood(&self) -> f64 {
        let n = self.series_len();
        let mut a = self.a1().clone();
        let mut p = self.p1().clone();
        let mut loglik = 0.0;
        for t in 0..n {
            let (att, ptt, ll) = filter_update(self.obs(t), self.z_col(t), self.hh_at(t), &a, &p);
            loglik += ll;
            let (an, pn) = filter_predict(self.t_slice(t), self.rr_slice(t), &att, &ptt);
            a = an;
            p = pn;
        }
        loglik
    }

    /// Full filtering pass with predicted and filtered means and covariances.
    fn filter(&self) -> FilterOutput {
        let n = self.series_len();
        let m = self.state_dim();
        let mut at = DMatrix::zeros(m, n + 1);
        let mut att = DMatrix::zeros(m, n);
        let mut pt = Vec::with_capacity(n + 1);
        let mut ptt = Vec::with_capacity(n);
        let mut a = self.a1().clone();
        let mut p = self.p1().clone();
        let mut loglik = 0.0;
        for t in 0..n {
            at.set_column(t, &a);
            pt.push(p.clone());
            let (af, pf, ll) = filter_update(self.obs(t), self.z_col(t), self.hh_at(t), &a, &p);
            loglik += ll;
            att.set_column(t, &af);
            ptt.push(pf.clone());
            let (an, pn) = filter_predict(self.t_slice(t), self.rr_slice(t), &af, &pf);
            a = an;
            p = pn;
        }
        at.set_column(n, &a);
        pt.push(p);
        FilterOutput {
            at,
            att,
            pt,
            ptt,
            loglik,
        }
    }

    /// Classical fixed-interval smoother: means and covariances of the states
    /// given the whole series.
    fn smoother(&self) -> SmootherOutput {
        let n = self.series_len();
        let m = self.state_dim();
        let out = self.filter();
        let mut alphahat = DMatrix::zeros(m, n);
        let mut vt = vec![DMatrix::zeros(m, m); n];

        let mut r = DVector::zeros(m);
        let mut nt = DMatrix::zeros(m, m);
        for t in (0..n).rev() {
            let z = self.z_col(t);
            let tm = self.t_slice(t);
            let p = &out.pt[t];
            let f = z.dot(&(p * z)) + self.hh_at(t);
            if self.obs(t).is_finite() && f > ZERO_TOL {
                let k = p * z / f;
                let v = self.obs(t) - z.dot(&out.at.column(t).clone_owned());
                let l = tm * (DMatrix::identity(m, m) - &k * z.transpose());
                r = z * (v / f) + l.transpose() * r;
                nt = z * z.transpose() / f + l.transpose() * nt * l;
            } else {
                r = tm.transpose() * r;
                nt = tm.transpose() * nt * tm;
            }
            symmetrize(&mut nt);
            alphahat.set_column(t, &(out.at.column(t) + p * &r));
            let mut v = p - p * &nt * p;
            symmetrize(&mut v);
            vt[t] = v;
        }
        SmootherOutput { alphahat, vt }
    }

    /// Smoothed state means only, one combined pass.
    fn fast_smoother(&self) -> DMatrix<f64> {
        self.fast_smoother_cached().0
    }

    /// Fast smoother that also returns the innovation cache for reuse.
    fn fast_smoother_cached(&self) -> (DMatrix<f64>, SmootherCache) {
        let n = self.series_len();
        let m = self.state_dim();
        let mut ft = vec![0.0; n];
        let mut vt = vec![0.0; n];
        let mut kt = vec![DVector::zeros(m); n];
        let mut lt = Vec::with_capacity(n);
        let mut used = vec![false; n];

        let mut a = self.a1().clone();
        let mut p = self.p1().clone();
        for t in 0..n {
            let z = self.z_col(t);
            let tm = self.t_slice(t);
            let pz = &p * z;
            let f = z.dot(&pz) + self.hh_at(t);
            ft[t] = f;
            if self.obs(t).is_finite() && f > ZERO_TOL {
                used[t] = true;
                let k = pz / f;
                vt[t] = self.obs(t) - z.dot(&a);
                lt.push(tm * (DMatrix::identity(m, m) - &k * z.transpose()));
                if t + 1 < n {
                    a = tm * (&a + &k * vt[t]);
                    let mut pn =
                        tm * (&p - &k * k.transpose() * f) * tm.transpose() + self.rr_slice(t);
                    symmetrize(&mut pn);
                    p = pn;
                }
                kt[t] = k;
            } else {
                lt.push(tm.clone());
                if t + 1 < n {
                    a = tm * &a;
                    let mut pn = tm * &p * tm.transpose() + self.rr_slice(t);
                    symmetrize(&mut pn);
                    p = pn;
                }
            }
        }

        let cache = SmootherCache { ft, kt, lt, used };
        let alphahat = smooth_means(self, &cache, &vt);
        (alphahat, cache)
    }

    /// Fast smoother on an alternative observation series, reusing a cache.
    /// The missingness pattern must match the series the cache was built on.
    fn fast_smoother_with(&self, y: &DVector<f64>, cache: &SmootherCache) -> DMatrix<f64> {
        let n = self.series_len();
        let mut a = self.a1().clone();
        let mut vt = vec![0.0; n];
        for t in 0..n {
            let tm = self.t_slice(t);
            if cache.used[t] {
                vt[t] = y[t] - self.z_col(t).dot(&a);
                if t + 1 < n {
                    a = tm * (&a + &cache.kt[t] * vt[t]);
                }
            } else if t + 1 < n {
                a = tm * &a;
            }
        }
        smooth_means(self, cache, &vt)
    }

    /// Durbin-Koopman simulation smoother: draws from the joint smoothing
    /// distribution of the states. The initial covariance may be rank
    /// deficient; only its positive-diagonal block is factored.
    fn simulation_smoother(&self, nsim: usize, rng: &mut StdRng) -> Result<Vec<DMatrix<f64>>> {
        let n = self.series_len();
        let m = self.state_dim();
        let k = self.noise_dim();
        let (alphahat, cache) = self.fast_smoother_cached();
        let l_p1 = partial_cholesky(self.p1())?;

        let mut draws = Vec::with_capacity(nsim);
        for _ in 0..nsim {
            let um = DVector::from_fn(m, |_, _| rng.sample::<f64, _>(StandardNormal));
            let mut a = self.a1() + &l_p1 * um;
            let mut aplus = DMatrix::zeros(m, n);
            let mut yplus = DVector::from_element(n, f64::NAN);
            for t in 0..n {
                aplus.set_column(t, &a);
                if self.obs(t).is_finite() {
                    let eps: f64 = rng.sample(StandardNormal);
                    yplus[t] = self.z_col(t).dot(&a) + self.h_at(t) * eps;
                }
                if t + 1 < n {
                    let uk = DVector::from_fn(k, |_, _| rng.sample::<f64, _>(StandardNormal));
                    a = self.t_slice(t) * &a + self.r_slice(t) * uk;
                }
            }
            let smoothed_plus = self.fast_smoother_with(&yplus, &cache);
            draws.push(&alphahat - smoothed_plus + aplus);
        }
        Ok(draws)
    }
}

impl<M: LinearGaussian + ?Sized> KalmanFilter for M {}

/// Shared backward pass of the fast smoother: disturbance recursion plus the
/// forward reconstruction of the smoothed means.
fn smooth_means<M: LinearGaussian + ?Sized>(
    model: &M,
    cache: &SmootherCache,
    vt: &[f64],
) -> DMatrix<f64> {
    let n = model.series_len();
    let m = model.state_dim();

    let mut rt = vec![DVector::zeros(m); n];
    for t in (1..n).rev() {
        let prev = if cache.used[t] {
            model.z_col(t) * (vt[t] / cache.ft[t]) + cache.lt[t].transpose() * &rt[t]
        } else {
            cache.lt[t].transpose() * &rt[t]
        };
        rt[t - 1] = prev;
    }
    let r0 = if cache.used[0] {
        model.z_col(0) * (vt[0] / cache.ft[0]) + cache.lt[0].transpose() * &rt[0]
    } else {
        cache.lt[0].transpose() * &rt[0]
    };

    let mut alphahat = DMatrix::zeros(m, n);
    alphahat.set_column(0, &(model.a1() + model.p1() * r0));
    for t in 0..(n - 1) {
        let next =
            model.t_slice(t) * alphahat.column(t).clone_owned() + model.rr_slice(t) * &rt[t];
        alphahat.set_column(t + 1, &next);
    }
    alphahat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GaussianModel, StateSpace};
    use crate::prior::{Prior, PriorSpec};
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn local_level() -> GaussianModel {
        let prior = PriorSpec::new(vec![
            Prior::HalfNormal { sd: 2.0 },
            Prior::HalfNormal { sd: 2.0 },
        ])
        .unwrap();
        GaussianModel::local_level(
            nalgebra::DVector::from_vec(vec![1.0, 2.0, f64::NAN, 3.5]),
            0.5,
            0.3,
            0.0,
            10.0,
            prior,
        )
        .unwrap()
    }

    #[test]
    fn local_level_loglik_matches_exact_recursion() {
        let model = local_level();
        assert_relative_eq!(model.log_likelihood(), -7.599932374472253, epsilon = 1e-10);
        let out = model.filter();
        assert_relative_eq!(out.loglik, model.log_likelihood(), epsilon = 1e-12);
        assert_relative_eq!(out.at[(0, 4)], 2.654133282786676, epsilon = 1e-10);
        assert_relative_eq!(out.pt[4][(0, 0)], 0.2309176405403632, epsilon = 1e-10);
    }

    #[test]
    fn smoother_matches_exact_recursion() {
        let model = local_level();
        let out = model.smoother();
        let expected = [
            1.7568365568977966,
            2.045109246393083,
            2.3496212645898797,
            2.654133282786676,
        ];
        let expected_var = [
            0.12298876551940197,
            0.10729074777461053,
            0.13824126794345581,
            0.1409176405403632,
        ];
        for t in 0..4 {
            assert_relative_eq!(out.alphahat[(0, t)], expected[t], epsilon = 1e-10);
            assert_relative_eq!(out.vt[t][(0, 0)], expected_var[t], epsilon = 1e-10);
        }
    }

    #[test]
    fn fast_smoother_agrees_with_classical() {
        let model = local_level();
        let fast = model.fast_smoother();
        let classical = model.smoother();
        for t in 0..4 {
            assert_relative_eq!(fast[(0, t)], classical.alphahat[(0, t)], epsilon = 1e-8);
        }
    }

    #[test]
    fn fast_smoother_agrees_on_multivariate_state() {
        let prior = PriorSpec::new(vec![
            Prior::Normal { mean: 0.0, sd: 2.0 },
            Prior::Normal { mean: 0.0, sd: 2.0 },
            Prior::Normal { mean: 0.0, sd: 2.0 },
        ])
        .unwrap();
        let y = nalgebra::DVector::from_vec(vec![
            0.2, 0.7, 1.1, f64::NAN, 2.3, 2.6, 3.4, 3.3, 4.1, 4.8,
        ]);
        let model = GaussianModel::structural(
            y,
            0.4,
            0.2,
            Some(0.1),
            None,
            nalgebra::DVector::zeros(2),
            nalgebra::DMatrix::identity(2, 2) * 5.0,
            prior,
        )
        .unwrap();
        let fast = model.fast_smoother();
        let classical = model.smoother();
        for t in 0..10 {
            for i in 0..2 {
                assert_relative_eq!(
                    fast[(i, t)],
                    classical.alphahat[(i, t)],
                    epsilon = 1e-8
                );
            }
        }
    }

    #[test]
    fn simulation_smoother_mean_approaches_alphahat() {
        let model = local_level();
        let truth = model.smoother();
        let mut rng = StdRng::seed_from_u64(11);
        let draws = model.simulation_smoother(1500, &mut rng).unwrap();
        let mut mean = nalgebra::DMatrix::zeros(1, 4);
        for draw in &draws {
            mean += draw;
        }
        mean /= draws.len() as f64;
        for t in 0..4 {
            assert_relative_eq!(mean[(0, t)], truth.alphahat[(0, t)], epsilon = 0.06);
        }
    }

    #[test]
    fn simulation_smoother_handles_rank_deficient_p1() {
        let prior = PriorSpec::new(vec![
            Prior::Normal { mean: 0.0, sd: 2.0 },
            Prior::Normal { mean: 0.0, sd: 2.0 },
            Prior::Normal { mean: 0.0, sd: 2.0 },
        ])
        .unwrap();
        let mut p1 = nalgebra::DMatrix::zeros(2, 2);
        p1[(0, 0)] = 4.0;
        let y = nalgebra::DVector::from_vec(vec![0.5, 0.9, 1.4, 1.6]);
        let model = GaussianModel::structural(
            y,
            0.4,
            0.2,
            Some(0.1),
            None,
            nalgebra::DVector::zeros(2),
            p1,
            prior,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let draws = model.simulation_smoother(5, &mut rng).unwrap();
        assert_eq!(draws.len(), 5);
        assert!(draws.iter().all(|d| d.iter().all(|x| x.is_finite())));
    }

    #[test]
    fn updated_parameters_change_the_likelihood() {
        let mut model = local_level();
        let base = model.log_likelihood();
        model.update(&nalgebra::DVector::from_vec(vec![1.0, 0.6]));
        assert!((model.log_likelihood() - base).abs() > 1e-6);
    }
}
