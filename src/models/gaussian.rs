use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::models::{LatentLinear, LinearGaussian, StateSpace};
use crate::prior::PriorSpec;

/// Univariate linear Gaussian state space model.
///
/// System matrices are stored one slice per time step when time-varying and
/// as a single slice when static. Estimated entries are declared through
/// index arrays; the parameter vector concatenates, in order, the selected
/// entries of Z, H, T, R and then the regression coefficients. Entries can be
/// sampled on the log scale, in which case [`StateSpace::proposal_adjustment`]
/// supplies the Jacobian.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    y: DVector<f64>,
    z: Vec<DVector<f64>>,
    h: Vec<f64>,
    hh: Vec<f64>,
    t: Vec<DMatrix<f64>>,
    r: Vec<DMatrix<f64>>,
    rr: Vec<DMatrix<f64>>,
    a1: DVector<f64>,
    p1: DMatrix<f64>,
    xreg: DMatrix<f64>,
    beta: DVector<f64>,
    xbeta: DVector<f64>,
    z_ind: Vec<(usize, usize)>,
    h_ind: Vec<usize>,
    t_ind: Vec<(usize, usize, usize)>,
    r_ind: Vec<(usize, usize, usize)>,
    log_scale: Vec<bool>,
    stationary: bool,
    prior: PriorSpec,
}

fn check_slices(len: usize, n: usize, what: &str) -> Result<()> {
    if len == 1 || len == n {
        Ok(())
    } else {
        Err(Error::ShapeMismatch(format!(
            "{what} must have 1 or {n} slices, got {len}"
        )))
    }
}

impl GaussianModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        y: DVector<f64>,
        z: Vec<DVector<f64>>,
        h: Vec<f64>,
        t: Vec<DMatrix<f64>>,
        r: Vec<DMatrix<f64>>,
        a1: DVector<f64>,
        p1: DMatrix<f64>,
    ) -> Result<Self> {
        let n = y.len();
        if n == 0 {
            return Err(Error::EmptySeries);
        }
        let m = a1.len();
        check_slices(z.len(), n, "Z")?;
        check_slices(h.len(), n, "H")?;
        check_slices(t.len(), n, "T")?;
        check_slices(r.len(), n, "R")?;
        if z.iter().any(|zt| zt.len() != m) {
            return Err(Error::ShapeMismatch(format!("Z slices must have length {m}")));
        }
        if t.iter().any(|tt| tt.nrows() != m || tt.ncols() != m) {
            return Err(Error::ShapeMismatch(format!("T slices must be {m}x{m}")));
        }
        let k = r[0].ncols();
        if r.iter().any(|rt| rt.nrows() != m || rt.ncols() != k) {
            return Err(Error::ShapeMismatch(format!("R slices must be {m}x{k}")));
        }
        if p1.nrows() != m || p1.ncols() != m {
            return Err(Error::ShapeMismatch(format!("P1 must be {m}x{m}")));
        }
        let hh = h.iter().map(|hi| hi * hi).collect();
        let rr = r.iter().map(|rt| rt * rt.transpose()).collect();
        Ok(Self {
            y,
            z,
            h,
            hh,
            t,
            r,
            rr,
            a1,
            p1,
            xreg: DMatrix::zeros(n, 0),
            beta: DVector::zeros(0),
            xbeta: DVector::zeros(n),
            z_ind: Vec::new(),
            h_ind: Vec::new(),
            t_ind: Vec::new(),
            r_ind: Vec::new(),
            log_scale: Vec::new(),
            stationary: false,
            prior: PriorSpec::new(Vec::new())?,
        })
    }

    /// Local level model: random walk level observed with Gaussian noise.
    /// Parameters, in order: observation sd, level sd.
    pub fn local_level(
        y: DVector<f64>,
        obs_sd: f64,
        level_sd: f64,
        a1: f64,
        p1: f64,
        prior: PriorSpec,
    ) -> Result<Self> {
        let model = Self::new(
            y,
            vec![DVector::from_element(1, 1.0)],
            vec![obs_sd],
            vec![DMatrix::from_element(1, 1, 1.0)],
            vec![DMatrix::from_element(1, 1, level_sd)],
            DVector::from_element(1, a1),
            DMatrix::from_element(1, 1, p1),
        )?;
        model
            .with_estimated(vec![], vec![0], vec![], vec![(0, 0, 0)])?
            .with_prior(prior)
    }

    /// Basic structural model: level, optional slope and optional seasonal
    /// component of the given period. All standard deviations are estimated
    /// on the log scale; parameters in order: ln obs sd, ln level sd,
    /// ln slope sd, ln seasonal sd (present components only).
    pub fn structural(
        y: DVector<f64>,
        obs_sd: f64,
        level_sd: f64,
        slope_sd: Option<f64>,
        seasonal: Option<(usize, f64)>,
        a1: DVector<f64>,
        p1: DMatrix<f64>,
        prior: PriorSpec,
    ) -> Result<Self> {
        let (z, t, r, r_ind) = structural_system(level_sd, slope_sd, seasonal)?;
        if a1.len() != z.len() {
            return Err(Error::ShapeMismatch(format!(
                "a1 must have length {} for this structural model",
                z.len()
            )));
        }
        let n_par = 1 + r_ind.len();
        let model = Self::new(
            y,
            vec![z],
            vec![obs_sd],
            vec![t],
            vec![r],
            a1,
            p1,
        )?;
        model
            .with_estimated(vec![], vec![0], vec![], r_ind)?
            .with_log_scale(vec![true; n_par])?
            .with_prior(prior)
    }

    /// Zero-mean stationary AR(1) level observed with Gaussian noise.
    /// Parameters, in order: observation sd, autoregression rho, state sd.
    /// A nonzero mean is modelled with a constant regression column.
    pub fn ar1(
        y: DVector<f64>,
        rho: f64,
        sigma: f64,
        obs_sd: f64,
        prior: PriorSpec,
    ) -> Result<Self> {
        let p1 = sigma * sigma / (1.0 - rho * rho);
        let model = Self::new(
            y,
            vec![DVector::from_element(1, 1.0)],
            vec![obs_sd],
            vec![DMatrix::from_element(1, 1, rho)],
            vec![DMatrix::from_element(1, 1, sigma)],
            DVector::zeros(1),
            DMatrix::from_element(1, 1, p1),
        )?;
        let model = model
            .with_estimated(vec![], vec![0], vec![(0, 0, 0)], vec![(0, 0, 0)])?
            .with_prior(prior)?;
        Ok(model.with_stationary())
    }

    /// Attach a regression mean `xbeta = X beta`; the coefficients join the
    /// tail of the parameter vector.
    pub fn with_regression(mut self, xreg: DMatrix<f64>, beta: DVector<f64>) -> Result<Self> {
        if xreg.nrows() != self.y.len() || xreg.ncols() != beta.len() {
            return Err(Error::ShapeMismatch(format!(
                "xreg must be {}x{}",
                self.y.len(),
                beta.len()
            )));
        }
        self.xbeta = &xreg * &beta;
        self.xreg = xreg;
        self.beta = beta;
        self.resize_log_scale();
        Ok(self)
    }

    /// Declare which entries of Z, H, T and R are estimated.
    pub fn with_estimated(
        mut self,
        z_ind: Vec<(usize, usize)>,
        h_ind: Vec<usize>,
        t_ind: Vec<(usize, usize, usize)>,
        r_ind: Vec<(usize, usize, usize)>,
    ) -> Result<Self> {
        let m = self.a1.len();
        let k = self.r[0].ncols();
        if z_ind.iter().any(|&(s, i)| s >= self.z.len() || i >= m)
            || h_ind.iter().any(|&s| s >= self.h.len())
            || t_ind
                .iter()
                .any(|&(s, i, j)| s >= self.t.len() || i >= m || j >= m)
            || r_ind
                .iter()
                .any(|&(s, i, j)| s >= self.r.len() || i >= m || j >= k)
        {
            return Err(Error::ShapeMismatch("parameter index out of range".into()));
        }
        self.z_ind = z_ind;
        self.h_ind = h_ind;
        self.t_ind = t_ind;
        self.r_ind = r_ind;
        self.resize_log_scale();
        Ok(self)
    }

    pub fn with_prior(mut self, prior: PriorSpec) -> Result<Self> {
        if prior.len() != self.n_par() {
            return Err(Error::PriorLength {
                expected: self.n_par(),
                found: prior.len(),
            });
        }
        self.prior = prior;
        Ok(self)
    }

    /// Mark parameters as sampled on the log scale.
    pub fn with_log_scale(mut self, mask: Vec<bool>) -> Result<Self> {
        if mask.len() != self.n_par() {
            return Err(Error::ShapeMismatch(format!(
                "log-scale mask must have length {}",
                self.n_par()
            )));
        }
        self.log_scale = mask;
        Ok(self)
    }

    /// Recompute `P1` from the stationary distribution of a scalar state
    /// after each parameter update.
    pub fn with_stationary(mut self) -> Self {
        self.stationary = true;
        self.apply_stationary();
        self
    }

    pub fn n_par(&self) -> usize {
        self.z_ind.len() + self.h_ind.len() + self.t_ind.len() + self.r_ind.len()
            + self.xreg.ncols()
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    fn resize_log_scale(&mut self) {
        self.log_scale.resize(self.n_par(), false);
    }

    fn apply_stationary(&mut self) {
        if self.stationary && self.a1.len() == 1 {
            let rho = self.t[0][(0, 0)];
            self.p1[(0, 0)] = self.rr[0][(0, 0)] / (1.0 - rho * rho);
        }
    }

    fn from_sampled(&self, value: f64, idx: usize) -> f64 {
        if self.log_scale[idx] {
            value.exp()
        } else {
            value
        }
    }

    fn to_sampled(&self, value: f64, idx: usize) -> f64 {
        if self.log_scale[idx] {
            value.ln()
        } else {
            value
        }
    }
}

impl StateSpace for GaussianModel {
    fn theta(&self) -> DVector<f64> {
        let mut theta = Vec::with_capacity(self.n_par());
        for &(s, i) in &self.z_ind {
            theta.push(self.z[s][i]);
        }
        for &s in &self.h_ind {
            theta.push(self.h[s]);
        }
        for &(s, i, j) in &self.t_ind {
            theta.push(self.t[s][(i, j)]);
        }
        for &(s, i, j) in &self.r_ind {
            theta.push(self.r[s][(i, j)]);
        }
        for b in self.beta.iter() {
            theta.push(*b);
        }
        let mut theta = DVector::from_vec(theta);
        for idx in 0..theta.len() {
            theta[idx] = self.to_sampled(theta[idx], idx);
        }
        theta
    }

    fn update(&mut self, theta: &DVector<f64>) {
        let mut idx = 0;
        for zi in 0..self.z_ind.len() {
            let (s, i) = self.z_ind[zi];
            let value = self.from_sampled(theta[idx], idx);
            self.z[s][i] = value;
            idx += 1;
        }
        for hi in 0..self.h_ind.len() {
            let s = self.h_ind[hi];
            let value = self.from_sampled(theta[idx], idx);
            self.h[s] = value;
            idx += 1;
        }
        for ti in 0..self.t_ind.len() {
            let (s, i, j) = self.t_ind[ti];
            let value = self.from_sampled(theta[idx], idx);
            self.t[s][(i, j)] = value;
            idx += 1;
        }
        for ri in 0..self.r_ind.len() {
            let (s, i, j) = self.r_ind[ri];
            let value = self.from_sampled(theta[idx], idx);
            self.r[s][(i, j)] = value;
            idx += 1;
        }
        if !self.h_ind.is_empty() {
            for s in 0..self.h.len() {
                self.hh[s] = self.h[s] * self.h[s];
            }
        }
        if !self.r_ind.is_empty() {
            for s in 0..self.r.len() {
                self.rr[s] = &self.r[s] * self.r[s].transpose();
            }
        }
        if self.xreg.ncols() > 0 {
            for b in 0..self.beta.len() {
                self.beta[b] = theta[idx];
                idx += 1;
            }
            self.xbeta = &self.xreg * &self.beta;
        }
        self.apply_stationary();
    }

    fn log_prior(&self, theta: &DVector<f64>) -> f64 {
        self.prior.log_density(theta)
    }

    fn in_support(&self, theta: &DVector<f64>) -> bool {
        self.prior.in_support(theta)
    }

    fn proposal_adjustment(&self, current: &DVector<f64>, proposed: &DVector<f64>) -> f64 {
        self.log_scale
            .iter()
            .enumerate()
            .filter(|(_, &on)| on)
            .map(|(i, _)| proposed[i] - current[i])
            .sum()
    }
}

impl LatentLinear for GaussianModel {
    fn series_len(&self) -> usize {
        self.y.len()
    }

    fn state_dim(&self) -> usize {
        self.a1.len()
    }

    fn noise_dim(&self) -> usize {
        self.r[0].ncols()
    }

    fn y_raw(&self, t: usize) -> f64 {
        self.y[t]
    }

    fn xbeta(&self, t: usize) -> f64 {
        self.xbeta[t]
    }

    fn z_col(&self, t: usize) -> &DVector<f64> {
        &self.z[t * (self.z.len() > 1) as usize]
    }

    fn t_slice(&self, t: usize) -> &DMatrix<f64> {
        &self.t[t * (self.t.len() > 1) as usize]
    }

    fn r_slice(&self, t: usize) -> &DMatrix<f64> {
        &self.r[t * (self.r.len() > 1) as usize]
    }

    fn rr_slice(&self, t: usize) -> &DMatrix<f64> {
        &self.rr[t * (self.rr.len() > 1) as usize]
    }

    fn a1(&self) -> &DVector<f64> {
        &self.a1
    }

    fn p1(&self) -> &DMatrix<f64> {
        &self.p1
    }
}

impl LinearGaussian for GaussianModel {
    fn h_at(&self, t: usize) -> f64 {
        self.h[t * (self.h.len() > 1) as usize]
    }

    fn hh_at(&self, t: usize) -> f64 {
        self.hh[t * (self.hh.len() > 1) as usize]
    }
}

/// Assemble Z, T, R and the R index array for a structural model.
#[allow(clippy::type_complexity)]
pub(crate) fn structural_system(
    level_sd: f64,
    slope_sd: Option<f64>,
    seasonal: Option<(usize, f64)>,
) -> Result<(DVector<f64>, DMatrix<f64>, DMatrix<f64>, Vec<(usize, usize, usize)>)> {
    if let Some((period, _)) = seasonal {
        if period < 2 {
            return Err(Error::ShapeMismatch(
                "seasonal period must be at least 2".into(),
            ));
        }
    }
    let slope = slope_sd.is_some() as usize;
    let seas = seasonal.map_or(0, |(period, _)| period - 1);
    let m = 1 + slope + seas;
    let k = 1 + slope + (seas > 0) as usize;

    let mut z = DVector::zeros(m);
    z[0] = 1.0;
    if seas > 0 {
        z[1 + slope] = 1.0;
    }

    let mut t = DMatrix::zeros(m, m);
    t[(0, 0)] = 1.0;
    if slope == 1 {
        t[(0, 1)] = 1.0;
        t[(1, 1)] = 1.0;
    }
    if seas > 0 {
        let o = 1 + slope;
        for j in 0..seas {
            t[(o, o + j)] = -1.0;
        }
        for j in 1..seas {
            t[(o + j, o + j - 1)] = 1.0;
        }
    }

    let mut r = DMatrix::zeros(m, k);
    let mut r_ind = vec![(0, 0, 0)];
    r[(0, 0)] = level_sd;
    if let Some(sd) = slope_sd {
        r[(1, 1)] = sd;
        r_ind.push((0, 1, 1));
    }
    if let Some((_, sd)) = seasonal {
        let o = 1 + slope;
        r[(o, k - 1)] = sd;
        r_ind.push((0, o, k - 1));
    }
    Ok((z, t, r, r_ind))
}
