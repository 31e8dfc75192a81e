use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::models::{Distribution, LatentLinear, NonGaussian, StateSpace};
use crate::prior::PriorSpec;

/// Univariate state space model with a non-Gaussian observation equation on a
/// linear Gaussian latent backbone.
///
/// The parameter vector concatenates the selected entries of Z, T and R, the
/// regression coefficients, and finally the log dispersion when it is
/// estimated (negative binomial dispersion or SV scale).
#[derive(Debug, Clone)]
pub struct NonGaussianModel {
    y: DVector<f64>,
    z: Vec<DVector<f64>>,
    t: Vec<DMatrix<f64>>,
    r: Vec<DMatrix<f64>>,
    rr: Vec<DMatrix<f64>>,
    a1: DVector<f64>,
    p1: DMatrix<f64>,
    xreg: DMatrix<f64>,
    beta: DVector<f64>,
    xbeta: DVector<f64>,
    distribution: Distribution,
    phi: Vec<f64>,
    dispersion_est: bool,
    z_ind: Vec<(usize, usize)>,
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

impl NonGaussianModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        y: DVector<f64>,
        z: Vec<DVector<f64>>,
        t: Vec<DMatrix<f64>>,
        r: Vec<DMatrix<f64>>,
        a1: DVector<f64>,
        p1: DMatrix<f64>,
        distribution: Distribution,
        phi: Vec<f64>,
    ) -> Result<Self> {
        let n = y.len();
        if n == 0 {
            return Err(Error::EmptySeries);
        }
        let m = a1.len();
        check_slices(z.len(), n, "Z")?;
        check_slices(t.len(), n, "T")?;
        check_slices(r.len(), n, "R")?;
        check_slices(phi.len(), n, "phi")?;
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
        if phi.iter().any(|&p| !(p > 0.0)) {
            return Err(Error::OutOfRange {
                name: "phi",
                range: "(0, inf)",
                value: *phi.iter().find(|&&p| !(p > 0.0)).unwrap_or(&f64::NAN),
            });
        }
        let rr = r.iter().map(|rt| rt * rt.transpose()).collect();
        Ok(Self {
            y,
            z,
            t,
            r,
            rr,
            a1,
            p1,
            xreg: DMatrix::zeros(n, 0),
            beta: DVector::zeros(0),
            xbeta: DVector::zeros(n),
            distribution,
            phi,
            dispersion_est: false,
            z_ind: Vec::new(),
            t_ind: Vec::new(),
            r_ind: Vec::new(),
            log_scale: Vec::new(),
            stationary: false,
            prior: PriorSpec::new(Vec::new())?,
        })
    }

    /// Count-data local level model (Poisson, binomial or negative binomial).
    /// One parameter: ln level sd.
    pub fn local_level(
        y: DVector<f64>,
        level_sd: f64,
        a1: f64,
        p1: f64,
        distribution: Distribution,
        phi: Vec<f64>,
        prior: PriorSpec,
    ) -> Result<Self> {
        let model = Self::new(
            y,
            vec![DVector::from_element(1, 1.0)],
            vec![DMatrix::from_element(1, 1, 1.0)],
            vec![DMatrix::from_element(1, 1, level_sd)],
            DVector::from_element(1, a1),
            DMatrix::from_element(1, 1, p1),
            distribution,
            phi,
        )?;
        model
            .with_estimated(vec![], vec![], vec![(0, 0, 0)])?
            .with_log_scale(vec![true])?
            .with_prior(prior)
    }

    /// Structural (level / slope / seasonal) backbone with a count
    /// observation family; sds are sampled on the log scale.
    #[allow(clippy::too_many_arguments)]
    pub fn structural(
        y: DVector<f64>,
        level_sd: f64,
        slope_sd: Option<f64>,
        seasonal: Option<(usize, f64)>,
        a1: DVector<f64>,
        p1: DMatrix<f64>,
        distribution: Distribution,
        phi: Vec<f64>,
        prior: PriorSpec,
    ) -> Result<Self> {
        let (z, t, r, r_ind) = super::gaussian::structural_system(level_sd, slope_sd, seasonal)?;
        if a1.len() != z.len() {
            return Err(Error::ShapeMismatch(format!(
                "a1 must have length {} for this structural model",
                z.len()
            )));
        }
        let n_par = r_ind.len();
        let model = Self::new(y, vec![z], vec![t], vec![r], a1, p1, distribution, phi)?;
        model
            .with_estimated(vec![], vec![], r_ind)?
            .with_log_scale(vec![true; n_par])?
            .with_prior(prior)
    }

    /// Zero-mean stationary AR(1) signal with a count observation family.
    /// Parameters: autoregression rho, ln state sd.
    #[allow(clippy::too_many_arguments)]
    pub fn ar1(
        y: DVector<f64>,
        rho: f64,
        sigma: f64,
        distribution: Distribution,
        phi: Vec<f64>,
        prior: PriorSpec,
    ) -> Result<Self> {
        let p1 = sigma * sigma / (1.0 - rho * rho);
        let model = Self::new(
            y,
            vec![DVector::from_element(1, 1.0)],
            vec![DMatrix::from_element(1, 1, rho)],
            vec![DMatrix::from_element(1, 1, sigma)],
            DVector::zeros(1),
            DMatrix::from_element(1, 1, p1),
            distribution,
            phi,
        )?;
        let model = model
            .with_estimated(vec![], vec![(0, 0, 0)], vec![(0, 0, 0)])?
            .with_log_scale(vec![false, true])?
            .with_prior(prior)?;
        Ok(model.with_stationary())
    }

    /// Stochastic volatility model: latent log-variance follows a stationary
    /// AR(1), `y = phi exp(alpha / 2) eps`. Parameters: rho, ln state sd,
    /// ln scale.
    pub fn stochastic_volatility(
        y: DVector<f64>,
        rho: f64,
        sigma_eta: f64,
        scale: f64,
        prior: PriorSpec,
    ) -> Result<Self> {
        let p1 = sigma_eta * sigma_eta / (1.0 - rho * rho);
        let model = Self::new(
            y,
            vec![DVector::from_element(1, 1.0)],
            vec![DMatrix::from_element(1, 1, rho)],
            vec![DMatrix::from_element(1, 1, sigma_eta)],
            DVector::zeros(1),
            DMatrix::from_element(1, 1, p1),
            Distribution::StochasticVolatility,
            vec![scale],
        )?;
        let model = model
            .with_estimated(vec![], vec![(0, 0, 0)], vec![(0, 0, 0)])?
            .with_estimated_dispersion()
            .with_log_scale(vec![false, true, true])?
            .with_prior(prior)?;
        Ok(model.with_stationary())
    }

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

    pub fn with_estimated(
        mut self,
        z_ind: Vec<(usize, usize)>,
        t_ind: Vec<(usize, usize, usize)>,
        r_ind: Vec<(usize, usize, usize)>,
    ) -> Result<Self> {
        let m = self.a1.len();
        let k = self.r[0].ncols();
        if z_ind.iter().any(|&(s, i)| s >= self.z.len() || i >= m)
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
        self.t_ind = t_ind;
        self.r_ind = r_ind;
        self.resize_log_scale();
        Ok(self)
    }

    /// Estimate the dispersion (negative binomial) or scale (SV) as the last
    /// parameter, on the log scale.
    pub fn with_estimated_dispersion(mut self) -> Self {
        self.dispersion_est = true;
        self.resize_log_scale();
        self
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

    pub fn with_stationary(mut self) -> Self {
        self.stationary = true;
        self.apply_stationary();
        self
    }

    pub fn n_par(&self) -> usize {
        self.z_ind.len() + self.t_ind.len() + self.r_ind.len() + self.xreg.ncols()
            + self.dispersion_est as usize
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    fn resize_log_scale(&mut self) {
        let n_par = self.n_par();
        self.log_scale.resize(n_par, false);
        if self.dispersion_est {
            // dispersion always rides on the log scale
            self.log_scale[n_par - 1] = true;
        }
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

impl StateSpace for NonGaussianModel {
    fn theta(&self) -> DVector<f64> {
        let mut theta = Vec::with_capacity(self.n_par());
        for &(s, i) in &self.z_ind {
            theta.push(self.z[s][i]);
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
        if self.dispersion_est {
            theta.push(self.phi[0]);
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
        if self.dispersion_est {
            let phi = self.from_sampled(theta[idx], idx);
            self.phi.fill(phi);
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

impl LatentLinear for NonGaussianModel {
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

impl NonGaussian for NonGaussianModel {
    fn distribution(&self) -> Distribution {
        self.distribution
    }

    fn phi_at(&self, t: usize) -> f64 {
        self.phi[t * (self.phi.len() > 1) as usize]
    }
}
