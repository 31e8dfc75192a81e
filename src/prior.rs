use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::utils::linalg::log_dnorm;

/// Prior for a single parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Uniform { min: f64, max: f64 },
    HalfNormal { sd: f64 },
    Normal { mean: f64, sd: f64 },
}

impl Prior {
    fn validate(&self) -> Result<()> {
        match *self {
            Prior::Uniform { min, max } if !(min < max) => Err(Error::BadPrior(format!(
                "uniform bounds must satisfy min < max, got [{min}, {max}]"
            ))),
            Prior::HalfNormal { sd } | Prior::Normal { sd, .. } if !(sd > 0.0) => Err(
                Error::BadPrior(format!("prior standard deviation must be positive, got {sd}")),
            ),
            _ => Ok(()),
        }
    }

    /// Support of the prior as a closed interval.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Prior::Uniform { min, max } => (min, max),
            Prior::HalfNormal { .. } => (0.0, f64::INFINITY),
            Prior::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn log_density(&self, x: f64) -> f64 {
        let (lo, hi) = self.bounds();
        if x < lo || x > hi {
            return f64::NEG_INFINITY;
        }
        match *self {
            Prior::Uniform { min, max } => -(max - min).ln(),
            Prior::HalfNormal { sd } => 2f64.ln() + log_dnorm(x, 0.0, sd),
            Prior::Normal { mean, sd } => log_dnorm(x, mean, sd),
        }
    }
}

/// Joint prior over the parameter vector, one independent component per entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorSpec {
    priors: Vec<Prior>,
}

impl PriorSpec {
    pub fn new(priors: Vec<Prior>) -> Result<Self> {
        for prior in &priors {
            prior.validate()?;
        }
        Ok(Self { priors })
    }

    /// Decode the wire form: a vector of kind tags (0 uniform, 1 half-normal,
    /// 2 normal) and a two-row parameter matrix column-aligned to the tags.
    pub fn from_tags(tags: &[u8], params: &DMatrix<f64>) -> Result<Self> {
        if params.nrows() != 2 || params.ncols() != tags.len() {
            return Err(Error::ShapeMismatch(format!(
                "prior parameter matrix must be 2x{}, got {}x{}",
                tags.len(),
                params.nrows(),
                params.ncols()
            )));
        }
        let priors = tags
            .iter()
            .enumerate()
            .map(|(i, &tag)| match tag {
                0 => Ok(Prior::Uniform {
                    min: params[(0, i)],
                    max: params[(1, i)],
                }),
                1 => Ok(Prior::HalfNormal { sd: params[(0, i)] }),
                2 => Ok(Prior::Normal {
                    mean: params[(0, i)],
                    sd: params[(1, i)],
                }),
                _ => Err(Error::BadPrior(format!("unknown prior kind tag {tag}"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(priors)
    }

    pub fn len(&self) -> usize {
        self.priors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    pub fn in_support(&self, theta: &DVector<f64>) -> bool {
        theta.iter().zip(&self.priors).all(|(&x, prior)| {
            let (lo, hi) = prior.bounds();
            x >= lo && x <= hi
        })
    }

    pub fn log_density(&self, theta: &DVector<f64>) -> f64 {
        theta
            .iter()
            .zip(&self.priors)
            .map(|(&x, prior)| prior.log_density(x))
            .sum()
    }
}
