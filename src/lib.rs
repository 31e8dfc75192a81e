//! Bayesian inference for univariate state space models.
//!
//! The crate couples exact Kalman filtering/smoothing for linear Gaussian
//! models with sequential Monte Carlo (bootstrap and ψ-auxiliary particle
//! filters) and several Metropolis-Hastings variants (plain, pseudo-marginal,
//! delayed acceptance, importance-sampling corrected), all driven by a
//! self-tuning random walk proposal (Robust Adaptive Metropolis).
//!
//! Model families share a small capability surface (see [`models`]): a
//! parameter interface plus accessors for the linear backbone, so the same
//! filter, smoother and sampler code runs on Gaussian, exponential-family,
//! stochastic volatility, nonlinear (callback-driven) and SDE models.
//!
//! Every algorithm is deterministic given its seed; there is no global RNG.

pub mod approximation;
pub mod error;
pub mod kalman;
pub mod mcmc;
pub mod models;
pub mod particle;
pub mod predict;
pub mod prior;
pub mod run;
pub mod utils;

pub use error::{Error, Result};
pub use prior::{Prior, PriorSpec};
