use thiserror::Error;

/// Configuration errors, reported before any work starts.
///
/// Numerical degeneracies during a run (singular prediction variance,
/// exhausted particle weights) are not errors; they surface through the
/// log-likelihood and the acceptance rate instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("observation series is empty")]
    EmptySeries,

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("prior has {found} entries but the parameter vector has {expected}")]
    PriorLength { expected: usize, found: usize },

    #[error("invalid prior: {0}")]
    BadPrior(String),

    #[error("{name} must lie in {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },

    #[error("proposal root must be a {expected}x{expected} matrix, got {rows}x{cols}")]
    ProposalShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("thinning must be 1 when samples are stored deduplicated")]
    ThinnedBlockStorage,

    #[error("expected one seed per worker: {workers} workers, {seeds} seeds")]
    SeedCount { workers: usize, seeds: usize },

    #[error("covariance is not positive semidefinite")]
    NotPsd,

    #[error("could not build worker pool: {0}")]
    ThreadPool(String),

    #[error("{0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
