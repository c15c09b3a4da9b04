use thiserror::Error;

/// Errors reported by chain handling, model fitting and evidence estimation.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarmonicError {
    #[error(
        "training proportion {proportion} splits {nchains} chains into {ntrain} training and {ntest} test chains"
    )]
    InvalidProportion {
        proportion: f64,
        nchains: usize,
        ntrain: usize,
        ntest: usize,
    },
    #[error("at least {required} chains required, but only {available} available")]
    InsufficientChains { required: usize, available: usize },
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("number of chains mismatch: expected {expected}, found {found}")]
    ChainCountMismatch { expected: usize, found: usize },
    #[error("position outside of the model domain: {0}")]
    OutOfDomain(String),
    #[error("model fit did not converge: {0}")]
    FitDivergence(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("density model has not been fitted")]
    NotFitted,
    #[error("degenerate evidence estimate: {0}")]
    DegenerateEstimate(String),
}

impl HarmonicError {
    /// Recoverable errors affect a single fit or evaluation. A
    /// cross-validation sweep records them as a worst-case score and
    /// continues, every other error aborts the sweep.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HarmonicError::FitDivergence(_)
                | HarmonicError::OutOfDomain(_)
                | HarmonicError::DegenerateEstimate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarmonicError>;
