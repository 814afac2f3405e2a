use thiserror::Error;

/// Errors raised by the inversion engine.
///
/// Numerical problems in forward-model output are not represented here: non-finite
/// values are clipped to negative infinity and only reported as aggregate counts.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum InversionError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Job {job} failed")]
    WorkerFailure {
        job: u64,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Can not combine ln pdfs of length {left} and {right}")]
    SizeMismatch { left: usize, right: usize },
    #[error("Every candidate has zero probability, there is no probability mass to normalize")]
    NoProbabilityMass,
    #[error("Job pool is closed and does not accept new jobs")]
    PoolClosed,
    #[error("All initialisation points failed after {attempts} attempts")]
    InitialisationFailed { attempts: usize },
    #[error("Algorithm output requested before termination")]
    NotTerminated,
}

impl InversionError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        InversionError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, InversionError>;
