//! Error taxonomy for a pipeline run.
//!
//! | Error              | Where it stops                       |
//! |--------------------|--------------------------------------|
//! | backend, generator | fatal to the generator pool and run  |
//! | backend, evaluator | absorbed as an empty ballot          |
//! | no consensus       | not an error, see `Decision::reason` |
//! | invalid config     | rejected before any backend call     |

use thiserror::Error;

use crate::backend::BackendError;

/// Errors from the generator and evaluator pools
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Generator {index} failed: {source}")]
    GeneratorFailed {
        index: usize,
        #[source]
        source: BackendError,
    },

    #[error("Pool task aborted: {0}")]
    TaskAborted(String),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Upload failed: {0}")]
    Upload(#[source] BackendError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short machine-readable label, used as the error event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::Upload(_) => "upload_failed",
            Self::Pool(PoolError::GeneratorFailed { .. }) => "generator_failed",
            Self::Pool(PoolError::TaskAborted(_)) => "task_aborted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the caller supplied bad input, as opposed to a runtime failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
