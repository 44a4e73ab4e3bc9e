//! Error types for the coordination and execution engines.

use conveyor_job::JobError;
use thiserror::Error;

/// Errors surfaced by the coordinator, pipeline runtime and aggregator.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Trigger id must be a non-empty string")]
    InvalidTriggerId,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Metadata lock not acquired within {0} seconds")]
    LockTimeout(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(i64),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Execution was canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Transient storage faults are worth retrying inside the metadata
    /// critical section; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(_))
    }
}
