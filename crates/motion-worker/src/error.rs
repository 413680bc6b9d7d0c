//! Worker error types.

use std::time::Duration;

use thiserror::Error;

use motion_detect::DetectError;
use motion_queue::QueueError;
use motion_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The batch could not start. The only error that fails an invocation.
    #[error("Failed to list claimable records: {0}")]
    ListFailed(#[source] QueueError),

    #[error("{operation} timed out after {}s", .after.as_secs_f32())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Detection error: {0}")]
    Detect(#[from] DetectError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }

    /// Failure kind used as the key of a `FailurePolicy`.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Detect(DetectError::InvalidImage(_)) => "invalid_image",
            WorkerError::Detect(DetectError::Encode(_)) => "annotate",
            WorkerError::Detect(_) => "inference",
            WorkerError::Storage(e) if e.is_not_found() => "storage_not_found",
            WorkerError::Storage(_) => "storage",
            WorkerError::Queue(_) | WorkerError::ListFailed(_) => "store",
            WorkerError::Timeout { .. } => "timeout",
            WorkerError::ConfigError(_) => "config",
            WorkerError::Task(_) => "task",
            WorkerError::Io(_) => "io",
        }
    }
}
