//! Queue error types.

use motion_models::{RecordStatus, TransitionError};
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Another worker won the claim, or the record is no longer claimable.
    #[error("Record already claimed: {0}")]
    AlreadyClaimed(String),

    /// The record used its attempt budget and was moved to FAILED.
    #[error("Record {0} exhausted its attempts and was failed")]
    AttemptsExhausted(String),

    /// The claim was taken over before finalize; nothing was written.
    #[error("Claim lost on record {id}: {reason}")]
    ClaimLost { id: String, reason: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    /// Backend I/O failure.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),
}

impl QueueError {
    pub fn already_claimed(id: impl Into<String>) -> Self {
        Self::AlreadyClaimed(id.into())
    }

    pub fn claim_lost(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ClaimLost {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Map a rejected finalize transition to `ClaimLost`.
    pub fn from_finalize(id: impl Into<String>, err: TransitionError) -> Self {
        Self::claim_lost(id, err.to_string())
    }

    /// A claim attempt found the record in a state it cannot leave for PROCESSING.
    pub fn not_claimable(id: impl Into<String>, status: RecordStatus) -> Self {
        Self::AlreadyClaimed(format!("{} ({})", id.into(), status))
    }

    /// Check if this error is benign contention rather than a failure.
    pub fn is_contention(&self) -> bool {
        matches!(self, QueueError::AlreadyClaimed(_) | QueueError::ClaimLost { .. })
    }
}
