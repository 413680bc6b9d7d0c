//! Record state machine.
//!
//! Every queue backend computes the next version of a record with these
//! functions and then writes it with its own compare-and-swap primitive, so
//! the transition rules live in exactly one place.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::image::{ImageRecord, RecordStatus};

/// Message stored on records failed because a stale claim used the last attempt.
pub const ATTEMPTS_EXHAUSTED_MESSAGE: &str = "attempt limit reached before the last claim finished";

/// Invalid transition request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("record is not claimable (status {0})")]
    NotClaimable(RecordStatus),

    #[error("record is not being processed (status {0})")]
    NotProcessing(RecordStatus),

    #[error("record is claimed by {actual:?}, not {expected}")]
    NotClaimant {
        expected: String,
        actual: Option<String>,
    },
}

/// What a claim attempt should do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Take the claim
    Claim,
    /// Claimable, but the attempt budget is spent: move to FAILED
    Exhausted,
    /// Someone else holds a live claim, or the record is terminal
    Unavailable,
}

/// Result of processing a claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Detections persisted under `result_ref`
    Done { result_ref: String },
    /// Transient failure, retried while attempts remain
    Retry { error: String },
    /// Permanent failure
    Fail { error: String },
}

/// Outcome passed to `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// Wall time of the attempt
    pub elapsed_ms: Option<u64>,
}

impl Outcome {
    pub fn done(result_ref: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Done {
                result_ref: result_ref.into(),
            },
            elapsed_ms: None,
        }
    }

    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Retry {
                error: error.into(),
            },
            elapsed_ms: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Fail {
                error: error.into(),
            },
            elapsed_ms: None,
        }
    }

    /// Attach the attempt duration.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = Some(elapsed.as_millis() as u64);
        self
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self.kind {
            OutcomeKind::Done { .. } => "done",
            OutcomeKind::Retry { .. } => "retry",
            OutcomeKind::Fail { .. } => "fail",
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl ImageRecord {
    /// A PROCESSING record whose claim is strictly older than `reclaim_timeout`.
    pub fn is_reclaimable(&self, now: DateTime<Utc>, reclaim_timeout: Duration) -> bool {
        if self.status != RecordStatus::Processing {
            return false;
        }
        match self.claimed_at {
            Some(claimed_at) => now.signed_duration_since(claimed_at) > to_chrono(reclaim_timeout),
            // A processing record without a claim time cannot be owned by anyone.
            None => true,
        }
    }

    /// PENDING, or PROCESSING with a stale claim.
    pub fn is_claimable(&self, now: DateTime<Utc>, reclaim_timeout: Duration) -> bool {
        self.status == RecordStatus::Pending || self.is_reclaimable(now, reclaim_timeout)
    }

    /// Decide what a claim attempt does with this record.
    pub fn claim_decision(
        &self,
        now: DateTime<Utc>,
        reclaim_timeout: Duration,
        max_attempts: u32,
    ) -> ClaimDecision {
        if !self.is_claimable(now, reclaim_timeout) {
            return ClaimDecision::Unavailable;
        }
        if self.attempts >= max_attempts {
            ClaimDecision::Exhausted
        } else {
            ClaimDecision::Claim
        }
    }

    /// The record after `worker_id` claims it.
    pub fn claimed(&self, worker_id: &str, now: DateTime<Utc>) -> ImageRecord {
        let mut next = self.clone();
        next.status = RecordStatus::Processing;
        next.claimed_at = Some(now);
        next.claimed_by = Some(worker_id.to_string());
        next.attempts = self.attempts.saturating_add(1);
        next.updated_at = now;
        next
    }

    /// The record after a stale claim is found with no attempts left.
    pub fn exhausted(&self, now: DateTime<Utc>) -> ImageRecord {
        let mut next = self.clone();
        next.status = RecordStatus::Failed;
        next.claimed_at = None;
        next.claimed_by = None;
        if next.last_error.is_none() {
            next.last_error = Some(ATTEMPTS_EXHAUSTED_MESSAGE.to_string());
        }
        next.updated_at = now;
        next.completed_at = Some(now);
        next
    }

    /// The record after a stale claim is found to have a stored result.
    ///
    /// A worker that persisted its result but failed to finalize leaves the
    /// record PROCESSING; the next reclaim completes it instead of running it
    /// again or failing it.
    pub fn reconciled(&self, result_ref: &str, now: DateTime<Utc>) -> ImageRecord {
        let mut next = self.clone();
        next.status = RecordStatus::Done;
        next.result_ref = Some(result_ref.to_string());
        next.claimed_at = None;
        next.claimed_by = None;
        next.last_error = None;
        next.updated_at = now;
        next.completed_at = Some(now);
        next
    }

    /// The record after `worker_id` finalizes its claim with `outcome`.
    pub fn finalized(
        &self,
        worker_id: &str,
        outcome: &Outcome,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ImageRecord, TransitionError> {
        if self.status != RecordStatus::Processing {
            return Err(TransitionError::NotProcessing(self.status));
        }
        if self.claimed_by.as_deref() != Some(worker_id) {
            return Err(TransitionError::NotClaimant {
                expected: worker_id.to_string(),
                actual: self.claimed_by.clone(),
            });
        }

        let mut next = self.clone();
        next.claimed_at = None;
        next.claimed_by = None;
        next.updated_at = now;
        next.processing_time_ms = outcome.elapsed_ms.or(self.processing_time_ms);

        match &outcome.kind {
            OutcomeKind::Done { result_ref } => {
                next.status = RecordStatus::Done;
                next.result_ref = Some(result_ref.clone());
                next.last_error = None;
                next.completed_at = Some(now);
            }
            OutcomeKind::Retry { error } => {
                next.last_error = Some(error.clone());
                if self.attempts >= max_attempts {
                    next.status = RecordStatus::Failed;
                    next.completed_at = Some(now);
                } else {
                    next.status = RecordStatus::Pending;
                }
            }
            OutcomeKind::Fail { error } => {
                next.status = RecordStatus::Failed;
                next.last_error = Some(error.clone());
                next.completed_at = Some(now);
            }
        }

        Ok(next)
    }
}
