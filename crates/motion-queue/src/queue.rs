//! Work queue and result store contracts.

use std::time::Duration;

use async_trait::async_trait;

use motion_models::{DetectionResult, ImageId, ImageRecord, Outcome, RecordStatus};

use crate::error::QueueResult;

/// Per-invocation claim settings.
#[derive(Debug, Clone)]
pub struct ClaimContext {
    /// Identity written into `claimed_by`
    pub worker_id: String,
    /// Age after which a PROCESSING claim is considered abandoned
    pub reclaim_timeout: Duration,
    /// Attempt cap
    pub max_attempts: u32,
}

impl ClaimContext {
    pub fn new(worker_id: impl Into<String>, reclaim_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            reclaim_timeout,
            max_attempts,
        }
    }
}

/// Access to image records.
///
/// `claim` is the only synchronization point between workers: backends must
/// implement it as a single conditional write so that of any number of
/// concurrent claims on a record exactly one succeeds.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// PENDING records plus PROCESSING records with a claim older than
    /// `reclaim_timeout`, oldest `captured_at` first, at most `limit`.
    async fn list_claimable(
        &self,
        limit: usize,
        reclaim_timeout: Duration,
    ) -> QueueResult<Vec<ImageRecord>>;

    /// Take exclusive ownership of a record.
    ///
    /// Returns the updated record, `QueueError::AlreadyClaimed` when another
    /// worker holds or just took the claim, and `QueueError::AttemptsExhausted`
    /// when the record was failed instead because its attempts are spent.
    async fn claim(&self, id: &ImageId, ctx: &ClaimContext) -> QueueResult<ImageRecord>;

    /// Write the outcome of a claim and return the new status.
    ///
    /// Fails with `QueueError::ClaimLost` if the record is no longer held by
    /// `ctx.worker_id`.
    async fn finalize(
        &self,
        id: &ImageId,
        ctx: &ClaimContext,
        outcome: Outcome,
    ) -> QueueResult<RecordStatus>;

    /// Complete a stale claim whose result is already stored.
    ///
    /// Moves the record to DONE with `result_ref` under the same conditional
    /// write as `claim`. Returns `QueueError::AlreadyClaimed` when the record
    /// is not claimable any more.
    async fn reconcile(
        &self,
        id: &ImageId,
        ctx: &ClaimContext,
        result_ref: &str,
    ) -> QueueResult<RecordStatus>;

    /// Read a record.
    async fn get(&self, id: &ImageId) -> QueueResult<Option<ImageRecord>>;
}

/// Storage for detection results, keyed by image id.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create or replace the result for `result.image_id`. Returns its reference.
    async fn upsert(&self, result: &DetectionResult) -> QueueResult<String>;

    /// Read the result for an image.
    async fn get(&self, image_id: &ImageId) -> QueueResult<Option<DetectionResult>>;

    /// Reference of the stored result for an image, if any.
    async fn find_ref(&self, image_id: &ImageId) -> QueueResult<Option<String>> {
        Ok(self
            .get(image_id)
            .await?
            .map(|result| result.image_id.to_string()))
    }
}
