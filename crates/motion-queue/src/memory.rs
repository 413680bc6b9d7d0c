//! In-memory queue and result store.
//!
//! Records live in a map behind one async mutex; every mutation reads,
//! decides and writes under the lock, which gives the same exclusive-claim
//! guarantee as a conditional update in a real database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use motion_models::{
    ClaimDecision, DetectionResult, ImageId, ImageRecord, Outcome, RecordStatus,
};

use crate::error::{QueueError, QueueResult};
use crate::queue::{ClaimContext, ResultStore, WorkQueue};

/// `WorkQueue` backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryQueue {
    records: Mutex<HashMap<ImageId, ImageRecord>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is.
    pub async fn insert(&self, record: ImageRecord) {
        self.records.lock().await.insert(record.id.clone(), record);
    }

    /// Snapshot of every record, ordered by `captured_at`.
    pub async fn records(&self) -> Vec<ImageRecord> {
        let mut all: Vec<ImageRecord> = self.records.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.id.0.cmp(&b.id.0)));
        all
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn list_claimable(
        &self,
        limit: usize,
        reclaim_timeout: Duration,
    ) -> QueueResult<Vec<ImageRecord>> {
        let now = Utc::now();
        let records = self.records.lock().await;

        let mut claimable: Vec<ImageRecord> = records
            .values()
            .filter(|r| r.is_claimable(now, reclaim_timeout))
            .cloned()
            .collect();
        claimable.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.id.0.cmp(&b.id.0)));
        claimable.truncate(limit);

        Ok(claimable)
    }

    async fn claim(&self, id: &ImageId, ctx: &ClaimContext) -> QueueResult<ImageRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let current = records
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        match current.claim_decision(now, ctx.reclaim_timeout, ctx.max_attempts) {
            ClaimDecision::Claim => {
                let next = current.claimed(&ctx.worker_id, now);
                records.insert(id.clone(), next.clone());
                debug!(image_id = %id, worker_id = %ctx.worker_id, attempts = next.attempts, "Claimed record");
                Ok(next)
            }
            ClaimDecision::Exhausted => {
                let next = current.exhausted(now);
                records.insert(id.clone(), next);
                Err(QueueError::AttemptsExhausted(id.to_string()))
            }
            ClaimDecision::Unavailable => Err(QueueError::not_claimable(id.as_str(), current.status)),
        }
    }

    async fn finalize(
        &self,
        id: &ImageId,
        ctx: &ClaimContext,
        outcome: Outcome,
    ) -> QueueResult<RecordStatus> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let current = records
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let next = current
            .finalized(&ctx.worker_id, &outcome, ctx.max_attempts, now)
            .map_err(|e| QueueError::from_finalize(id.as_str(), e))?;
        let status = next.status;
        records.insert(id.clone(), next);

        Ok(status)
    }

    async fn reconcile(
        &self,
        id: &ImageId,
        ctx: &ClaimContext,
        result_ref: &str,
    ) -> QueueResult<RecordStatus> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let current = records
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if !current.is_claimable(now, ctx.reclaim_timeout) {
            return Err(QueueError::not_claimable(id.as_str(), current.status));
        }
        let next = current.reconciled(result_ref, now);
        let status = next.status;
        records.insert(id.clone(), next);
        debug!(image_id = %id, worker_id = %ctx.worker_id, "Reconciled stale claim with stored result");

        Ok(status)
    }

    async fn get(&self, id: &ImageId) -> QueueResult<Option<ImageRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }
}

/// `ResultStore` backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<HashMap<ImageId, DetectionResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.lock().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn upsert(&self, result: &DetectionResult) -> QueueResult<String> {
        self.results
            .lock()
            .await
            .insert(result.image_id.clone(), result.clone());
        Ok(result.image_id.to_string())
    }

    async fn get(&self, image_id: &ImageId) -> QueueResult<Option<DetectionResult>> {
        Ok(self.results.lock().await.get(image_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration as ChronoDuration};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn ctx(worker: &str) -> ClaimContext {
        ClaimContext::new(worker, TIMEOUT, 3)
    }

    fn record(id: &str, captured_at: DateTime<Utc>) -> ImageRecord {
        ImageRecord::new_pending(ImageId::from(id), format!("raw/{}.jpg", id), captured_at)
    }

    fn stale(id: &str, attempts: u32) -> ImageRecord {
        let mut r = record(id, Utc::now() - ChronoDuration::hours(2))
            .claimed("crashed-worker", Utc::now() - ChronoDuration::hours(1));
        r.attempts = attempts;
        r
    }

    #[tokio::test]
    async fn test_list_orders_and_limits() {
        let queue = MemoryQueue::new();
        let base = Utc::now() - ChronoDuration::minutes(10);
        queue.insert(record("c", base + ChronoDuration::seconds(3))).await;
        queue.insert(record("a", base + ChronoDuration::seconds(1))).await;
        queue.insert(record("b", base + ChronoDuration::seconds(2))).await;

        let listed = queue.list_claimable(2, TIMEOUT).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_list_skips_live_claims_and_terminal_records() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        queue.insert(record("live", now).claimed("other", now)).await;
        queue.insert(stale("stale", 1)).await;

        let mut done = record("done", now).claimed("w", now);
        done = done.finalized("w", &Outcome::done("done"), 3, now).unwrap();
        queue.insert(done).await;

        let listed = queue.list_claimable(10, TIMEOUT).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["stale"]);
    }

    #[tokio::test]
    async fn test_claim_then_second_claim_is_rejected() {
        let queue = MemoryQueue::new();
        queue.insert(record("img-1", Utc::now())).await;
        let id = ImageId::from("img-1");

        let claimed = queue.claim(&id, &ctx("worker-a")).await.unwrap();
        assert_eq!(claimed.status, RecordStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        let err = queue.claim(&id, &ctx("worker-b")).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyClaimed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let queue = Arc::new(MemoryQueue::new());
        queue.insert(record("img-1", Utc::now())).await;

        let attempts = (0..8).map(|i| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .claim(&ImageId::from("img-1"), &ctx(&format!("worker-{}", i)))
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let winners = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(QueueError::AlreadyClaimed(_)))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 7);
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimed() {
        let queue = MemoryQueue::new();
        queue.insert(stale("img-1", 1)).await;

        let claimed = queue
            .claim(&ImageId::from("img-1"), &ctx("worker-b"))
            .await
            .unwrap();
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-b"));
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_claim_without_budget_is_failed() {
        let queue = MemoryQueue::new();
        queue.insert(stale("img-1", 3)).await;
        let id = ImageId::from("img-1");

        let err = queue.claim(&id, &ctx("worker-b")).await.unwrap_err();
        assert!(matches!(err, QueueError::AttemptsExhausted(_)));

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Failed);
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn test_finalize_retry_then_fail_at_cap() {
        let queue = MemoryQueue::new();
        queue.insert(record("img-1", Utc::now())).await;
        let id = ImageId::from("img-1");
        let ctx = ClaimContext::new("worker-a", TIMEOUT, 2);

        queue.claim(&id, &ctx).await.unwrap();
        let status = queue.finalize(&id, &ctx, Outcome::retry("timeout")).await.unwrap();
        assert_eq!(status, RecordStatus::Pending);

        queue.claim(&id, &ctx).await.unwrap();
        let status = queue.finalize(&id, &ctx, Outcome::retry("timeout")).await.unwrap();
        assert_eq!(status, RecordStatus::Failed);

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_finalize_after_reclaim_is_claim_lost() {
        let queue = MemoryQueue::new();
        queue.insert(stale("img-1", 1)).await;
        let id = ImageId::from("img-1");

        queue.claim(&id, &ctx("worker-b")).await.unwrap();

        let err = queue
            .finalize(&id, &ctx("crashed-worker"), Outcome::done("img-1"))
            .await
            .unwrap_err();
        assert!(err.is_contention());

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Processing);
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn test_reconcile_completes_exhausted_stale_claim() {
        let queue = MemoryQueue::new();
        queue.insert(stale("img-1", 3)).await;
        let id = ImageId::from("img-1");

        let status = queue.reconcile(&id, &ctx("worker-b"), "img-1").await.unwrap();
        assert_eq!(status, RecordStatus::Done);

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Done);
        assert_eq!(stored.result_ref.as_deref(), Some("img-1"));
        assert_eq!(stored.attempts, 3);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_leaves_live_claim_alone() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        queue.insert(record("img-1", now).claimed("worker-a", now)).await;
        let id = ImageId::from("img-1");

        let err = queue.reconcile(&id, &ctx("worker-b"), "img-1").await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyClaimed(_)));

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Processing);
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn test_claim_missing_record() {
        let queue = MemoryQueue::new();
        let err = queue
            .claim(&ImageId::from("nope"), &ctx("worker-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_result_upsert_replaces() {
        let store = MemoryResultStore::new();
        let first = DetectionResult::new(ImageId::from("img-1"), vec![], "v1", 10, 10);
        let second = DetectionResult::new(ImageId::from("img-1"), vec![], "v2", 10, 10);

        assert_eq!(store.upsert(&first).await.unwrap(), "img-1");
        store.upsert(&second).await.unwrap();

        assert_eq!(store.len().await, 1);
        let stored = store.get(&ImageId::from("img-1")).await.unwrap().unwrap();
        assert_eq!(stored.model_version, "v2");
    }

    #[tokio::test]
    async fn test_find_ref() {
        let store = MemoryResultStore::new();
        assert_eq!(store.find_ref(&ImageId::from("img-1")).await.unwrap(), None);

        let result = DetectionResult::new(ImageId::from("img-1"), vec![], "v1", 10, 10);
        let reference = store.upsert(&result).await.unwrap();
        assert_eq!(
            store.find_ref(&ImageId::from("img-1")).await.unwrap(),
            Some(reference)
        );
    }
}
