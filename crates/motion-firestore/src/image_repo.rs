//! Image record repository: the production `WorkQueue`.
//!
//! Every state change is read-decide-write: the document is read together
//! with its `updateTime`, the next record is computed by the shared state
//! machine, and the write carries `currentDocument.updateTime` so it only
//! lands if nobody touched the document in between.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use motion_models::{ClaimDecision, ImageId, ImageRecord, Outcome, RecordStatus};
use motion_queue::{ClaimContext, QueueError, QueueResult, WorkQueue};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_precondition_conflict;
use crate::types::{Document, Filter, FromFirestoreValue, StructuredQuery, ToFirestoreValue, Value};

/// Default collection for image records.
pub const DEFAULT_IMAGES_COLLECTION: &str = "images";

/// Fields owned by the worker. Writes are masked to these so fields added by
/// the upload path survive.
/// Minimum page size for the stale-claim query.
///
/// Firestore requires the first `orderBy` of a query with an inequality
/// filter to be on that field, so stale claims come back ordered by
/// `claimed_at`, not `captured_at`. The page is widened past the batch limit
/// and re-sorted by `captured_at` before truncation.
pub const STALE_SCAN_LIMIT: usize = 200;

const TRANSITION_FIELDS: [&str; 9] = [
    "status",
    "claimed_at",
    "claimed_by",
    "attempts",
    "result_ref",
    "last_error",
    "processing_time_ms",
    "updated_at",
    "completed_at",
];

impl From<FirestoreError> for QueueError {
    fn from(e: FirestoreError) -> Self {
        QueueError::Store(e.to_string())
    }
}

/// Repository for `images/{id}` documents.
#[derive(Clone)]
pub struct ImageRepository {
    client: FirestoreClient,
    collection: String,
}

impl ImageRepository {
    pub fn new(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Repository over `IMAGES_COLLECTION` (default `images`).
    pub fn from_env(client: FirestoreClient) -> Self {
        let collection = std::env::var("IMAGES_COLLECTION")
            .ok()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGES_COLLECTION.to_string());
        Self::new(client, collection)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create a pending record, as the upload path does.
    pub async fn create(&self, record: &ImageRecord) -> FirestoreResult<()> {
        self.client
            .update_document(&self.collection, record.id.as_str(), record_to_fields(record), None)
            .await?;
        Ok(())
    }

    /// Read a record together with its `updateTime`.
    async fn read(&self, id: &ImageId) -> FirestoreResult<Option<(ImageRecord, String)>> {
        let doc = self
            .client
            .with_retry("get_image", || {
                self.client.get_document(&self.collection, id.as_str())
            })
            .await?;

        let Some(doc) = doc else {
            return Ok(None);
        };
        let update_time = doc.update_time.clone().ok_or_else(|| {
            FirestoreError::invalid_response(format!("{}/{} has no updateTime", self.collection, id))
        })?;
        Ok(Some((document_to_record(&doc, id)?, update_time)))
    }

    /// Conditionally write the transition fields of `next`.
    async fn write_if_unchanged(
        &self,
        next: &ImageRecord,
        update_time: &str,
    ) -> FirestoreResult<()> {
        let mut fields = record_to_fields(next);
        fields.retain(|k, _| TRANSITION_FIELDS.contains(&k.as_str()));
        let mask = TRANSITION_FIELDS.iter().map(|f| f.to_string()).collect();

        let result = self
            .client
            .update_document_with_precondition(
                &self.collection,
                next.id.as_str(),
                fields,
                Some(mask),
                update_time,
            )
            .await;

        if let Err(e) = &result {
            if e.is_precondition_failed() {
                record_precondition_conflict(&self.collection);
            }
        }
        result.map(|_| ())
    }

    async fn query(&self, query: StructuredQuery) -> FirestoreResult<Vec<ImageRecord>> {
        let docs = self
            .client
            .with_retry("list_images", || self.client.run_query("", query.clone()))
            .await?;

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(id) = doc.id().map(ImageId::from) else {
                continue;
            };
            match document_to_record(&doc, &id) {
                Ok(record) => records.push(record),
                Err(e) => warn!(image_id = %id, "Skipping unreadable image record: {}", e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl WorkQueue for ImageRepository {
    async fn list_claimable(
        &self,
        limit: usize,
        reclaim_timeout: Duration,
    ) -> QueueResult<Vec<ImageRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(reclaim_timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let pending = StructuredQuery::collection(&self.collection)
            .filter(Filter::field(
                "status",
                "EQUAL",
                RecordStatus::Pending.as_str().to_firestore_value(),
            ))
            .order_by("captured_at", "ASCENDING")
            .limit(limit);

        let stale = StructuredQuery::collection(&self.collection)
            .filter(Filter::and(vec![
                Filter::field(
                    "status",
                    "EQUAL",
                    RecordStatus::Processing.as_str().to_firestore_value(),
                ),
                Filter::field("claimed_at", "LESS_THAN", cutoff.to_firestore_value()),
            ]))
            .order_by("claimed_at", "ASCENDING")
            .limit(limit.max(STALE_SCAN_LIMIT));

        let mut records = self.query(pending).await?;
        records.extend(self.query(stale).await?);

        // Query results can lag behind writes; re-check against the state machine.
        records.retain(|r| r.is_claimable(now, reclaim_timeout));
        records.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.id.0.cmp(&b.id.0)));
        records.dedup_by(|a, b| a.id == b.id);
        records.truncate(limit);

        debug!(collection = %self.collection, count = records.len(), "Listed claimable images");
        Ok(records)
    }

    async fn claim(&self, id: &ImageId, ctx: &ClaimContext) -> QueueResult<ImageRecord> {
        let (current, update_time) = self
            .read(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let now = Utc::now();

        match current.claim_decision(now, ctx.reclaim_timeout, ctx.max_attempts) {
            ClaimDecision::Claim => {
                let next = current.claimed(&ctx.worker_id, now);
                match self.write_if_unchanged(&next, &update_time).await {
                    Ok(()) => Ok(next),
                    Err(e) if e.is_precondition_failed() => Err(QueueError::already_claimed(id.as_str())),
                    Err(e) => Err(e.into()),
                }
            }
            ClaimDecision::Exhausted => {
                let next = current.exhausted(now);
                match self.write_if_unchanged(&next, &update_time).await {
                    Ok(()) => Err(QueueError::AttemptsExhausted(id.to_string())),
                    Err(e) if e.is_precondition_failed() => Err(QueueError::already_claimed(id.as_str())),
                    Err(e) => Err(e.into()),
                }
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
        let (current, update_time) = self
            .read(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let next = current
            .finalized(&ctx.worker_id, &outcome, ctx.max_attempts, Utc::now())
            .map_err(|e| QueueError::from_finalize(id.as_str(), e))?;

        match self.write_if_unchanged(&next, &update_time).await {
            Ok(()) => Ok(next.status),
            Err(e) if e.is_precondition_failed() => Err(QueueError::claim_lost(
                id.as_str(),
                "record changed while finalizing",
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile(
        &self,
        id: &ImageId,
        ctx: &ClaimContext,
        result_ref: &str,
    ) -> QueueResult<RecordStatus> {
        let (current, update_time) = self
            .read(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let now = Utc::now();

        if !current.is_claimable(now, ctx.reclaim_timeout) {
            return Err(QueueError::not_claimable(id.as_str(), current.status));
        }
        let next = current.reconciled(result_ref, now);

        match self.write_if_unchanged(&next, &update_time).await {
            Ok(()) => {
                debug!(image_id = %id, worker_id = %ctx.worker_id, "Reconciled stale claim with stored result");
                Ok(next.status)
            }
            Err(e) if e.is_precondition_failed() => Err(QueueError::already_claimed(id.as_str())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &ImageId) -> QueueResult<Option<ImageRecord>> {
        Ok(self.read(id).await?.map(|(record, _)| record))
    }
}

fn record_to_fields(record: &ImageRecord) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("camera_id".to_string(), record.camera_id.to_firestore_value());
    fields.insert("filename".to_string(), record.filename.to_firestore_value());
    fields.insert("captured_at".to_string(), record.captured_at.to_firestore_value());
    fields.insert("storage_ref".to_string(), record.storage_ref.to_firestore_value());
    fields.insert("status".to_string(), record.status.as_str().to_firestore_value());
    fields.insert("claimed_at".to_string(), record.claimed_at.to_firestore_value());
    fields.insert("claimed_by".to_string(), record.claimed_by.to_firestore_value());
    fields.insert("attempts".to_string(), record.attempts.to_firestore_value());
    fields.insert("result_ref".to_string(), record.result_ref.to_firestore_value());
    fields.insert("last_error".to_string(), record.last_error.to_firestore_value());
    fields.insert(
        "processing_time_ms".to_string(),
        record.processing_time_ms.to_firestore_value(),
    );
    fields.insert("updated_at".to_string(), record.updated_at.to_firestore_value());
    fields.insert("completed_at".to_string(), record.completed_at.to_firestore_value());
    fields
}

fn document_to_record(doc: &Document, id: &ImageId) -> FirestoreResult<ImageRecord> {
    let fields = doc.fields.as_ref().ok_or_else(|| {
        FirestoreError::invalid_response(format!("Image {} has no fields", id))
    })?;

    let get = |key: &str| fields.get(key);
    let get_string = |key: &str| get(key).and_then(String::from_firestore_value);
    let get_time = |key: &str| get(key).and_then(DateTime::<Utc>::from_firestore_value);

    let status = match get_string("status") {
        Some(s) => s
            .parse::<RecordStatus>()
            .map_err(FirestoreError::invalid_response)?,
        None => RecordStatus::Pending,
    };

    let captured_at = get_time("captured_at").ok_or_else(|| {
        FirestoreError::invalid_response(format!("Image {} has no captured_at", id))
    })?;
    let storage_ref = get_string("storage_ref").ok_or_else(|| {
        FirestoreError::invalid_response(format!("Image {} has no storage_ref", id))
    })?;

    let filename = get_string("filename").unwrap_or_else(|| {
        storage_ref
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    });

    Ok(ImageRecord {
        id: id.clone(),
        camera_id: get_string("camera_id"),
        filename,
        captured_at,
        storage_ref,
        status,
        claimed_at: get_time("claimed_at"),
        claimed_by: get_string("claimed_by"),
        attempts: get("attempts").and_then(u32::from_firestore_value).unwrap_or(0),
        result_ref: get_string("result_ref"),
        last_error: get_string("last_error"),
        processing_time_ms: get("processing_time_ms").and_then(u64::from_firestore_value),
        updated_at: get_time("updated_at").unwrap_or(captured_at),
        completed_at: get_time("completed_at"),
    })
}
