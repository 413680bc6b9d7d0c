//! One invocation of the detection pipeline.
//!
//! `run_once` lists claimable records, claims each one, and drives it to a
//! state transition. Every per-record failure ends in `finalize`; only a
//! failed listing aborts the invocation.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, Instrument};

use motion_detect::{Detector, Inference};
use motion_models::{ImageRecord, Outcome, RecordStatus};
use motion_queue::{ClaimContext, QueueError, ResultStore, WorkQueue};
use motion_storage::BlobStore;

use crate::config::WorkerConfig;
use crate::deadline::bounded;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::RecordLogger;
use crate::metrics;
use crate::result_writer::ResultWriter;

/// Counts for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Records returned by the listing
    pub listed: usize,
    /// Claims this worker won
    pub claimed: usize,
    /// Records another worker took first
    pub skipped: usize,
    pub done: usize,
    /// Stale claims completed from an already stored result, included in `done`
    pub reconciled: usize,
    /// Records put back to PENDING
    pub retried: usize,
    /// Records moved to FAILED, including stale claims out of attempts
    pub failed: usize,
    /// Failures that left a record without a transition, as `id: message`
    pub errors: Vec<String>,
}

impl BatchReport {
    fn add(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Exhausted => self.failed += 1,
            RecordOutcome::Reconciled => {
                self.done += 1;
                self.reconciled += 1;
            }
            RecordOutcome::Finalized(status) => {
                self.claimed += 1;
                match status {
                    RecordStatus::Done => self.done += 1,
                    RecordStatus::Failed => self.failed += 1,
                    _ => self.retried += 1,
                }
            }
            RecordOutcome::Unfinalized(message) => {
                self.claimed += 1;
                self.errors.push(message);
            }
            RecordOutcome::ClaimFailed(message) => self.errors.push(message),
        }
    }
}

/// What happened to one listed record.
#[derive(Debug)]
enum RecordOutcome {
    Skipped,
    Exhausted,
    /// Stale claim moved to DONE from a stored result
    Reconciled,
    Finalized(RecordStatus),
    /// Claimed, but the finalize write did not land
    Unfinalized(String),
    ClaimFailed(String),
}

/// Drives claimed records through fetch, inference and persistence.
pub struct PipelineRunner {
    queue: Arc<dyn WorkQueue>,
    blobs: Arc<dyn BlobStore>,
    results: Arc<dyn ResultStore>,
    detector: Arc<dyn Detector>,
    writer: ResultWriter,
    ctx: ClaimContext,
    config: WorkerConfig,
}

impl PipelineRunner {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        blobs: Arc<dyn BlobStore>,
        results: Arc<dyn ResultStore>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        let writer = ResultWriter::new(blobs.clone(), results.clone(), &config);
        Self {
            queue,
            blobs,
            results,
            detector,
            writer,
            ctx: config.claim_context(),
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Process up to `batch_limit` claimable records.
    pub async fn run_once(&self, batch_limit: usize) -> WorkerResult<BatchReport> {
        let started = Instant::now();

        let records = self
            .queue
            .list_claimable(batch_limit, self.config.reclaim_timeout)
            .await
            .map_err(WorkerError::ListFailed)?;

        let mut report = BatchReport {
            listed: records.len(),
            ..BatchReport::default()
        };
        info!(
            worker_id = %self.ctx.worker_id,
            listed = report.listed,
            "Starting batch"
        );

        let outcomes: Vec<RecordOutcome> = stream::iter(records)
            .map(|record| self.process_record(record))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.add(outcome);
        }

        metrics::record_batch(&report, started.elapsed().as_secs_f64());
        info!(
            worker_id = %self.ctx.worker_id,
            listed = report.listed,
            claimed = report.claimed,
            skipped = report.skipped,
            done = report.done,
            reconciled = report.reconciled,
            retried = report.retried,
            failed = report.failed,
            errors = report.errors.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );

        Ok(report)
    }

    async fn process_record(&self, record: ImageRecord) -> RecordOutcome {
        let logger = RecordLogger::new(&record.id, "detect");
        let span = logger.create_span();

        async {
            if record.status == RecordStatus::Processing {
                if let Some(outcome) = self.reconcile_stale(&record, &logger).await {
                    return outcome;
                }
            }

            let claimed = match self.queue.claim(&record.id, &self.ctx).await {
                Ok(claimed) => claimed,
                Err(QueueError::AlreadyClaimed(reason)) => {
                    logger.log_skip(&format!("already claimed: {}", reason));
                    metrics::record_outcome("skipped");
                    return RecordOutcome::Skipped;
                }
                Err(QueueError::NotFound(_)) => {
                    logger.log_skip("record disappeared before claim");
                    metrics::record_outcome("skipped");
                    return RecordOutcome::Skipped;
                }
                Err(QueueError::AttemptsExhausted(_)) => {
                    logger.log_warning("stale claim with no attempts left, marked failed");
                    metrics::record_outcome("exhausted");
                    return RecordOutcome::Exhausted;
                }
                Err(e) => {
                    logger.log_error(&format!("claim failed: {}", e));
                    metrics::record_outcome("claim_error");
                    return RecordOutcome::ClaimFailed(format!("{}: {}", record.id, e));
                }
            };

            logger.log_start(&format!("attempt {}", claimed.attempts));
            let started = Instant::now();

            let outcome = match self.execute(&claimed).await {
                Ok(result_ref) => Outcome::done(result_ref),
                Err(e) => {
                    let outcome = self.config.failure_policy.outcome_for(&e);
                    logger.log_warning(&format!("{} ({}): {}", outcome.label(), e.kind(), e));
                    outcome
                }
            }
            .with_elapsed(started.elapsed());

            let label = outcome.label();
            match self.queue.finalize(&claimed.id, &self.ctx, outcome).await {
                Ok(status) => {
                    metrics::record_outcome(label);
                    logger.log_completion(&format!("status {}", status));
                    RecordOutcome::Finalized(status)
                }
                Err(e) => {
                    // Left PROCESSING; it becomes claimable after the reclaim timeout.
                    metrics::record_outcome("finalize_error");
                    logger.log_error(&format!("finalize failed: {}", e));
                    RecordOutcome::Unfinalized(format!("{}: {}", claimed.id, e))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Complete a stale claim whose worker stored the result but never
    /// finalized. `None` means there is no stored result and the record should
    /// be claimed as usual.
    async fn reconcile_stale(
        &self,
        record: &ImageRecord,
        logger: &RecordLogger,
    ) -> Option<RecordOutcome> {
        let found = bounded(
            "result lookup",
            self.config.storage_timeout,
            self.results.find_ref(&record.id),
        )
        .await;

        let result_ref = match found {
            Ok(Some(result_ref)) => result_ref,
            Ok(None) => return None,
            Err(e) => {
                // Claiming without knowing could fail a record that has a result.
                logger.log_error(&format!("result lookup failed: {}", e));
                metrics::record_outcome("claim_error");
                return Some(RecordOutcome::ClaimFailed(format!("{}: {}", record.id, e)));
            }
        };

        match self.queue.reconcile(&record.id, &self.ctx, &result_ref).await {
            Ok(status) => {
                metrics::record_outcome("reconciled");
                logger.log_completion(&format!("stored result {} found, status {}", result_ref, status));
                Some(RecordOutcome::Reconciled)
            }
            Err(QueueError::AlreadyClaimed(reason)) => {
                logger.log_skip(&format!("already claimed: {}", reason));
                metrics::record_outcome("skipped");
                Some(RecordOutcome::Skipped)
            }
            Err(QueueError::NotFound(_)) => {
                logger.log_skip("record disappeared before reconcile");
                metrics::record_outcome("skipped");
                Some(RecordOutcome::Skipped)
            }
            Err(e) => {
                logger.log_error(&format!("reconcile failed: {}", e));
                metrics::record_outcome("claim_error");
                Some(RecordOutcome::ClaimFailed(format!("{}: {}", record.id, e)))
            }
        }
    }

    /// Fetch, infer and persist. Returns the result reference.
    async fn execute(&self, record: &ImageRecord) -> WorkerResult<String> {
        let logger = RecordLogger::new(&record.id, "detect");

        let bytes = bounded(
            "blob get",
            self.config.storage_timeout,
            self.blobs.get(&record.storage_ref),
        )
        .await?;
        logger.log_progress(&format!("fetched {} bytes", bytes.len()));

        let bytes: Arc<[u8]> = Arc::from(bytes);
        let inference = self.infer(bytes.clone()).await?;
        logger.log_progress(&format!("{} detections", inference.detections.len()));

        let persisted = self
            .writer
            .persist(record, bytes, inference, self.detector.model_version())
            .await?;

        Ok(persisted.result_ref)
    }

    /// Run the detector on the blocking pool under the inference deadline.
    ///
    /// A timed out call keeps its blocking thread until the model returns;
    /// the record is finalized without waiting for it.
    async fn infer(&self, bytes: Arc<[u8]>) -> WorkerResult<Inference> {
        let detector = self.detector.clone();
        let started = Instant::now();

        let task = async move {
            tokio::task::spawn_blocking(move || detector.infer(&bytes))
                .await
                .map_err(|e| WorkerError::task(format!("inference task failed: {}", e)))?
                .map_err(WorkerError::from)
        };

        let inference = bounded("inference", self.config.inference_timeout, task).await?;
        metrics::record_inference(started.elapsed().as_secs_f64());
        Ok(inference)
    }
}
