//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use motion_queue::ClaimContext;

use crate::error::{WorkerError, WorkerResult};
use crate::failure_policy::FailurePolicy;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written into `claimed_by`
    pub worker_id: String,
    /// Maximum records listed per invocation
    pub batch_limit: usize,
    /// Age after which a PROCESSING claim may be taken over
    pub reclaim_timeout: Duration,
    /// Claims allowed per record before it is failed
    pub max_attempts: u32,
    /// Detections below this confidence are not persisted
    pub confidence_threshold: f32,
    /// Deadline for each blob get/put
    pub storage_timeout: Duration,
    /// Deadline for one inference call
    pub inference_timeout: Duration,
    /// Records processed in parallel within a batch
    pub concurrency: usize,
    /// Upload an annotated copy of each processed image
    pub annotate: bool,
    /// Key prefix for annotated images
    pub annotated_prefix: String,
    /// Retry classification for per-record failures
    pub failure_policy: FailurePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            batch_limit: 20,
            reclaim_timeout: Duration::from_secs(600), // 10 minutes
            max_attempts: 3,
            confidence_threshold: 0.0,
            storage_timeout: Duration::from_secs(30),
            inference_timeout: Duration::from_secs(60),
            concurrency: 1,
            annotate: true,
            annotated_prefix: "processed".to_string(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let config = Self {
            worker_id: std::env::var("WORKER_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            batch_limit: env_or("WORKER_BATCH_LIMIT", defaults.batch_limit),
            reclaim_timeout: Duration::from_secs(env_or(
                "WORKER_RECLAIM_TIMEOUT_SECS",
                defaults.reclaim_timeout.as_secs(),
            )),
            max_attempts: env_or("WORKER_MAX_ATTEMPTS", defaults.max_attempts),
            confidence_threshold: env_or(
                "WORKER_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            storage_timeout: Duration::from_secs(env_or(
                "WORKER_STORAGE_TIMEOUT_SECS",
                defaults.storage_timeout.as_secs(),
            )),
            inference_timeout: Duration::from_secs(env_or(
                "WORKER_INFERENCE_TIMEOUT_SECS",
                defaults.inference_timeout.as_secs(),
            )),
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency),
            annotate: env_bool("WORKER_ANNOTATE", defaults.annotate),
            annotated_prefix: std::env::var("WORKER_ANNOTATED_PREFIX")
                .unwrap_or(defaults.annotated_prefix),
            failure_policy: FailurePolicy::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.worker_id.trim().is_empty() {
            return Err(WorkerError::config_error("worker id must not be empty"));
        }
        if self.batch_limit == 0 {
            return Err(WorkerError::config_error("batch limit must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(WorkerError::config_error("max attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(WorkerError::config_error(format!(
                "confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.concurrency == 0 {
            return Err(WorkerError::config_error("concurrency must be at least 1"));
        }
        if self.storage_timeout.is_zero() || self.inference_timeout.is_zero() {
            return Err(WorkerError::config_error("timeouts must be non-zero"));
        }
        if self.reclaim_timeout <= self.record_deadline() {
            return Err(WorkerError::config_error(format!(
                "reclaim timeout ({}s) must exceed the per-record deadline ({}s)",
                self.reclaim_timeout.as_secs(),
                self.record_deadline().as_secs()
            )));
        }
        Ok(())
    }

    /// Longest a claimed record can spend in fetch, inference and upload.
    ///
    /// A claim younger than this may still be in progress, so it must never
    /// be treated as stale.
    pub fn record_deadline(&self) -> Duration {
        self.storage_timeout
            .saturating_mul(2)
            .saturating_add(self.inference_timeout)
    }

    /// Claim settings for this worker.
    pub fn claim_context(&self) -> ClaimContext {
        ClaimContext::new(&self.worker_id, self.reclaim_timeout, self.max_attempts)
    }
}
