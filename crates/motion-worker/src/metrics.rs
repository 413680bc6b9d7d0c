//! Worker metrics.
//!
//! Invocations are short lived, so instead of serving a scrape endpoint the
//! worker renders the Prometheus exposition into a file for a textfile
//! collector when `METRICS_TEXTFILE` is set.

use std::path::PathBuf;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::BatchReport;

/// Metric names as constants for consistency.
pub mod names {
    pub const RECORDS_TOTAL: &str = "motion_records_total";
    pub const INFERENCE_SECONDS: &str = "motion_inference_seconds";
    pub const BATCH_DURATION_SECONDS: &str = "motion_batch_duration_seconds";
    pub const BATCH_LISTED: &str = "motion_batch_listed";
}

/// Count a record by what happened to it (`done`, `retry`, `fail`, `skipped`, ...).
pub fn record_outcome(outcome: &'static str) {
    counter!(names::RECORDS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_inference(duration_secs: f64) {
    histogram!(names::INFERENCE_SECONDS).record(duration_secs);
}

pub fn record_batch(report: &BatchReport, duration_secs: f64) {
    histogram!(names::BATCH_DURATION_SECONDS).record(duration_secs);
    histogram!(names::BATCH_LISTED).record(report.listed as f64);
}

/// Prometheus recorder whose output is written to a file at the end of a run.
pub struct TextfileExporter {
    handle: PrometheusHandle,
    path: PathBuf,
}

impl TextfileExporter {
    /// Install a recorder if `METRICS_TEXTFILE` names a path.
    pub fn from_env() -> WorkerResult<Option<Self>> {
        match std::env::var("METRICS_TEXTFILE") {
            Ok(path) if !path.trim().is_empty() => Self::install(path).map(Some),
            _ => Ok(None),
        }
    }

    pub fn install(path: impl Into<PathBuf>) -> WorkerResult<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            WorkerError::config_error(format!("Failed to install Prometheus recorder: {}", e))
        })?;
        Ok(Self {
            handle,
            path: path.into(),
        })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the exposition next to the target and rename it into place so
    /// a collector never reads a partial file.
    pub async fn write(&self) -> WorkerResult<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");

        tokio::fs::write(&tmp, self.render()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
