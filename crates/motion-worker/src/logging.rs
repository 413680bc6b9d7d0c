//! Structured record logging utilities.
//!
//! Provides consistent, structured logging for record processing with
//! tracing spans and contextual information, plus subscriber setup for the
//! binaries.

use tracing::{debug, error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use motion_models::ImageId;

/// Directives applied on top of `RUST_LOG`.
const DEFAULT_DIRECTIVES: &[&str] = &["motion=info", "ort=warn", "onnxruntime=warn"];

/// Install the global subscriber: JSON when `LOG_FORMAT=json`, pretty otherwise.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Record logger for structured logging with consistent formatting.
///
/// Every event carries the image id and the operation being performed.
#[derive(Debug, Clone)]
pub struct RecordLogger {
    image_id: String,
    operation: String,
}

impl RecordLogger {
    /// Create a new logger for a specific record and operation.
    pub fn new(image_id: &ImageId, operation: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            image_id = %self.image_id,
            operation = %self.operation,
            "Record started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        debug!(
            image_id = %self.image_id,
            operation = %self.operation,
            "Record progress: {}", message
        );
    }

    /// Benign conditions such as losing a claim race.
    pub fn log_skip(&self, message: &str) {
        debug!(
            image_id = %self.image_id,
            operation = %self.operation,
            "Record skipped: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            image_id = %self.image_id,
            operation = %self.operation,
            "Record warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            image_id = %self.image_id,
            operation = %self.operation,
            "Record error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            image_id = %self.image_id,
            operation = %self.operation,
            "Record completed: {}", message
        );
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this record.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "record",
            image_id = %self.image_id,
            operation = %self.operation
        )
    }
}
