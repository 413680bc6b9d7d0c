//! Motion capture detection worker.
//!
//! This crate provides:
//! - The batch pipeline that claims, detects and finalizes image records
//! - Result persistence with optional annotated uploads
//! - Configurable failure classification
//! - Logging and metrics setup for the binaries

pub mod config;
mod deadline;
pub mod error;
pub mod failure_policy;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod result_writer;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use failure_policy::{FailureClass, FailurePolicy};
pub use logging::{init_tracing, RecordLogger};
pub use crate::metrics::TextfileExporter;
pub use pipeline::{BatchReport, PipelineRunner};
pub use result_writer::{Persisted, ResultWriter};
