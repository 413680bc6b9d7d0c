//! Work queue for captured image records.
//!
//! This crate provides:
//! - The `WorkQueue` and `ResultStore` contracts used by the pipeline
//! - Claim settings (`ClaimContext`) and queue errors
//! - An in-memory implementation with compare-and-swap claims

pub mod error;
pub mod memory;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use memory::{MemoryQueue, MemoryResultStore};
pub use motion_models::{Outcome, OutcomeKind};
pub use queue::{ClaimContext, ResultStore, WorkQueue};
