//! Shared data models for the motion capture detection pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Captured image records and their processing status
//! - Object detections and persisted detection results
//! - The record state machine shared by every queue backend

pub mod detection;
pub mod image;
pub mod transition;

// Re-export common types
pub use detection::{BoundingBox, Detection, DetectionResult};
pub use image::{ImageId, ImageRecord, RecordStatus};
pub use transition::{ClaimDecision, Outcome, OutcomeKind, TransitionError};
