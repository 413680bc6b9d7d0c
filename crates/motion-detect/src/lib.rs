//! Object detection engine.
//!
//! This crate provides:
//! - The `Detector` capability trait used by the pipeline
//! - A YOLOv8 backend on ONNX Runtime
//! - Image decoding and annotated-image rendering

pub mod annotate;
pub mod classes;
pub mod engine;
pub mod error;
pub mod yolo;

pub use annotate::{annotate, DEFAULT_JPEG_QUALITY};
pub use classes::{class_label, COCO_CLASSES};
pub use engine::{decode_image, Detector, Inference};
pub use error::{DetectError, DetectResult};
pub use yolo::{OnnxDetector, OnnxDetectorConfig};
