//! Detection capability interface.
//!
//! The pipeline only sees `Detector`; the concrete model backend can be
//! swapped without touching it.

use image::DynamicImage;

use motion_models::Detection;

use crate::error::{DetectError, DetectResult};

/// Output of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    /// Decoded image width in pixels
    pub width: u32,
    /// Decoded image height in pixels
    pub height: u32,
    /// Detections in source-image pixels; may be empty
    pub detections: Vec<Detection>,
}

/// Object detection capability.
///
/// Implementations hold no per-call state; weights are loaded once at
/// construction. Calls block, so async callers should run them on the
/// blocking pool.
pub trait Detector: Send + Sync {
    /// Detect objects in encoded image bytes.
    ///
    /// Fails with `DetectError::InvalidImage` when the bytes cannot be
    /// decoded and `DetectError::Inference` when the model fails.
    fn infer(&self, image_bytes: &[u8]) -> DetectResult<Inference>;

    /// Identifier of the model producing the detections.
    fn model_version(&self) -> &str;
}

/// Decode encoded image bytes (format sniffed from the content).
pub fn decode_image(image_bytes: &[u8]) -> DetectResult<DynamicImage> {
    if image_bytes.is_empty() {
        return Err(DetectError::invalid_image("empty image data"));
    }

    let img = image::load_from_memory(image_bytes)
        .map_err(|e| DetectError::invalid_image(e.to_string()))?;

    if img.width() == 0 || img.height() == 0 {
        return Err(DetectError::invalid_image("image has zero size"));
    }

    Ok(img)
}
