//! Error types for the detection engine.

use thiserror::Error;

/// Result type for detection operations.
pub type DetectResult<T> = Result<T, DetectError>;

/// Errors that can occur while loading or running a detector.
#[derive(Debug, Error)]
pub enum DetectError {
    /// Bytes are not a decodable image. Retrying cannot help.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// The model failed at runtime.
    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid detector configuration: {0}")]
    InvalidConfig(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),
}

impl DetectError {
    /// Create an invalid image error.
    pub fn invalid_image(message: impl Into<String>) -> Self {
        Self::InvalidImage(message.into())
    }

    /// Create an inference failure error.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a model not found error.
    pub fn model_not_found(path: impl Into<String>) -> Self {
        Self::ModelNotFound(path.into())
    }

    /// Create a model load error.
    pub fn model_load(message: impl Into<String>) -> Self {
        Self::ModelLoad(message.into())
    }

    /// True for errors caused by the input bytes rather than the model.
    pub fn is_invalid_image(&self) -> bool {
        matches!(self, DetectError::InvalidImage(_))
    }
}
