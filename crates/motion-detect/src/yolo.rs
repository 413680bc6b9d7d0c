//! Object detection using a YOLOv8 ONNX model.
//!
//! Execution provider selection:
//! - CUDA on Linux with NVIDIA GPU (when the `cuda` feature is enabled)
//! - CoreML on macOS
//! - CPU fallback on all platforms

use std::path::Path;
use std::sync::Mutex;

use image::{DynamicImage, GenericImageView};
use ndarray::Array;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::{debug, info};

use motion_models::{BoundingBox, Detection};

use crate::classes::{class_label, COCO_CLASSES};
use crate::engine::{decode_image, Detector, Inference};
use crate::error::{DetectError, DetectResult};

/// Configuration for the ONNX detector.
#[derive(Debug, Clone)]
pub struct OnnxDetectorConfig {
    /// Path to ONNX model file
    pub model_path: String,
    /// Identifier recorded with every result
    pub model_version: String,
    /// Minimum class score for a candidate box
    pub candidate_threshold: f32,
    /// IoU threshold for NMS
    pub nms_threshold: f32,
    /// Input image size (model expects square input)
    pub input_size: u32,
    /// Cap on detections returned per image
    pub max_detections: usize,
    /// Name of the output tensor
    pub output_name: String,
    /// Number of classes the model predicts
    pub num_classes: usize,
}

impl Default for OnnxDetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/yolov8n.onnx".to_string(),
            model_version: "yolov8n".to_string(),
            candidate_threshold: 0.25,
            nms_threshold: 0.45,
            input_size: 640,
            max_detections: 100,
            output_name: "output0".to_string(),
            num_classes: COCO_CLASSES.len(),
        }
    }
}

impl OnnxDetectorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let model_path = std::env::var("MODEL_PATH").unwrap_or(defaults.model_path);
        let model_version = std::env::var("MODEL_VERSION")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| model_version_from_path(&model_path));

        Self {
            model_path,
            model_version,
            candidate_threshold: std::env::var("DETECTOR_CANDIDATE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.candidate_threshold),
            nms_threshold: std::env::var("DETECTOR_NMS_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.nms_threshold),
            input_size: std::env::var("DETECTOR_INPUT_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.input_size),
            max_detections: std::env::var("DETECTOR_MAX_DETECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_detections),
            output_name: std::env::var("DETECTOR_OUTPUT_NAME").unwrap_or(defaults.output_name),
            num_classes: defaults.num_classes,
        }
    }

    /// Reject settings that would make decoding meaningless.
    pub fn validate(&self) -> DetectResult<()> {
        if self.input_size == 0 {
            return Err(DetectError::invalid_config("input size must be greater than 0"));
        }
        if self.num_classes == 0 {
            return Err(DetectError::invalid_config("model must predict at least one class"));
        }
        for (name, value) in [
            ("candidate threshold", self.candidate_threshold),
            ("NMS threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectError::invalid_config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Model version derived from the weights file name (`models/yolov8n.onnx` -> `yolov8n`).
pub fn model_version_from_path(model_path: &str) -> String {
    Path::new(model_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Object detector using a YOLOv8 ONNX model.
pub struct OnnxDetector {
    session: Mutex<Session>,
    config: OnnxDetectorConfig,
}

impl OnnxDetector {
    /// Load the model.
    ///
    /// Returns error if model file doesn't exist or cannot be loaded; callers
    /// treat this as fatal at startup.
    pub fn new(config: OnnxDetectorConfig) -> DetectResult<Self> {
        config.validate()?;
        let model_path = Path::new(&config.model_path);
        if !model_path.exists() {
            return Err(DetectError::model_not_found(&config.model_path));
        }

        let session = Mutex::new(create_session(model_path)?);
        info!(
            model_path = %config.model_path,
            model_version = %config.model_version,
            input_size = config.input_size,
            "Object detector initialized"
        );

        Ok(Self { session, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> DetectResult<Self> {
        Self::new(OnnxDetectorConfig::from_env())
    }

    /// Detect objects in an already decoded image.
    pub fn detect_image(&self, img: &DynamicImage) -> DetectResult<Vec<Detection>> {
        let (width, height) = img.dimensions();
        let input = self.preprocess(img)?;
        let outputs = self.run_inference(input)?;
        decode_output(&outputs, &self.config, width, height)
    }

    /// Preprocess image for YOLOv8 inference.
    ///
    /// - Resize to model input size
    /// - Normalize pixel values to [0, 1]
    /// - Convert to NCHW format (batch, channels, height, width)
    fn preprocess(&self, img: &DynamicImage) -> DetectResult<Value> {
        let input_size = self.config.input_size;

        let resized = img.resize_exact(
            input_size,
            input_size,
            image::imageops::FilterType::Triangle,
        );

        let rgb = resized.to_rgb8();
        let (w, h) = (input_size as usize, input_size as usize);

        let mut chw_data: Vec<f32> = Vec::with_capacity(3 * h * w);

        // HWC -> CHW with normalization to [0, 1]
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let pixel = rgb.get_pixel(x as u32, y as u32);
                    chw_data.push(pixel[c] as f32 / 255.0);
                }
            }
        }

        let shape = vec![1usize, 3, h, w];
        Tensor::from_array((shape, chw_data.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| DetectError::inference(format!("Failed to create tensor: {}", e)))
    }

    /// Run ONNX inference.
    fn run_inference(&self, input: Value) -> DetectResult<Vec<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectError::inference("Session lock poisoned"))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| DetectError::inference(format!("ONNX inference failed: {}", e)))?;

        let output = outputs
            .get(self.config.output_name.as_str())
            .ok_or_else(|| {
                DetectError::inference(format!("Missing {} tensor", self.config.output_name))
            })?;

        let tensor = output
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectError::inference(format!("Failed to extract tensor: {}", e)))?;

        Ok(tensor.1.to_vec())
    }

    /// Get the configuration.
    pub fn config(&self) -> &OnnxDetectorConfig {
        &self.config
    }
}

impl Detector for OnnxDetector {
    fn infer(&self, image_bytes: &[u8]) -> DetectResult<Inference> {
        let img = decode_image(image_bytes)?;
        let (width, height) = img.dimensions();
        let detections = self.detect_image(&img)?;

        debug!(
            count = detections.len(),
            width,
            height,
            "Object detection completed"
        );

        Ok(Inference {
            width,
            height,
            detections,
        })
    }

    fn model_version(&self) -> &str {
        &self.config.model_version
    }
}

/// Decode a raw YOLOv8 output tensor into detections.
///
/// The tensor is `[1, 4 + C, N]`: per candidate a center-format box in input
/// pixels followed by `C` class scores. Boxes are mapped back to the
/// `orig_width` x `orig_height` frame, filtered, and reduced with per-class NMS.
pub fn decode_output(
    outputs: &[f32],
    config: &OnnxDetectorConfig,
    orig_width: u32,
    orig_height: u32,
) -> DetectResult<Vec<Detection>> {
    let num_classes = config.num_classes;
    let num_features = 4 + num_classes;

    if outputs.is_empty() || outputs.len() % num_features != 0 {
        return Err(DetectError::inference(format!(
            "Unexpected output size {} for {} features per candidate",
            outputs.len(),
            num_features
        )));
    }
    let num_boxes = outputs.len() / num_features;

    // [4 + C, N] -> [N, 4 + C]
    let output_array = Array::from_shape_vec((num_features, num_boxes), outputs.to_vec())
        .map_err(|e| DetectError::inference(format!("Failed to reshape output: {}", e)))?;
    let transposed = output_array.t();

    let input_size = config.input_size as f32;
    let scale_w = orig_width as f32 / input_size;
    let scale_h = orig_height as f32 / input_size;

    let mut candidates: Vec<Detection> = Vec::new();

    for i in 0..num_boxes {
        let cx = transposed[[i, 0]];
        let cy = transposed[[i, 1]];
        let w = transposed[[i, 2]];
        let h = transposed[[i, 3]];

        let mut best_class = 0;
        let mut best_score = 0.0f32;
        for c in 0..num_classes {
            let score = transposed[[i, 4 + c]];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }

        if best_score < config.candidate_threshold {
            continue;
        }

        let bbox = BoundingBox::new(
            (cx - w / 2.0) * scale_w,
            (cy - h / 2.0) * scale_h,
            w * scale_w,
            h * scale_h,
        )
        .clamp_to(orig_width, orig_height);

        if bbox.area() <= 0.0 {
            continue;
        }

        candidates.push(Detection::new(
            best_class as u32,
            class_label(best_class as u32),
            best_score,
            bbox,
        ));
    }

    let mut kept = non_maximum_suppression(candidates, config.nms_threshold);
    kept.truncate(config.max_detections);
    Ok(kept)
}

/// Per-class NMS; returns detections sorted by descending confidence.
pub fn non_maximum_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

/// Create ONNX Runtime session with automatic execution provider selection.
fn create_session(model_path: &Path) -> DetectResult<Session> {
    let model_bytes = std::fs::read(model_path)
        .map_err(|e| DetectError::model_load(format!("Failed to read model file: {}", e)))?;

    let builder = Session::builder()
        .map_err(|e| DetectError::model_load(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| DetectError::model_load(format!("Failed to set optimization level: {}", e)))?;

    #[cfg(all(target_os = "linux", feature = "cuda"))]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if let Ok(cuda_builder) = builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            if let Ok(session) = cuda_builder.commit_from_memory(&model_bytes) {
                info!("Using CUDA execution provider for object detection");
                return Ok(session);
            }
        }
        debug!("CUDA execution provider not available, trying alternatives");
    }

    #[cfg(target_os = "macos")]
    {
        use ort::execution_providers::CoreMLExecutionProvider;
        if let Ok(coreml_builder) = builder
            .clone()
            .with_execution_providers([CoreMLExecutionProvider::default().build()])
        {
            if let Ok(session) = coreml_builder.commit_from_memory(&model_bytes) {
                info!("Using CoreML execution provider for object detection");
                return Ok(session);
            }
        }
        debug!("CoreML execution provider not available, using CPU");
    }

    info!("Using CPU execution provider for object detection");
    builder
        .commit_from_memory(&model_bytes)
        .map_err(|e| DetectError::model_load(format!("Failed to load ONNX model: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(num_classes: usize) -> OnnxDetectorConfig {
        OnnxDetectorConfig {
            input_size: 100,
            num_classes,
            ..Default::default()
        }
    }

    /// Build a `[4 + C, N]` tensor from per-candidate rows.
    fn tensor(rows: &[[f32; 6]]) -> Vec<f32> {
        let num_features = 6;
        let mut out = vec![0.0; num_features * rows.len()];
        for (i, row) in rows.iter().enumerate() {
            for (f, value) in row.iter().enumerate() {
                out[f * rows.len() + i] = *value;
            }
        }
        out
    }

    #[test]
    fn test_config_default() {
        let config = OnnxDetectorConfig::default();
        assert_eq!(config.input_size, 640);
        assert!((config.candidate_threshold - 0.25).abs() < 0.001);
        assert!((config.nms_threshold - 0.45).abs() < 0.001);
        assert_eq!(config.num_classes, 80);
    }

    #[test]
    fn test_model_version_from_path() {
        assert_eq!(model_version_from_path("models/yolov8n.onnx"), "yolov8n");
        assert_eq!(model_version_from_path(""), "unknown");
    }

    #[test]
    fn test_decode_scales_boxes_to_source_pixels() {
        // One box centered at (50, 50), 20x40 in a 100px input, class 1.
        let output = tensor(&[[50.0, 50.0, 20.0, 40.0, 0.1, 0.9]]);
        let detections = decode_output(&output, &small_config(2), 200, 100).unwrap();

        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.class_id, 1);
        assert_eq!(d.label, "bicycle");
        assert_eq!(d.bbox, BoundingBox::new(80.0, 30.0, 40.0, 40.0));
    }

    #[test]
    fn test_decode_drops_low_scores() {
        let output = tensor(&[[50.0, 50.0, 20.0, 20.0, 0.1, 0.2]]);
        let detections = decode_output(&output, &small_config(2), 100, 100).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn test_decode_applies_nms_per_class() {
        let output = tensor(&[
            [50.0, 50.0, 20.0, 20.0, 0.9, 0.0],
            [51.0, 51.0, 20.0, 20.0, 0.8, 0.0],
            [51.0, 51.0, 20.0, 20.0, 0.0, 0.7],
        ]);
        let detections = decode_output(&output, &small_config(2), 100, 100).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(detections[1].class_id, 1);
    }

    #[test]
    fn test_decode_rejects_malformed_output() {
        let err = decode_output(&[0.0; 7], &small_config(2), 100, 100).unwrap_err();
        assert!(matches!(err, DetectError::Inference(_)));
    }

    #[test]
    fn test_zero_input_size_is_rejected() {
        let config = OnnxDetectorConfig {
            input_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DetectError::InvalidConfig(_))));
        assert!(matches!(
            OnnxDetector::new(config),
            Err(DetectError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_thresholds_are_validated() {
        assert!(OnnxDetectorConfig::default().validate().is_ok());
        let config = OnnxDetectorConfig {
            nms_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_model_is_startup_error() {
        let config = OnnxDetectorConfig {
            model_path: "/nonexistent/model.onnx".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            OnnxDetector::new(config),
            Err(DetectError::ModelNotFound(_))
        ));
    }
}
