//! Object detections and persisted detection results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::image::ImageId;

/// Axis-aligned box in source-image pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// X coordinate of the top-left corner
    pub x: f32,
    /// Y coordinate of the top-left corner
    pub y: f32,
    /// Box width
    pub width: f32,
    /// Box height
    pub height: f32,
}

impl BoundingBox {
    /// Create a new bounding box.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Clip the box to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = (self.x + self.width).clamp(0.0, w);
        let y2 = (self.y + self.height).clamp(0.0, h);
        BoundingBox::from_corners(x1, y1, x2, y2)
    }
}

/// One predicted object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Model class index
    pub class_id: u32,
    /// Human-readable class label
    pub label: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Location in source-image pixels
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: u32, label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

/// Detections persisted for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Image these detections belong to (also the result's key)
    pub image_id: ImageId,
    /// Detections, highest confidence first
    pub detections: Vec<Detection>,
    /// Model that produced the detections
    pub model_version: String,
    /// Completion time
    pub created_at: DateTime<Utc>,
    /// Source image width in pixels
    pub image_width: u32,
    /// Source image height in pixels
    pub image_height: u32,
    /// Blob key of the annotated image, when one was rendered
    #[serde(default)]
    pub annotated_ref: Option<String>,
}

impl DetectionResult {
    /// Create a result, ordering detections by descending confidence.
    pub fn new(
        image_id: ImageId,
        mut detections: Vec<Detection>,
        model_version: impl Into<String>,
        image_width: u32,
        image_height: u32,
    ) -> Self {
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Self {
            image_id,
            detections,
            model_version: model_version.into(),
            created_at: Utc::now(),
            image_width,
            image_height,
            annotated_ref: None,
        }
    }

    /// Attach the annotated image key.
    pub fn with_annotated_ref(mut self, key: impl Into<String>) -> Self {
        self.annotated_ref = Some(key.into());
        self
    }

    /// Number of detections.
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Count detections per label, e.g. for log lines.
    pub fn label_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for detection in &self.detections {
            match counts.iter_mut().find(|(label, _)| *label == detection.label) {
                Some((_, count)) => *count += 1,
                None => counts.push((detection.label.clone(), 1)),
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_boxes() {
        let a = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_clamp_to_frame() {
        let b = BoundingBox::new(-5.0, 90.0, 20.0, 20.0).clamp_to(100, 100);
        assert_eq!(b, BoundingBox::new(0.0, 90.0, 15.0, 10.0));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let d = Detection::new(0, "person", 1.3, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_result_orders_by_confidence() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let result = DetectionResult::new(
            ImageId::from("img-1"),
            vec![
                Detection::new(2, "car", 0.4, bbox),
                Detection::new(0, "person", 0.9, bbox),
                Detection::new(0, "person", 0.6, bbox),
            ],
            "yolov8n",
            640,
            480,
        );

        let confidences: Vec<f32> = result.detections.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.6, 0.4]);
        assert_eq!(
            result.label_counts(),
            vec![("person".to_string(), 2), ("car".to_string(), 1)]
        );
    }
}
