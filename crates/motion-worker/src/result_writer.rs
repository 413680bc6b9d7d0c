//! Persist detections for a processed record.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use motion_detect::{annotate, Inference, DEFAULT_JPEG_QUALITY};
use motion_models::{DetectionResult, ImageId, ImageRecord};
use motion_queue::ResultStore;
use motion_storage::BlobStore;

use crate::config::WorkerConfig;
use crate::deadline::bounded;
use crate::error::{WorkerError, WorkerResult};

/// A stored result and the reference the store returned for it.
#[derive(Debug, Clone)]
pub struct Persisted {
    pub result: DetectionResult,
    pub result_ref: String,
}

/// Writes detection results and annotated images.
///
/// Every write is keyed by the image id, so persisting the same record
/// twice leaves one result and one annotated object.
#[derive(Clone)]
pub struct ResultWriter {
    blobs: Arc<dyn BlobStore>,
    results: Arc<dyn ResultStore>,
    confidence_threshold: f32,
    annotate: bool,
    annotated_prefix: String,
    storage_timeout: Duration,
}

impl ResultWriter {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        results: Arc<dyn ResultStore>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            blobs,
            results,
            confidence_threshold: config.confidence_threshold,
            annotate: config.annotate,
            annotated_prefix: config.annotated_prefix.clone(),
            storage_timeout: config.storage_timeout,
        }
    }

    /// Object key of the annotated image for `image_id`.
    pub fn annotated_key(&self, image_id: &ImageId) -> String {
        let prefix = self.annotated_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{}.jpg", image_id)
        } else {
            format!("{}/{}.jpg", prefix, image_id)
        }
    }

    pub async fn persist(
        &self,
        record: &ImageRecord,
        image_bytes: Arc<[u8]>,
        inference: Inference,
        model_version: &str,
    ) -> WorkerResult<Persisted> {
        let threshold = self.confidence_threshold;
        let detections: Vec<_> = inference
            .detections
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect();

        let mut result = DetectionResult::new(
            record.id.clone(),
            detections,
            model_version,
            inference.width,
            inference.height,
        );

        if self.annotate {
            let key = self.annotated_key(&record.id);
            let jpeg = render(image_bytes, result.detections.clone()).await?;
            bounded(
                "annotated upload",
                self.storage_timeout,
                self.blobs.put(&key, jpeg, "image/jpeg"),
            )
            .await?;
            debug!(image_id = %record.id, key = %key, "Uploaded annotated image");
            result = result.with_annotated_ref(key);
        }

        let result_ref = self.results.upsert(&result).await?;

        Ok(Persisted { result, result_ref })
    }
}

async fn render(
    image_bytes: Arc<[u8]>,
    detections: Vec<motion_models::Detection>,
) -> WorkerResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || annotate(&image_bytes, &detections, DEFAULT_JPEG_QUALITY))
        .await
        .map_err(|e| WorkerError::task(format!("annotation task failed: {}", e)))?
        .map_err(WorkerError::from)
}
