//! Detection result repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use motion_models::{BoundingBox, Detection, DetectionResult, ImageId};
use motion_queue::{QueueResult, ResultStore};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{ArrayValue, Document, FromFirestoreValue, MapValue, ToFirestoreValue, Value};

/// Default collection for detection results.
pub const DEFAULT_RESULTS_COLLECTION: &str = "detection_results";

/// Repository for `detection_results/{image_id}` documents.
///
/// The image id is the document id, so writing the same result twice
/// replaces it instead of creating a duplicate.
#[derive(Clone)]
pub struct DetectionResultRepository {
    client: FirestoreClient,
    collection: String,
}

impl DetectionResultRepository {
    pub fn new(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Repository over `RESULTS_COLLECTION` (default `detection_results`).
    pub fn from_env(client: FirestoreClient) -> Self {
        let collection = std::env::var("RESULTS_COLLECTION")
            .ok()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_RESULTS_COLLECTION.to_string());
        Self::new(client, collection)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create or replace the result document.
    pub async fn save(&self, result: &DetectionResult) -> FirestoreResult<()> {
        let doc_id = result.image_id.as_str();
        self.client
            .with_retry("upsert_result", || {
                self.client
                    .update_document(&self.collection, doc_id, result_to_fields(result), None)
            })
            .await?;
        Ok(())
    }

    pub async fn load(&self, image_id: &ImageId) -> FirestoreResult<Option<DetectionResult>> {
        let doc = self
            .client
            .with_retry("get_result", || {
                self.client.get_document(&self.collection, image_id.as_str())
            })
            .await?;

        doc.map(|d| document_to_result(&d, image_id)).transpose()
    }
}

#[async_trait]
impl ResultStore for DetectionResultRepository {
    async fn upsert(&self, result: &DetectionResult) -> QueueResult<String> {
        self.save(result).await?;
        Ok(result.image_id.to_string())
    }

    async fn get(&self, image_id: &ImageId) -> QueueResult<Option<DetectionResult>> {
        Ok(self.load(image_id).await?)
    }
}

fn map(fields: HashMap<String, Value>) -> Value {
    Value::MapValue(MapValue {
        fields: Some(fields),
    })
}

fn detection_to_value(detection: &Detection) -> Value {
    let mut bbox = HashMap::new();
    bbox.insert("x".to_string(), detection.bbox.x.to_firestore_value());
    bbox.insert("y".to_string(), detection.bbox.y.to_firestore_value());
    bbox.insert("width".to_string(), detection.bbox.width.to_firestore_value());
    bbox.insert("height".to_string(), detection.bbox.height.to_firestore_value());

    let mut fields = HashMap::new();
    fields.insert("class_id".to_string(), detection.class_id.to_firestore_value());
    fields.insert("label".to_string(), detection.label.to_firestore_value());
    fields.insert("confidence".to_string(), detection.confidence.to_firestore_value());
    fields.insert("bbox".to_string(), map(bbox));
    map(fields)
}

fn result_to_fields(result: &DetectionResult) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("image_id".to_string(), result.image_id.as_str().to_firestore_value());
    fields.insert(
        "detections".to_string(),
        Value::ArrayValue(ArrayValue {
            values: Some(result.detections.iter().map(detection_to_value).collect()),
        }),
    );
    fields.insert(
        "detection_count".to_string(),
        (result.detections.len() as u64).to_firestore_value(),
    );
    fields.insert("model_version".to_string(), result.model_version.to_firestore_value());
    fields.insert("created_at".to_string(), result.created_at.to_firestore_value());
    fields.insert("image_width".to_string(), result.image_width.to_firestore_value());
    fields.insert("image_height".to_string(), result.image_height.to_firestore_value());
    fields.insert("annotated_ref".to_string(), result.annotated_ref.to_firestore_value());
    fields
}

fn map_fields(value: &Value) -> Option<&HashMap<String, Value>> {
    match value {
        Value::MapValue(MapValue { fields: Some(f) }) => Some(f),
        _ => None,
    }
}

fn value_to_detection(value: &Value) -> Option<Detection> {
    let fields = map_fields(value)?;
    let bbox = map_fields(fields.get("bbox")?)?;
    let coord = |key: &str| bbox.get(key).and_then(f32::from_firestore_value);

    Some(Detection::new(
        fields.get("class_id").and_then(u32::from_firestore_value)?,
        fields
            .get("label")
            .and_then(String::from_firestore_value)
            .unwrap_or_default(),
        fields.get("confidence").and_then(f32::from_firestore_value)?,
        BoundingBox::new(coord("x")?, coord("y")?, coord("width")?, coord("height")?),
    ))
}

fn document_to_result(doc: &Document, image_id: &ImageId) -> FirestoreResult<DetectionResult> {
    let fields = doc.fields.as_ref().ok_or_else(|| {
        FirestoreError::invalid_response(format!("Result {} has no fields", image_id))
    })?;

    let detections = match fields.get("detections") {
        Some(Value::ArrayValue(array)) => array
            .values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|v| {
                value_to_detection(v).ok_or_else(|| {
                    FirestoreError::invalid_response(format!(
                        "Result {} has a malformed detection",
                        image_id
                    ))
                })
            })
            .collect::<FirestoreResult<Vec<_>>>()?,
        _ => Vec::new(),
    };

    let get_u32 = |key: &str| fields.get(key).and_then(u32::from_firestore_value).unwrap_or(0);

    let mut result = DetectionResult::new(
        image_id.clone(),
        detections,
        fields
            .get("model_version")
            .and_then(String::from_firestore_value)
            .unwrap_or_default(),
        get_u32("image_width"),
        get_u32("image_height"),
    );
    if let Some(created_at) = fields
        .get("created_at")
        .and_then(DateTime::<Utc>::from_firestore_value)
    {
        result.created_at = created_at;
    }
    result.annotated_ref = fields.get("annotated_ref").and_then(String::from_firestore_value);

    Ok(result)
}
