//! Captured image records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a captured image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    /// Generate a new random image ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Processing status of an image record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Uploaded, waiting for a worker
    #[default]
    Pending,
    /// Claimed by a worker
    Processing,
    /// Detections persisted
    Done,
    /// Gave up on this image
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing => "processing",
            RecordStatus::Done => "done",
            RecordStatus::Failed => "failed",
        }
    }

    /// DONE and FAILED are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Done | RecordStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Processing -> Processing` is the reclaim of a stale claim.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Pending, RecordStatus::Processing)
                | (RecordStatus::Pending, RecordStatus::Failed)
                | (RecordStatus::Processing, RecordStatus::Processing)
                | (RecordStatus::Processing, RecordStatus::Pending)
                | (RecordStatus::Processing, RecordStatus::Done)
                | (RecordStatus::Processing, RecordStatus::Failed)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "processing" => Ok(RecordStatus::Processing),
            "done" => Ok(RecordStatus::Done),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(format!("unknown record status: {}", other)),
        }
    }
}

/// One captured image and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Unique, immutable identifier
    pub id: ImageId,
    /// Camera that produced the capture
    #[serde(default)]
    pub camera_id: Option<String>,
    /// Original upload filename
    #[serde(default)]
    pub filename: String,
    /// Capture timestamp set by the camera
    pub captured_at: DateTime<Utc>,
    /// Blob key of the raw image bytes
    pub storage_ref: String,
    /// Current processing status
    #[serde(default)]
    pub status: RecordStatus,
    /// When the current claim was taken
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Worker holding the current claim
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// Number of claims taken so far
    #[serde(default)]
    pub attempts: u32,
    /// Detection result reference, set only on DONE
    #[serde(default)]
    pub result_ref: Option<String>,
    /// Most recent failure message
    #[serde(default)]
    pub last_error: Option<String>,
    /// Wall time of the last attempt
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
    /// When the record reached a terminal state
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    /// Create a pending record the way the upload path does.
    pub fn new_pending(
        id: ImageId,
        storage_ref: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let storage_ref = storage_ref.into();
        let filename = storage_ref
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            id,
            camera_id: None,
            filename,
            captured_at,
            storage_ref,
            status: RecordStatus::Pending,
            claimed_at: None,
            claimed_by: None,
            attempts: 0,
            result_ref: None,
            last_error: None,
            processing_time_ms: None,
            updated_at: captured_at,
            completed_at: None,
        }
    }

    /// Set the camera identifier.
    pub fn with_camera(mut self, camera_id: impl Into<String>) -> Self {
        self.camera_id = Some(camera_id.into());
        self
    }

    /// Check if the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
