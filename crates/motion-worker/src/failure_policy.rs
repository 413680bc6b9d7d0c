//! Mapping from failure kinds to retry behaviour.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use motion_models::Outcome;

use crate::error::{WorkerError, WorkerResult};

/// Failure kinds a policy may name. See `WorkerError::kind`.
pub const FAILURE_KINDS: &[&str] = &[
    "invalid_image",
    "inference",
    "annotate",
    "storage",
    "storage_not_found",
    "store",
    "timeout",
    "task",
    "io",
    "config",
];

/// Whether a failed record should be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Back to PENDING while attempts remain
    Transient,
    /// Straight to FAILED
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Permanent => write!(f, "permanent"),
        }
    }
}

impl FromStr for FailureClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transient" | "retry" => Ok(FailureClass::Transient),
            "permanent" | "fail" => Ok(FailureClass::Permanent),
            other => Err(format!("unknown failure class: {}", other)),
        }
    }
}

/// Classification of per-record failures.
///
/// Undecodable images are permanent, everything else is transient unless
/// overridden. Kinds missing from the table are transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    classes: HashMap<&'static str, FailureClass>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert("invalid_image", FailureClass::Permanent);
        for kind in ["inference", "storage", "storage_not_found", "store", "timeout"] {
            classes.insert(kind, FailureClass::Transient);
        }
        Self { classes }
    }
}

impl FailurePolicy {
    /// Parse overrides such as `invalid_image=permanent,timeout=transient`
    /// on top of the defaults.
    pub fn parse(overrides: &str) -> WorkerResult<Self> {
        let mut policy = Self::default();

        for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (kind, class) = entry.split_once('=').ok_or_else(|| {
                WorkerError::config_error(format!("failure policy entry without '=': {}", entry))
            })?;

            let kind = kind.trim();
            let known = FAILURE_KINDS
                .iter()
                .copied()
                .find(|k| *k == kind)
                .ok_or_else(|| {
                    WorkerError::config_error(format!("unknown failure kind: {}", kind))
                })?;
            let class = class
                .parse::<FailureClass>()
                .map_err(WorkerError::config_error)?;

            policy.classes.insert(known, class);
        }

        Ok(policy)
    }

    /// Defaults overridden by `WORKER_FAILURE_POLICY`.
    pub fn from_env() -> WorkerResult<Self> {
        match std::env::var("WORKER_FAILURE_POLICY") {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn class_of(&self, kind: &str) -> FailureClass {
        self.classes
            .get(kind)
            .copied()
            .unwrap_or(FailureClass::Transient)
    }

    pub fn classify(&self, err: &WorkerError) -> FailureClass {
        self.class_of(err.kind())
    }

    /// The outcome to finalize a record with after `err`.
    pub fn outcome_for(&self, err: &WorkerError) -> Outcome {
        match self.classify(err) {
            FailureClass::Transient => Outcome::retry(err.to_string()),
            FailureClass::Permanent => Outcome::fail(err.to_string()),
        }
    }
}
