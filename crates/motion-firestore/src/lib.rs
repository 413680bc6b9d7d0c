//! Firestore REST API client.
//!
//! This crate provides:
//! - A REST client with token caching, retries and request metrics
//! - `ImageRepository`, the production work queue over `images`
//! - `DetectionResultRepository`, the result store over `detection_results`

pub mod client;
pub mod error;
pub mod image_repo;
pub mod metrics;
pub mod result_repo;
pub mod retry;
pub mod token_cache;
pub mod types;

#[cfg(test)]
mod client_tests;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use image_repo::{ImageRepository, DEFAULT_IMAGES_COLLECTION};
pub use result_repo::{DetectionResultRepository, DEFAULT_RESULTS_COLLECTION};
pub use retry::RetryConfig;
pub use token_cache::{AccessTokenSource, StaticTokenSource};
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};
