//! Blob storage for captured images.
//!
//! This crate provides:
//! - The `BlobStore` contract used by the pipeline
//! - A Cloudflare R2 implementation over the S3 API
//! - An in-memory implementation for tests and local runs

pub mod blob;
pub mod client;
pub mod error;

pub use blob::{BlobStore, MemoryBlobStore, StoredObject};
pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
