//! Detection worker binary. Runs one batch and exits.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{error, info, warn};

use motion_detect::{Detector, OnnxDetector};
use motion_firestore::{DetectionResultRepository, FirestoreClient, ImageRepository};
use motion_storage::R2Client;
use motion_worker::{init_tracing, PipelineRunner, TextfileExporter, WorkerConfig};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let exporter = match TextfileExporter::from_env() {
        Ok(exporter) => exporter,
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("Batch could not start: {:#}", e);
            1
        }
    };

    if let Some(exporter) = exporter {
        if let Err(e) = exporter.write().await {
            warn!("Failed to write metrics textfile: {}", e);
        }
    }

    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let started = Instant::now();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    info!(
        worker_id = %config.worker_id,
        batch_limit = config.batch_limit,
        max_attempts = config.max_attempts,
        concurrency = config.concurrency,
        "Starting motion-worker"
    );

    let detector = OnnxDetector::from_env().context("failed to load detection model")?;
    info!(model_version = %detector.model_version(), "Model loaded");

    let blobs = R2Client::from_env().context("failed to configure blob store")?;
    let firestore = FirestoreClient::from_env().context("failed to configure Firestore")?;
    let queue = ImageRepository::from_env(firestore.clone());
    let results = DetectionResultRepository::from_env(firestore);

    let batch_limit = config.batch_limit;
    let runner = PipelineRunner::new(
        config,
        Arc::new(queue),
        Arc::new(blobs),
        Arc::new(results),
        Arc::new(detector),
    );

    let report = runner.run_once(batch_limit).await?;

    info!(
        report = %serde_json::to_string(&report).unwrap_or_default(),
        duration_ms = started.elapsed().as_millis() as u64,
        "motion-worker finished"
    );

    Ok(())
}
