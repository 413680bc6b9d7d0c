use motion_detect::{Detector, OnnxDetector};
use motion_firestore::{FirestoreClient, ImageRepository};
use motion_storage::R2Client;
use motion_worker::WorkerConfig;

/// Document id read to prove Firestore is reachable; it need not exist.
const HEALTH_DOCUMENT: &str = "__selfcheck__";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    println!("motion-selfcheck: starting as {}", config.worker_id);

    ensure_env_present(&[
        "R2_ENDPOINT_URL",
        "R2_ACCESS_KEY_ID",
        "R2_SECRET_ACCESS_KEY",
        "R2_BUCKET_NAME",
    ])?;
    ensure_any_env_present(&["GCP_PROJECT_ID", "FIREBASE_PROJECT_ID"])?;

    let detector = OnnxDetector::from_env()
        .map_err(|e| anyhow::anyhow!("model failed to load: {}", e))?;
    println!("motion-selfcheck: model {} loaded", detector.model_version());

    let r2 = R2Client::from_env()?;
    r2.check_connectivity()
        .await
        .map_err(|e| anyhow::anyhow!("bucket {} unreachable: {}", r2.bucket(), e))?;
    println!("motion-selfcheck: bucket {} reachable", r2.bucket());

    let firestore = FirestoreClient::from_env()?;
    let images = ImageRepository::from_env(firestore.clone());
    firestore
        .get_document(images.collection(), HEALTH_DOCUMENT)
        .await
        .map_err(|e| anyhow::anyhow!("Firestore unreachable: {}", e))?;
    println!("motion-selfcheck: collection {} readable", images.collection());

    println!("motion-selfcheck: ok");
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}

fn ensure_any_env_present(vars: &[&str]) -> anyhow::Result<()> {
    if vars.iter().any(|var| std::env::var(var).is_ok()) {
        Ok(())
    } else {
        Err(anyhow::anyhow!("one of {} must be set", vars.join(", ")))
    }
}
