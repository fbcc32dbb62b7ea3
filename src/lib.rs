pub mod error;
pub mod events;
pub mod models;
pub mod recorder;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod store;
pub mod upload;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context};
use log::info;

pub use error::{QueueError, RecorderError, ValidationError};
pub use events::{CoreEvent, EventBus};
pub use models::{MeasurementTag, QueueItem, RecordingMode, Session, UploadStatus};
pub use recorder::{RecorderPhase, RecorderSnapshot, RecordingOutcome, RecordingRequest};
pub use service::{RecordingService, ServiceConfig};
pub use settings::SettingsStore;
pub use upload::{HttpUploader, StaticCredentials};

const DATA_DIR_ENV: &str = "VITALSYNC_DATA_DIR";
const USER_ID_ENV: &str = "VITALSYNC_USER_ID";
const ACCESS_TOKEN_ENV: &str = "VITALSYNC_ACCESS_TOKEN";

fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    dirs::data_dir()
        .map(|dir| dir.join("vitalsync"))
        .ok_or_else(|| anyhow!("no data directory available; set {DATA_DIR_ENV}"))
}

/// Headless delivery daemon: recovers the user's queue and keeps uploading
/// until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("VitalSync starting up...");

    let data_dir = data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let upload_settings = settings.upload();

    let user_id = std::env::var(USER_ID_ENV)
        .map_err(|_| anyhow!("{USER_ID_ENV} must name the signed-in user"))?;
    let credentials = Arc::new(StaticCredentials::new(std::env::var(ACCESS_TOKEN_ENV).ok()));
    let uploader = Arc::new(HttpUploader::new(
        upload_settings.endpoint.clone(),
        upload_settings.request_timeout(),
    )?);

    let config = ServiceConfig {
        queue_path: data_dir.join("users").join(&user_id).join("queue.json"),
        user_id,
        recorder: settings.recorder(),
        upload: upload_settings,
    };
    let service = RecordingService::open(config, uploader, credentials).await?;

    let counts = service.queue_counts().await;
    info!(
        "Queue: {} pending, {} failed, {} completed",
        counts.pending, counts.failed, counts.completed
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    service.shutdown().await;

    Ok(())
}
