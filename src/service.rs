use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::RecorderError,
    events::{CoreEvent, EventBus},
    models::QueueItem,
    recorder::{RecorderSnapshot, RecordingOutcome, RecordingRequest, SessionRecorder, StopCause},
    settings::{RecorderSettings, UploadSettings},
    store::QueueStore,
    upload::{CredentialProvider, DrainSummary, QueueCounts, UploadQueue, UploadWorker, Uploader},
};

/// Everything needed to bring up one user's recorder and upload pipeline.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub user_id: String,
    pub queue_path: PathBuf,
    pub recorder: RecorderSettings,
    pub upload: UploadSettings,
}

/// One signed-in user's recorder, queue and worker, wired together.
///
/// The recorder hands finished sessions straight to the queue; the worker
/// runs in the background until [`RecordingService::shutdown`].
pub struct RecordingService {
    recorder: SessionRecorder,
    queue: UploadQueue,
    worker: UploadWorker,
    events: EventBus,
    cancel: CancellationToken,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingService {
    pub async fn open(
        config: ServiceConfig,
        uploader: Arc<dyn Uploader>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let events = EventBus::default();

        let store = QueueStore::open(config.queue_path.clone())?;
        let queue = UploadQueue::open(store, events.clone())
            .await
            .with_context(|| {
                format!("failed to load upload queue from {}", config.queue_path.display())
            })?;

        let recorder = SessionRecorder::new(
            config.user_id.clone(),
            config.recorder.clone(),
            Arc::new(queue.clone()),
            events.clone(),
        );
        let worker = UploadWorker::new(
            queue.clone(),
            uploader,
            credentials,
            config.upload.sweep_interval(),
        );

        let cancel = CancellationToken::new();
        let handle = worker.clone().spawn(cancel.child_token());

        info!("Recording service ready for user {}", config.user_id);

        Ok(Self {
            recorder,
            queue,
            worker,
            events,
            cancel,
            worker_handle: Mutex::new(Some(handle)),
        })
    }

    pub async fn start_recording(
        &self,
        request: RecordingRequest,
        samples: mpsc::Receiver<f64>,
    ) -> Result<RecorderSnapshot, RecorderError> {
        self.recorder.start(request, samples).await
    }

    /// User-initiated stop. The recording in progress is discarded.
    pub async fn stop_recording(&self) -> Result<RecordingOutcome, RecorderError> {
        self.recorder.stop(StopCause::Manual).await
    }

    pub async fn recorder_snapshot(&self) -> RecorderSnapshot {
        self.recorder.snapshot().await
    }

    pub async fn queue_items(&self) -> Vec<QueueItem> {
        self.queue.items().await
    }

    pub async fn queue_counts(&self) -> QueueCounts {
        self.queue.counts().await
    }

    pub async fn retry_failed(&self) -> DrainSummary {
        self.worker.retry_failed().await
    }

    pub async fn clear_completed(&self) -> Vec<String> {
        self.queue.clear_completed().await
    }

    pub async fn clear_all(&self) -> Vec<String> {
        self.queue.clear_all().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn worker(&self) -> &UploadWorker {
        &self.worker
    }

    /// Discards any recording in progress and stops the worker loop. A
    /// delivery cut short here is picked up again on the next open.
    pub async fn shutdown(&self) {
        if self.recorder.snapshot().await.session_id.is_some() {
            match self.recorder.stop(StopCause::Manual).await {
                Ok(outcome) => info!("Recording stopped for shutdown: {outcome:?}"),
                Err(RecorderError::NotRecording) => {}
                Err(err) => warn!("Failed to stop recording during shutdown: {err}"),
            }
        }

        self.cancel.cancel();
        if let Some(handle) = self.worker_handle.lock().await.take() {
            if let Err(err) = handle.await {
                warn!("Upload worker ended abnormally: {err}");
            }
        }
        info!("Recording service shut down");
    }
}

impl Drop for RecordingService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
