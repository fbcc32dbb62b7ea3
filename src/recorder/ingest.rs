use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::{RecorderPhase, RecorderState};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Background task draining the live sample stream into the active recording.
/// It outlives individual series intervals; only a full stop cancels it.
pub(crate) struct IngestTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl IngestTask {
    pub(crate) fn spawn(state: Arc<Mutex<RecorderState>>, samples: mpsc::Receiver<f64>) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(ingest_loop(state, samples, token.clone()));
        Self { token, handle }
    }

    /// True once the sensor stream has closed or the task was cancelled.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for IngestTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn ingest_loop(
    state: Arc<Mutex<RecorderState>>,
    mut samples: mpsc::Receiver<f64>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("sample ingestion shutting down");
                break;
            }
            sample = samples.recv() => {
                let Some(bpm) = sample else {
                    log_warn!("sample stream closed while recording");
                    break;
                };

                let mut guard = state.lock().await;
                if guard.phase != RecorderPhase::Recording {
                    continue;
                }
                if let Some(active) = guard.active.as_mut() {
                    active.samples.push_bpm(bpm);
                }
            }
        }
    }
}
