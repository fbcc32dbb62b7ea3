use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{MeasurementTag, UploadStatus};
use crate::recorder::RecorderSnapshot;

const DEFAULT_CAPACITY: usize = 256;

/// Notifications for presentation code. The core never depends on who
/// listens; a send with no subscribers is simply dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreEvent {
    RecorderStateChanged {
        state: RecorderSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        session_id: String,
        tag: MeasurementTag,
        subtag: String,
        sample_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    RecordingDiscarded {
        session_id: String,
        subtag: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    RecordingFailed {
        session_id: String,
        subtag: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    QueueItemChanged {
        session_id: String,
        from: Option<UploadStatus>,
        to: UploadStatus,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    QueueItemsRemoved {
        session_ids: Vec<String>,
    },
    PersistenceFailed {
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }
}
