use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

use super::Session;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "Pending",
            UploadStatus::Uploading => "Uploading",
            UploadStatus::Completed => "Completed",
            UploadStatus::Failed => "Failed",
        }
    }

    /// Statuses only move forward, except for a retry (Failed -> Pending) and
    /// the out-of-order/crash recovery edge (Uploading -> Pending).
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        match (self, next) {
            (Pending, Uploading) => true,
            (Uploading, Completed) | (Uploading, Failed) | (Uploading, Pending) => true,
            (Failed, Pending) => true,
            (Pending, Pending | Completed | Failed)
            | (Uploading, Uploading)
            | (Completed, _)
            | (Failed, Uploading | Completed | Failed) => false,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub session: Session,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(session: Session, created_at: DateTime<Utc>) -> Self {
        Self {
            id: session.id().to_string(),
            session,
            status: UploadStatus::Pending,
            created_at,
            last_attempt_at: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Moves the item to `next`, returning the previous status.
    pub(crate) fn transition(&mut self, next: UploadStatus) -> Result<UploadStatus, QueueError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from,
                to: next,
            });
        }
        self.status = next;
        Ok(from)
    }
}
