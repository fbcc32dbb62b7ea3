use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Session;

/// Wire shape of one session submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadPayload {
    pub session_id: String,
    pub user_id: String,
    pub tag: String,
    pub subtag: String,
    /// Grouping is assigned server-side; the client always sends 0.
    pub event_id: i64,
    pub duration_minutes: u32,
    pub recorded_at: String,
    pub rr_intervals: Vec<f64>,
    pub rr_count: usize,
}

impl From<&Session> for UploadPayload {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id().to_string(),
            user_id: session.user_id().to_string(),
            tag: session.tag().as_str().to_string(),
            subtag: session.subtag().to_string(),
            event_id: 0,
            duration_minutes: session.duration_minutes(),
            recorded_at: session
                .recorded_at()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            rr_intervals: session.samples().to_vec(),
            rr_count: session.samples().len(),
        }
    }
}

/// What the backend hands back for an accepted session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadReceipt {
    pub session_id: String,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// An earlier interval of the same series has not been accepted yet.
    OutOfOrder,
    Transient,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UploadFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn out_of_order(message: impl Into<String>) -> Self {
        Self::new(FailureKind::OutOfOrder, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Terminal, message)
    }
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn submit(
        &self,
        payload: &UploadPayload,
        access_token: &str,
    ) -> Result<UploadReceipt, UploadFailure>;
}
