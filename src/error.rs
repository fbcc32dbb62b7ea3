use thiserror::Error;

use crate::models::UploadStatus;

/// Reasons a finished recording is refused before a `Session` is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("recording too short: {elapsed_secs}s elapsed, at least {required_secs}s required")]
    TooShort { elapsed_secs: u64, required_secs: u64 },

    #[error("insufficient data: {accepted} samples accepted, at least {required} required")]
    InsufficientSamples { accepted: usize, required: usize },
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no active recording to stop")]
    NotRecording,

    #[error("a {duration_minutes} min recording is shorter than the {min_secs}s minimum")]
    InvalidDuration { duration_minutes: u32, min_secs: u64 },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue item {0}")]
    UnknownItem(String),

    #[error("session {0} is already queued")]
    Duplicate(String),

    #[error("item {in_flight} is already uploading")]
    UploadInFlight { in_flight: String },

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: UploadStatus,
        to: UploadStatus,
    },
}
