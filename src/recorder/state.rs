use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::{MeasurementTag, RecordingMode};
use crate::scheduler::DeferredTask;

use super::ingest::IngestTask;
use super::samples::SampleBuffer;
use super::sequence::SequenceTracker;
use super::subtag::SubtagContext;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecorderPhase {
    Idle,
    Armed,
    Recording,
    Stopping,
    Completed,
    Discarded,
    Failed,
}

impl Default for RecorderPhase {
    fn default() -> Self {
        RecorderPhase::Idle
    }
}

/// The interval currently being captured.
#[derive(Debug)]
pub struct ActiveRecording {
    pub session_id: String,
    pub tag: MeasurementTag,
    pub subtag: String,
    pub context: SubtagContext,
    pub duration_minutes: u32,
    pub started_at: DateTime<Utc>,
    pub started_instant: Instant,
    pub samples: SampleBuffer,
}

impl ActiveRecording {
    pub fn target(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_minutes) * 60)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.target().saturating_sub(self.elapsed())
    }
}

/// Recorder state guarded by a single lock. Timers and the ingestion task
/// live here too so that stopping can cancel them in the same critical section.
#[derive(Default)]
pub struct RecorderState {
    pub phase: RecorderPhase,
    pub mode: Option<RecordingMode>,
    pub active: Option<ActiveRecording>,
    pub sequence: SequenceTracker,
    pub(crate) expiry: Option<DeferredTask>,
    pub(crate) ingest: Option<IngestTask>,
}

impl RecorderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.phase == RecorderPhase::Recording
    }

    pub(crate) fn cancel_expiry(&mut self) {
        if let Some(timer) = self.expiry.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_ingest(&mut self) {
        if let Some(task) = self.ingest.take() {
            task.cancel();
        }
    }

    /// Drops everything tied to the current mode and returns to `Idle`.
    pub(crate) fn reset_to_idle(&mut self) {
        self.cancel_expiry();
        self.cancel_ingest();
        self.active = None;
        self.mode = None;
        self.phase = RecorderPhase::Idle;
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let active = self.active.as_ref();
        RecorderSnapshot {
            phase: self.phase,
            mode: self.mode.clone(),
            session_id: active.map(|a| a.session_id.clone()),
            tag: active.map(|a| a.tag),
            subtag: active.map(|a| a.subtag.clone()),
            started_at: active.map(|a| a.started_at),
            accepted_samples: active.map(|a| a.samples.len()).unwrap_or(0),
            rejected_samples: active.map(|a| a.samples.rejected()).unwrap_or(0),
            elapsed_ms: active
                .map(|a| a.elapsed().as_millis() as u64)
                .unwrap_or(0),
            remaining_ms: active
                .map(|a| a.remaining().as_millis() as u64)
                .unwrap_or(0),
            next_interval: self.sequence.current(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSnapshot {
    pub phase: RecorderPhase,
    pub mode: Option<RecordingMode>,
    pub session_id: Option<String>,
    pub tag: Option<MeasurementTag>,
    pub subtag: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub accepted_samples: usize,
    pub rejected_samples: u64,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub next_interval: u32,
}
