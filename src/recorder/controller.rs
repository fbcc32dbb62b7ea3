use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    error::{QueueError, RecorderError, ValidationError},
    events::{CoreEvent, EventBus},
    models::{MeasurementTag, RecordingMode, Session},
    scheduler::DeferredTask,
    settings::RecorderSettings,
};

use super::{
    ingest::IngestTask,
    samples::SampleBuffer,
    state::{ActiveRecording, RecorderPhase, RecorderSnapshot, RecorderState},
    subtag::{build_subtag, SubtagContext},
};

/// Receives every session the recorder completes.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn session_completed(&self, session: Session) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRequest {
    pub tag: MeasurementTag,
    /// Full duration for single recordings, per-interval duration for series.
    pub duration_minutes: u32,
    pub paired: bool,
    pub protocol_label: Option<String>,
}

impl RecordingRequest {
    pub fn new(tag: MeasurementTag, duration_minutes: u32) -> Self {
        Self {
            tag,
            duration_minutes,
            paired: false,
            protocol_label: None,
        }
    }

    pub fn paired(mut self) -> Self {
        self.paired = true;
        self
    }

    pub fn with_protocol_label(mut self, label: impl Into<String>) -> Self {
        self.protocol_label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// A non-series recording must run its full duration.
    StoppedEarly,
    /// The user ended a series; the interval in progress is dropped.
    SeriesEnded,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::StoppedEarly => f.write_str("stopped before the full duration elapsed"),
            DiscardReason::SeriesEnded => f.write_str("series ended; incomplete interval dropped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingOutcome {
    Completed {
        session: Session,
        /// Interval armed right after this one, for series recordings.
        next_interval: Option<u32>,
    },
    Discarded {
        session_id: String,
        reason: DiscardReason,
    },
    /// Valid, but the queue refused it; the session is handed back.
    NotQueued {
        session: Session,
        reason: String,
        next_interval: Option<u32>,
    },
    Failed {
        session_id: String,
        reason: ValidationError,
        /// Series intervals that fail validation are re-armed under the same
        /// number while the sample stream is still open.
        next_interval: Option<u32>,
    },
}

#[derive(Clone)]
pub struct SessionRecorder {
    state: Arc<Mutex<RecorderState>>,
    user_id: Arc<str>,
    settings: RecorderSettings,
    sink: Arc<dyn SessionSink>,
    events: EventBus,
}

impl SessionRecorder {
    pub fn new(
        user_id: impl Into<String>,
        settings: RecorderSettings,
        sink: Arc<dyn SessionSink>,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecorderState::new())),
            user_id: Arc::from(user_id.into()),
            settings,
            sink,
            events,
        }
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn start(
        &self,
        request: RecordingRequest,
        samples: mpsc::Receiver<f64>,
    ) -> Result<RecorderSnapshot, RecorderError> {
        let duration = Duration::from_secs(u64::from(request.duration_minutes) * 60);
        if request.duration_minutes == 0 || duration < self.settings.min_duration() {
            return Err(RecorderError::InvalidDuration {
                duration_minutes: request.duration_minutes,
                min_secs: self.settings.min_duration_secs,
            });
        }

        let snapshot = {
            let mut state = self.state.lock().await;
            if state.phase != RecorderPhase::Idle {
                return Err(RecorderError::AlreadyRecording);
            }

            // A fresh start always begins a new mode, so any previous series is over.
            state.sequence.reset_series();

            let interval_number = if request.tag.is_series() {
                let interval = state.sequence.next_interval();
                state.mode = Some(RecordingMode::SeriesRecording {
                    interval_duration_minutes: request.duration_minutes,
                    current_interval_number: interval,
                });
                Some(interval)
            } else {
                state.mode = Some(RecordingMode::Single {
                    tag: request.tag,
                    duration_minutes: request.duration_minutes,
                    protocol_label: request.protocol_label.clone(),
                });
                None
            };

            let context = SubtagContext {
                paired: request.paired,
                interval_number,
                protocol_label: request.protocol_label.clone(),
            };

            self.arm(&mut state, request.tag, request.duration_minutes, context);
            state.ingest = Some(IngestTask::spawn(self.state.clone(), samples));
            state.snapshot()
        };

        info!(
            "Recording {} started ({}, {} min)",
            snapshot.session_id.as_deref().unwrap_or("?"),
            snapshot.subtag.as_deref().unwrap_or("?"),
            request.duration_minutes
        );
        self.events.emit(CoreEvent::RecorderStateChanged {
            state: snapshot.clone(),
        });

        Ok(snapshot)
    }

    /// Stops the recording in progress. Timers are cancelled before anything
    /// else happens.
    pub async fn stop(&self, cause: StopCause) -> Result<RecordingOutcome, RecorderError> {
        self.finish(None, cause).await
    }

    async fn expire(&self, session_id: &str) {
        match self.finish(Some(session_id), StopCause::Automatic).await {
            Ok(_) => {}
            Err(RecorderError::NotRecording) => {
                warn!("Ignoring stale expiry for recording {session_id}");
            }
            Err(err) => error!("Automatic stop of {session_id} failed: {err}"),
        }
    }

    // Boxed so the timer future has a nameable type; `expire` re-arms timers
    // that call back into it.
    fn expire_later(&self, session_id: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let recorder = self.clone();
        Box::pin(async move { recorder.expire(&session_id).await })
    }

    /// Moves through `Armed` into `Recording` for a new interval and schedules
    /// its automatic stop.
    fn arm(
        &self,
        state: &mut RecorderState,
        tag: MeasurementTag,
        duration_minutes: u32,
        context: SubtagContext,
    ) {
        state.phase = RecorderPhase::Armed;

        let active = ActiveRecording {
            session_id: Uuid::new_v4().to_string(),
            tag,
            subtag: build_subtag(tag, &context),
            context,
            duration_minutes,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            samples: SampleBuffer::new(),
        };

        let expiry = DeferredTask::spawn(
            active.target(),
            self.expire_later(active.session_id.clone()),
        );

        state.active = Some(active);
        state.expiry = Some(expiry);
        state.phase = RecorderPhase::Recording;
    }

    async fn finish(
        &self,
        expected_session: Option<&str>,
        cause: StopCause,
    ) -> Result<RecordingOutcome, RecorderError> {
        let mut state = self.state.lock().await;

        let current_id = match (state.phase, state.active.as_ref()) {
            (RecorderPhase::Recording, Some(active)) => active.session_id.clone(),
            _ => return Err(RecorderError::NotRecording),
        };
        if expected_session.is_some_and(|expected| expected != current_id) {
            return Err(RecorderError::NotRecording);
        }

        state.cancel_expiry();
        state.phase = RecorderPhase::Stopping;

        let Some(active) = state.active.take() else {
            state.reset_to_idle();
            return Err(RecorderError::NotRecording);
        };
        let is_series = active.tag.is_series();
        let mut events = Vec::new();

        let outcome = match cause {
            StopCause::Manual => {
                let reason = if is_series {
                    DiscardReason::SeriesEnded
                } else {
                    DiscardReason::StoppedEarly
                };
                state.phase = RecorderPhase::Discarded;
                state.sequence.reset_series();
                state.reset_to_idle();

                info!("Recording {} discarded: {reason}", active.session_id);
                events.push(CoreEvent::RecordingDiscarded {
                    session_id: active.session_id.clone(),
                    subtag: active.subtag.clone(),
                    reason: reason.to_string(),
                });
                RecordingOutcome::Discarded {
                    session_id: active.session_id,
                    reason,
                }
            }
            StopCause::Automatic => {
                // Once the sensor stream is gone no later interval can succeed.
                let stream_open = state.ingest.as_ref().is_some_and(|task| !task.is_finished());

                match self.validate(&active) {
                    Ok(()) => {
                        let session = self.materialize(&active);

                        match self.sink.session_completed(session.clone()).await {
                            Ok(()) => {
                                state.phase = RecorderPhase::Completed;
                                info!(
                                    "Recording {} completed with {} samples ({})",
                                    session.id(),
                                    session.samples().len(),
                                    session.subtag()
                                );
                                events.push(CoreEvent::SessionCompleted {
                                    session_id: session.id().to_string(),
                                    tag: session.tag(),
                                    subtag: session.subtag().to_string(),
                                    sample_count: session.samples().len(),
                                });

                                let next_interval = if is_series && stream_open {
                                    let next = state.sequence.next_interval();
                                    self.rearm_series(&mut state, &active, next);
                                    Some(next)
                                } else {
                                    self.end_mode(&mut state, &active);
                                    None
                                };

                                RecordingOutcome::Completed {
                                    session,
                                    next_interval,
                                }
                            }
                            Err(err) => {
                                state.phase = RecorderPhase::Failed;
                                error!("Failed to enqueue session {}: {err}", session.id());
                                events.push(CoreEvent::RecordingFailed {
                                    session_id: session.id().to_string(),
                                    subtag: session.subtag().to_string(),
                                    reason: format!("session could not be queued: {err}"),
                                });

                                let next_interval =
                                    self.retry_interval_or_end(&mut state, &active, stream_open);
                                RecordingOutcome::NotQueued {
                                    session,
                                    reason: err.to_string(),
                                    next_interval,
                                }
                            }
                        }
                    }
                    Err(reason) => {
                        state.phase = RecorderPhase::Failed;
                        warn!("Recording {} failed validation: {reason}", active.session_id);
                        events.push(CoreEvent::RecordingFailed {
                            session_id: active.session_id.clone(),
                            subtag: active.subtag.clone(),
                            reason: reason.to_string(),
                        });

                        let next_interval =
                            self.retry_interval_or_end(&mut state, &active, stream_open);
                        RecordingOutcome::Failed {
                            session_id: active.session_id,
                            reason,
                            next_interval,
                        }
                    }
                }
            }
        };

        events.push(CoreEvent::RecorderStateChanged {
            state: state.snapshot(),
        });
        drop(state);

        for event in events {
            self.events.emit(event);
        }

        Ok(outcome)
    }

    /// Re-arms a series under the same interval number, or ends it once the
    /// sample stream has closed.
    fn retry_interval_or_end(
        &self,
        state: &mut RecorderState,
        finished: &ActiveRecording,
        stream_open: bool,
    ) -> Option<u32> {
        if finished.tag.is_series() && stream_open {
            let same = finished.context.interval_number.unwrap_or(1);
            self.rearm_series(state, finished, same);
            Some(same)
        } else {
            self.end_mode(state, finished);
            None
        }
    }

    fn end_mode(&self, state: &mut RecorderState, finished: &ActiveRecording) {
        if finished.tag.is_series() {
            warn!(
                "Sample stream closed; series ended after {}",
                finished.subtag
            );
        }
        state.sequence.reset_series();
        state.reset_to_idle();
    }

    fn rearm_series(&self, state: &mut RecorderState, finished: &ActiveRecording, interval: u32) {
        state.mode = Some(RecordingMode::SeriesRecording {
            interval_duration_minutes: finished.duration_minutes,
            current_interval_number: interval,
        });

        let context = SubtagContext {
            interval_number: Some(interval),
            ..finished.context.clone()
        };
        self.arm(state, finished.tag, finished.duration_minutes, context);

        info!("Series interval {interval} armed ({} min)", finished.duration_minutes);
    }

    fn validate(&self, active: &ActiveRecording) -> Result<(), ValidationError> {
        let elapsed = active.elapsed();
        let min_duration = self.settings.min_duration();
        if elapsed < min_duration {
            return Err(ValidationError::TooShort {
                elapsed_secs: elapsed.as_secs(),
                required_secs: min_duration.as_secs(),
            });
        }

        let accepted = active.samples.len();
        if accepted < self.settings.min_sample_count {
            return Err(ValidationError::InsufficientSamples {
                accepted,
                required: self.settings.min_sample_count,
            });
        }

        Ok(())
    }

    fn materialize(&self, active: &ActiveRecording) -> Session {
        Session::from_parts(
            active.session_id.clone(),
            self.user_id.to_string(),
            active.tag,
            active.subtag.clone(),
            active.duration_minutes,
            active.started_at,
            active.samples.clone().into_samples(),
        )
    }
}
