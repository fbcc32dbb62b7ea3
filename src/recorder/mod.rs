pub mod controller;
mod ingest;
pub mod samples;
pub mod sequence;
pub mod state;
pub mod subtag;

pub use controller::{
    DiscardReason, RecordingOutcome, RecordingRequest, SessionRecorder, SessionSink, StopCause,
};
pub use sequence::SequenceTracker;
pub use state::{RecorderPhase, RecorderSnapshot, RecorderState};
