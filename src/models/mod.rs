pub mod queue_item;
pub mod session;

pub use queue_item::{QueueItem, UploadStatus};
pub use session::{MeasurementTag, RecordingMode, Session};
