pub mod credentials;
pub mod http;
pub mod queue;
pub mod uploader;
pub mod worker;

pub use credentials::{CredentialProvider, StaticCredentials};
pub use http::HttpUploader;
pub use queue::{QueueCounts, UploadQueue, INTERRUPTED_UPLOAD, WAITING_FOR_PREVIOUS_INTERVAL};
pub use uploader::{FailureKind, UploadFailure, UploadPayload, UploadReceipt, Uploader};
pub use worker::{AttemptOutcome, DrainSummary, UploadWorker};
