use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    credentials::CredentialProvider,
    queue::{UploadQueue, WAITING_FOR_PREVIOUS_INTERVAL},
    uploader::{FailureKind, UploadPayload, Uploader},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Another attempt holds the gate or an item is already in flight.
    Busy,
    Idle,
    /// No access token yet; nothing was touched.
    AwaitingCredentials,
    Delivered(String),
    /// Rejected because an earlier series interval is still outstanding.
    Deferred(String),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: Vec<String>,
    pub deferred: Vec<String>,
    pub failed: Vec<String>,
    /// How the drain stopped: `Idle`, `Busy` or `AwaitingCredentials`.
    pub stopped_on: Option<AttemptOutcome>,
}

impl DrainSummary {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.deferred.len() + self.failed.len()
    }
}

/// Moves queue items to the backend, one at a time.
#[derive(Clone)]
pub struct UploadWorker {
    queue: UploadQueue,
    uploader: Arc<dyn Uploader>,
    credentials: Arc<dyn CredentialProvider>,
    gate: Arc<Mutex<()>>,
    sweep_interval: Duration,
}

impl UploadWorker {
    pub fn new(
        queue: UploadQueue,
        uploader: Arc<dyn Uploader>,
        credentials: Arc<dyn CredentialProvider>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            queue,
            uploader,
            credentials,
            gate: Arc::new(Mutex::new(())),
            sweep_interval,
        }
    }

    pub async fn attempt_next(&self) -> AttemptOutcome {
        self.attempt_next_excluding(&HashSet::new()).await
    }

    /// Runs one attempt, ignoring items in `skip`. The gate is held across the
    /// network call so attempts never overlap; the queue lock is not.
    pub async fn attempt_next_excluding(&self, skip: &HashSet<String>) -> AttemptOutcome {
        let Ok(_gate) = self.gate.try_lock() else {
            return AttemptOutcome::Busy;
        };

        if self.queue.has_uploading().await {
            return AttemptOutcome::Busy;
        }

        let Some(candidate) = self.queue.select_next_excluding(skip).await else {
            return AttemptOutcome::Idle;
        };

        let Some(token) = self.credentials.current_access_token().await else {
            log_info!("No access token; holding {} until the next sweep", candidate.id);
            return AttemptOutcome::AwaitingCredentials;
        };

        let item = match self.queue.mark_uploading(&candidate.id).await {
            Ok(item) => item,
            Err(err) => {
                log_warn!("Could not claim {} for upload: {err}", candidate.id);
                return AttemptOutcome::Busy;
            }
        };

        let payload = UploadPayload::from(&item.session);
        log_info!(
            "Uploading session {} ({}, {} samples)",
            item.id,
            payload.subtag,
            payload.rr_count
        );

        match self.uploader.submit(&payload, &token).await {
            Ok(receipt) => {
                if let Err(err) = self.queue.mark_completed(&item.id, &receipt).await {
                    log_error!("Delivered {} but could not record it: {err}", item.id);
                }
                AttemptOutcome::Delivered(item.id)
            }
            Err(failure) => match failure.kind {
                FailureKind::OutOfOrder => {
                    log_info!("Session {} is waiting for an earlier interval", item.id);
                    if let Err(err) = self
                        .queue
                        .revert_to_pending(&item.id, WAITING_FOR_PREVIOUS_INTERVAL)
                        .await
                    {
                        log_error!("Could not return {} to pending: {err}", item.id);
                    }
                    AttemptOutcome::Deferred(item.id)
                }
                FailureKind::Transient | FailureKind::Terminal => {
                    log_warn!("Upload of {} failed: {}", item.id, failure.message);
                    if let Err(err) = self.queue.mark_failed(&item.id, &failure.message).await {
                        log_error!("Could not mark {} as failed: {err}", item.id);
                    }
                    AttemptOutcome::Failed(item.id)
                }
            },
        }
    }

    /// Attempts until nothing eligible is left. Items deferred in this pass
    /// are skipped so the rest of the queue keeps moving.
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let mut skip = HashSet::new();

        loop {
            match self.attempt_next_excluding(&skip).await {
                AttemptOutcome::Delivered(id) => summary.delivered.push(id),
                AttemptOutcome::Failed(id) => summary.failed.push(id),
                AttemptOutcome::Deferred(id) => {
                    skip.insert(id.clone());
                    summary.deferred.push(id);
                }
                stop @ (AttemptOutcome::Busy
                | AttemptOutcome::Idle
                | AttemptOutcome::AwaitingCredentials) => {
                    summary.stopped_on = Some(stop);
                    break;
                }
            }
        }

        summary
    }

    /// Flips every Failed item back to Pending and drains.
    pub async fn retry_failed(&self) -> DrainSummary {
        let retried = self.queue.retry_all_failed().await;
        if retried > 0 {
            log_info!("Retrying {retried} failed upload(s)");
        }
        self.drain().await
    }

    /// Runs the delivery loop until `cancel` fires: on every queue signal and
    /// on a fixed sweep for anything left behind.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) {
        let wake = self.queue.wake_handle();
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log_info!(
            "Upload worker started (sweep every {}s)",
            self.sweep_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info!("Upload worker shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }

            let summary = self.drain().await;
            if summary.attempted() > 0 {
                log_info!(
                    "Upload pass: {} delivered, {} deferred, {} failed",
                    summary.delivered.len(),
                    summary.deferred.len(),
                    summary.failed.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{CoreEvent, EventBus},
        models::{MeasurementTag, Session, UploadStatus},
        store::QueueStore,
        upload::{StaticCredentials, UploadFailure, UploadReceipt},
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Accepts series intervals only in ascending order, like the backend.
    #[derive(Default)]
    struct OrderedBackend {
        accepted: std::sync::Mutex<Vec<String>>,
        submitted: std::sync::Mutex<Vec<UploadPayload>>,
        scripted: std::sync::Mutex<VecDeque<UploadFailure>>,
    }

    impl OrderedBackend {
        fn fail_next(&self, failure: UploadFailure) {
            self.scripted.lock().unwrap().push_back(failure);
        }

        fn accepted(&self) -> Vec<String> {
            self.accepted.lock().unwrap().clone()
        }

        fn submitted(&self) -> Vec<UploadPayload> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Uploader for OrderedBackend {
        async fn submit(
            &self,
            payload: &UploadPayload,
            _access_token: &str,
        ) -> Result<UploadReceipt, UploadFailure> {
            self.submitted.lock().unwrap().push(payload.clone());
            if let Some(failure) = self.scripted.lock().unwrap().pop_front() {
                return Err(failure);
            }

            let mut accepted = self.accepted.lock().unwrap();
            if let Some(n) = payload
                .subtag
                .strip_prefix("sleep_interval_")
                .and_then(|n| n.parse::<u32>().ok())
            {
                if n > 1 && !accepted.contains(&format!("sleep_interval_{}", n - 1)) {
                    return Err(UploadFailure::out_of_order("interval out of order"));
                }
            }
            accepted.push(payload.subtag.clone());
            Ok(UploadReceipt {
                session_id: payload.session_id.clone(),
                group_id: Some(1),
                received_at: None,
            })
        }
    }

    /// Holds every submission until released.
    struct BlockingUploader {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Uploader for BlockingUploader {
        async fn submit(
            &self,
            payload: &UploadPayload,
            _access_token: &str,
        ) -> Result<UploadReceipt, UploadFailure> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(UploadReceipt {
                session_id: payload.session_id.clone(),
                group_id: None,
                received_at: None,
            })
        }
    }

    fn session(id: &str, tag: MeasurementTag, subtag: &str) -> Session {
        Session::from_parts(
            id.into(),
            "user-7".into(),
            tag,
            subtag.into(),
            5,
            Utc::now(),
            vec![810.0, 790.0, 805.0, 800.0, 795.0, 812.0, 808.0, 799.0, 801.0, 803.0],
        )
    }

    async fn queue(dir: &TempDir) -> UploadQueue {
        let store = QueueStore::open(dir.path().join("queue.json")).unwrap();
        UploadQueue::open(store, EventBus::default()).await.unwrap()
    }

    fn worker(
        queue: &UploadQueue,
        uploader: Arc<dyn Uploader>,
        credentials: Arc<StaticCredentials>,
    ) -> UploadWorker {
        UploadWorker::new(queue.clone(), uploader, credentials, Duration::from_secs(30))
    }

    fn signed_in() -> Arc<StaticCredentials> {
        Arc::new(StaticCredentials::new(Some("token".into())))
    }

    #[tokio::test]
    async fn earlier_interval_is_delivered_first() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let backend = Arc::new(OrderedBackend::default());
        let worker = worker(&queue, backend.clone(), signed_in());

        queue
            .enqueue(session("s2", MeasurementTag::Sleep, "sleep_interval_2"))
            .await
            .unwrap();
        queue
            .enqueue(session("s1", MeasurementTag::Sleep, "sleep_interval_1"))
            .await
            .unwrap();

        let summary = worker.drain().await;
        assert_eq!(summary.delivered, vec!["s1", "s2"]);
        assert!(summary.deferred.is_empty());
        assert_eq!(backend.accepted(), vec!["sleep_interval_1", "sleep_interval_2"]);
        assert_eq!(queue.counts().await.completed, 2);
    }

    #[tokio::test]
    async fn out_of_order_rejection_waits_without_counting_a_failure() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let backend = Arc::new(OrderedBackend::default());
        let worker = worker(&queue, backend.clone(), signed_in());

        queue
            .enqueue(session("s2", MeasurementTag::Sleep, "sleep_interval_2"))
            .await
            .unwrap();
        queue
            .enqueue(session("r1", MeasurementTag::Rest, "rest_single"))
            .await
            .unwrap();

        let summary = worker.drain().await;
        assert_eq!(summary.deferred, vec!["s2"]);
        assert_eq!(summary.delivered, vec!["r1"]);
        assert_eq!(summary.stopped_on, Some(AttemptOutcome::Idle));

        let waiting = queue.get("s2").await.unwrap();
        assert_eq!(waiting.status, UploadStatus::Pending);
        assert_eq!(waiting.attempt_count, 0);
        assert_eq!(waiting.last_error.as_deref(), Some(WAITING_FOR_PREVIOUS_INTERVAL));

        queue
            .enqueue(session("s1", MeasurementTag::Sleep, "sleep_interval_1"))
            .await
            .unwrap();
        let summary = worker.drain().await;
        assert_eq!(summary.delivered, vec!["s1", "s2"]);
        assert!(queue.get("s2").await.unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn a_failed_item_does_not_stall_the_queue() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let backend = Arc::new(OrderedBackend::default());
        backend.fail_next(UploadFailure::terminal("payload rejected"));
        let worker = worker(&queue, backend.clone(), signed_in());

        queue
            .enqueue(session("w1", MeasurementTag::Wake, "wake_single"))
            .await
            .unwrap();
        queue
            .enqueue(session("w2", MeasurementTag::Wake, "wake_single"))
            .await
            .unwrap();

        let summary = worker.drain().await;
        assert_eq!(summary.failed, vec!["w1"]);
        assert_eq!(summary.delivered, vec!["w2"]);

        let failed = queue.get("w1").await.unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("payload rejected"));
    }

    #[tokio::test]
    async fn retry_resubmits_the_same_payload() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let backend = Arc::new(OrderedBackend::default());
        backend.fail_next(UploadFailure::transient("connection reset"));
        let worker = worker(&queue, backend.clone(), signed_in());

        queue
            .enqueue(session("x1", MeasurementTag::Experiment, "experiment_box_breathing"))
            .await
            .unwrap();

        assert_eq!(worker.attempt_next().await, AttemptOutcome::Failed("x1".into()));
        let summary = worker.retry_failed().await;
        assert_eq!(summary.delivered, vec!["x1"]);

        let submitted = backend.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0], submitted[1]);
        assert_eq!(queue.get("x1").await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn missing_credentials_leave_the_queue_untouched() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let backend = Arc::new(OrderedBackend::default());
        let credentials = Arc::new(StaticCredentials::new(None));
        let worker = worker(&queue, backend.clone(), credentials.clone());

        queue
            .enqueue(session("r1", MeasurementTag::Rest, "rest_single"))
            .await
            .unwrap();

        assert_eq!(worker.attempt_next().await, AttemptOutcome::AwaitingCredentials);
        let item = queue.get("r1").await.unwrap();
        assert_eq!(item.status, UploadStatus::Pending);
        assert!(item.last_attempt_at.is_none());
        assert!(backend.submitted().is_empty());

        credentials.set("token");
        assert_eq!(worker.attempt_next().await, AttemptOutcome::Delivered("r1".into()));
    }

    #[tokio::test]
    async fn attempts_never_overlap() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let uploader = Arc::new(BlockingUploader {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let worker = worker(&queue, uploader.clone(), signed_in());

        queue
            .enqueue(session("a", MeasurementTag::Rest, "rest_single"))
            .await
            .unwrap();
        queue
            .enqueue(session("b", MeasurementTag::Rest, "rest_single"))
            .await
            .unwrap();

        let first = tokio::spawn({
            let worker = worker.clone();
            async move { worker.attempt_next().await }
        });
        uploader.entered.notified().await;

        assert_eq!(worker.attempt_next().await, AttemptOutcome::Busy);
        assert_eq!(queue.counts().await.uploading, 1);

        uploader.release.notify_one();
        assert_eq!(first.await.unwrap(), AttemptOutcome::Delivered("a".into()));
        assert_eq!(queue.get("b").await.unwrap().status, UploadStatus::Pending);
    }

    #[tokio::test]
    async fn spawned_loop_delivers_on_enqueue_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let backend = Arc::new(OrderedBackend::default());
        let cancel = CancellationToken::new();
        let handle = worker(&queue, backend.clone(), signed_in()).spawn(cancel.clone());

        queue
            .enqueue(session("r1", MeasurementTag::Rest, "rest_single"))
            .await
            .unwrap();

        for _ in 0..100 {
            if queue.counts().await.completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.counts().await.completed, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unwritable_snapshot_does_not_stop_delivery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let queue = UploadQueue::open(QueueStore::open(path.clone()).unwrap(), events)
            .await
            .unwrap();
        let backend = Arc::new(OrderedBackend::default());
        let worker = worker(&queue, backend.clone(), signed_in());

        // A non-empty directory where the snapshot belongs makes every save fail.
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        queue
            .enqueue(session("r1", MeasurementTag::Rest, "rest_single"))
            .await
            .unwrap();

        let mut persistence_failures = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CoreEvent::PersistenceFailed { .. }) {
                persistence_failures += 1;
            }
        }
        assert_eq!(persistence_failures, 1);
        assert_eq!(queue.counts().await.pending, 1);

        let summary = worker.drain().await;
        assert_eq!(summary.delivered, vec!["r1"]);
        assert_eq!(backend.accepted(), vec!["rest_single"]);
        assert_eq!(queue.get("r1").await.unwrap().status, UploadStatus::Completed);
        assert!(path.is_dir());
    }
}
