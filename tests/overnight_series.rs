use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use vitalsync_lib::{
    recorder::{SessionRecorder, SessionSink, StopCause},
    settings::{RecorderSettings, UploadSettings},
    store::QueueStore,
    upload::{
        HttpUploader, StaticCredentials, UploadFailure, UploadPayload, UploadQueue, UploadReceipt,
        UploadWorker, Uploader,
    },
    EventBus, MeasurementTag, QueueError, RecordingOutcome, RecordingRequest, RecordingService,
    ServiceConfig, Session, UploadStatus,
};
use wiremock::{matchers::method, Mock, MockServer, Request, ResponseTemplate};

#[derive(Default)]
struct CollectingSink {
    sessions: Mutex<Vec<Session>>,
}

#[async_trait]
impl SessionSink for CollectingSink {
    async fn session_completed(&self, session: Session) -> Result<(), QueueError> {
        self.sessions.lock().unwrap().push(session);
        Ok(())
    }
}

/// Accepts `sleep_interval_<n>` only once `n - 1` has been accepted.
#[derive(Default)]
struct OrderedBackend {
    accepted: Mutex<Vec<String>>,
}

#[async_trait]
impl Uploader for OrderedBackend {
    async fn submit(
        &self,
        payload: &UploadPayload,
        _access_token: &str,
    ) -> Result<UploadReceipt, UploadFailure> {
        let mut accepted = self.accepted.lock().unwrap();
        let interval = payload
            .subtag
            .strip_prefix("sleep_interval_")
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(1);
        if interval > 1 && !accepted.contains(&format!("sleep_interval_{}", interval - 1)) {
            return Err(UploadFailure::out_of_order("earlier interval missing"));
        }
        accepted.push(payload.subtag.clone());
        Ok(UploadReceipt {
            session_id: payload.session_id.clone(),
            group_id: Some(9),
            received_at: None,
        })
    }
}

async fn feed(tx: &mpsc::Sender<f64>, count: usize) {
    for i in 0..count {
        tx.send(58.0 + (i % 5) as f64).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn overnight_intervals_survive_a_crash_and_arrive_in_order() {
    let sink = Arc::new(CollectingSink::default());
    let recorder = SessionRecorder::new(
        "sleeper",
        RecorderSettings::default(),
        sink.clone(),
        EventBus::default(),
    );

    let (tx, rx) = mpsc::channel(64);
    recorder
        .start(RecordingRequest::new(MeasurementTag::Sleep, 5), rx)
        .await
        .unwrap();
    for _ in 0..3 {
        feed(&tx, 15).await;
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
    }
    let outcome = recorder.stop(StopCause::Manual).await.unwrap();
    assert!(matches!(outcome, RecordingOutcome::Discarded { .. }));

    let sessions = sink.sessions.lock().unwrap().clone();
    let subtags: Vec<_> = sessions.iter().map(|s| s.subtag().to_string()).collect();
    assert_eq!(
        subtags,
        vec!["sleep_interval_1", "sleep_interval_2", "sleep_interval_3"]
    );

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.json");
    {
        let queue = UploadQueue::open(QueueStore::open(path.clone()).unwrap(), EventBus::default())
            .await
            .unwrap();
        for session in sessions.iter().rev() {
            queue.enqueue(session.clone()).await.unwrap();
        }
        // The process dies while interval 3 is on the wire.
        queue.mark_uploading(sessions[2].id()).await.unwrap();
    }

    let queue = UploadQueue::open(QueueStore::open(path.clone()).unwrap(), EventBus::default())
        .await
        .unwrap();
    let counts = queue.counts().await;
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.uploading, 0);

    let backend = Arc::new(OrderedBackend::default());
    let worker = UploadWorker::new(
        queue.clone(),
        backend.clone(),
        Arc::new(StaticCredentials::new(Some("night-token".into()))),
        Duration::from_secs(30),
    );
    let summary = worker.drain().await;

    assert!(summary.deferred.is_empty());
    assert_eq!(
        *backend.accepted.lock().unwrap(),
        vec!["sleep_interval_1", "sleep_interval_2", "sleep_interval_3"]
    );
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(on_disk
        .as_array()
        .unwrap()
        .iter()
        .all(|item| item["status"] == "completed"));
}

fn stored_item(id: &str, tag: &str, subtag: &str, status: &str) -> serde_json::Value {
    let failed = status == "failed";
    let attempt_count = if failed { 1 } else { 0 };
    let last_error = failed.then_some("server responded 503");
    serde_json::json!({
        "id": id,
        "session": {
            "id": id,
            "userId": "user-5",
            "tag": tag,
            "subtag": subtag,
            "groupId": 0,
            "durationMinutes": 5,
            "recordedAt": "2026-03-14T23:00:00Z",
            "samples": [1000.0, 990.0, 1010.0, 1005.0, 995.0, 1002.0, 998.0, 1001.0, 999.0, 1003.0]
        },
        "status": status,
        "createdAt": "2026-03-14T23:05:00Z",
        "lastAttemptAt": null,
        "attemptCount": attempt_count,
        "lastError": last_error
    })
}

#[tokio::test]
async fn service_recovers_queue_and_delivers_once_signed_in() {
    let dir = TempDir::new().unwrap();
    let queue_path = dir.path().join("queue.json");
    let snapshot = serde_json::json!([
        stored_item("rest-a", "rest", "rest_single", "failed"),
        stored_item("night-2", "sleep", "sleep_interval_2", "uploading"),
        stored_item("night-1", "sleep", "sleep_interval_1", "pending"),
    ]);
    std::fs::write(&queue_path, serde_json::to_vec_pretty(&snapshot).unwrap()).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(|request: &Request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            ResponseTemplate::new(201)
                .set_body_json(serde_json::json!({ "session_id": body["session_id"] }))
        })
        .mount(&server)
        .await;

    let credentials = Arc::new(StaticCredentials::new(None));
    let uploader = Arc::new(
        HttpUploader::new(format!("{}/v1/sessions", server.uri()), Duration::from_secs(5))
            .unwrap(),
    );
    let service = RecordingService::open(
        ServiceConfig {
            user_id: "user-5".into(),
            queue_path,
            recorder: RecorderSettings::default(),
            upload: UploadSettings::default(),
        },
        uploader,
        credentials.clone(),
    )
    .await
    .unwrap();

    let counts = service.queue_counts().await;
    assert_eq!((counts.pending, counts.uploading, counts.failed), (2, 0, 1));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    credentials.set("fresh-token");
    service.retry_failed().await;

    for _ in 0..200 {
        if service.queue_counts().await.completed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let items = service.queue_items().await;
    assert!(items.iter().all(|item| item.status == UploadStatus::Completed));

    let subtags: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            body["subtag"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(subtags, vec!["sleep_interval_1", "sleep_interval_2", "rest_single"]);

    assert_eq!(service.clear_completed().await.len(), 3);
    service.shutdown().await;
}

#[tokio::test]
async fn unreadable_queue_is_set_aside_not_lost() {
    let dir = TempDir::new().unwrap();
    let queue_path = dir.path().join("queue.json");
    std::fs::write(&queue_path, b"{ not a queue").unwrap();

    let service = RecordingService::open(
        ServiceConfig {
            user_id: "user-6".into(),
            queue_path: queue_path.clone(),
            recorder: RecorderSettings::default(),
            upload: UploadSettings::default(),
        },
        Arc::new(OrderedBackend::default()),
        Arc::new(StaticCredentials::new(None)),
    )
    .await
    .unwrap();

    assert!(service.queue_items().await.is_empty());
    let quarantined: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(
        std::fs::read(quarantined[0].path()).unwrap(),
        b"{ not a queue"
    );

    service.shutdown().await;
}
