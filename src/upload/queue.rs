use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::{
    error::QueueError,
    events::{CoreEvent, EventBus},
    models::{QueueItem, Session, UploadStatus},
    recorder::SessionSink,
    store::QueueStore,
};

use super::uploader::UploadReceipt;

/// Reason shown on items held back behind an earlier series interval.
pub const WAITING_FOR_PREVIOUS_INTERVAL: &str = "waiting for previous interval";

/// Reason attached to items found mid-upload when the queue is loaded.
pub const INTERRUPTED_UPLOAD: &str = "upload interrupted by restart";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueInner {
    items: Vec<QueueItem>,
}

impl QueueInner {
    fn position(&self, id: &str) -> Result<usize, QueueError> {
        self.items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| QueueError::UnknownItem(id.to_string()))
    }

    fn in_flight(&self) -> Option<&QueueItem> {
        self.items
            .iter()
            .find(|item| item.status == UploadStatus::Uploading)
    }
}

/// Picks the next item to deliver.
///
/// Pending series items go first, lowest interval number wins and ties keep
/// enqueue order. Without any, the oldest pending non-series item is chosen.
pub fn select_next<'a>(
    items: &'a [QueueItem],
    skip: &HashSet<String>,
) -> Option<&'a QueueItem> {
    let pending = items
        .iter()
        .filter(|item| item.status == UploadStatus::Pending && !skip.contains(&item.id));

    let mut oldest_standalone: Option<&QueueItem> = None;
    let mut lowest_interval: Option<(u32, &QueueItem)> = None;

    for item in pending {
        match item.session.interval_number().filter(|_| item.session.is_series()) {
            Some(number) => {
                if lowest_interval.map_or(true, |(best, _)| number < best) {
                    lowest_interval = Some((number, item));
                }
            }
            None => {
                if oldest_standalone.is_none() {
                    oldest_standalone = Some(item);
                }
            }
        }
    }

    lowest_interval.map(|(_, item)| item).or(oldest_standalone)
}

/// Durable, ordered collection of sessions awaiting delivery.
///
/// Every mutation holds the queue lock until the snapshot is written, so
/// mutations never interleave and each one is on disk when the call returns.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<Mutex<QueueInner>>,
    store: QueueStore,
    events: EventBus,
    wake: Arc<Notify>,
}

impl UploadQueue {
    /// Loads the persisted queue, applying crash recovery. Items reset from
    /// `Uploading` are announced on `events` as they come back `Pending`.
    pub async fn open(store: QueueStore, events: EventBus) -> anyhow::Result<Self> {
        let recovered = store.load().await?;

        if !recovered.recovered_in_flight.is_empty() {
            warn!(
                "Recovered {} interrupted upload(s); they will be retried",
                recovered.recovered_in_flight.len()
            );
        }
        for id in &recovered.recovered_in_flight {
            events.emit(CoreEvent::QueueItemChanged {
                session_id: id.clone(),
                from: Some(UploadStatus::Uploading),
                to: UploadStatus::Pending,
                reason: Some(INTERRUPTED_UPLOAD.to_string()),
            });
        }
        if let Some(path) = &recovered.quarantined {
            let message = match recovered.quarantined_entries {
                0 => format!("queue snapshot was unreadable and moved to {path}"),
                n => format!("{n} unreadable queue entries were moved to {path}"),
            };
            events.emit(CoreEvent::PersistenceFailed { message });
        }
        info!(
            "Upload queue loaded with {} item(s) from {}",
            recovered.items.len(),
            store.path().display()
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(QueueInner {
                items: recovered.items,
            })),
            store,
            events,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Handle the worker waits on; signalled whenever new work may exist.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn enqueue(&self, session: Session) -> Result<(), QueueError> {
        let id = session.id().to_string();
        {
            let mut inner = self.inner.lock().await;
            if inner.items.iter().any(|item| item.id == id) {
                return Err(QueueError::Duplicate(id));
            }

            info!("Queued session {id} ({})", session.subtag());
            inner.items.push(QueueItem::new(session, Utc::now()));
            self.persist(&inner).await;
        }

        self.events.emit(CoreEvent::QueueItemChanged {
            session_id: id,
            from: None,
            to: UploadStatus::Pending,
            reason: None,
        });
        self.wake.notify_one();
        Ok(())
    }

    pub async fn select_next(&self) -> Option<QueueItem> {
        self.select_next_excluding(&HashSet::new()).await
    }

    pub async fn select_next_excluding(&self, skip: &HashSet<String>) -> Option<QueueItem> {
        let inner = self.inner.lock().await;
        select_next(&inner.items, skip).cloned()
    }

    /// Claims an item for delivery. Refused while any other item is in flight.
    pub async fn mark_uploading(&self, id: &str) -> Result<QueueItem, QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(other) = inner.in_flight() {
            return Err(QueueError::UploadInFlight {
                in_flight: other.id.clone(),
            });
        }

        let index = inner.position(id)?;
        let item = &mut inner.items[index];
        let from = item.transition(UploadStatus::Uploading)?;
        item.last_attempt_at = Some(Utc::now());
        let claimed = item.clone();

        self.persist(&inner).await;
        drop(inner);

        self.emit_changed(id, from, UploadStatus::Uploading, None);
        Ok(claimed)
    }

    pub async fn mark_completed(&self, id: &str, receipt: &UploadReceipt) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let index = inner.position(id)?;
        let item = &mut inner.items[index];
        let from = item.transition(UploadStatus::Completed)?;
        item.last_error = None;

        if receipt.session_id != id {
            warn!(
                "Receipt for {id} names session {}; keeping local id",
                receipt.session_id
            );
        }

        self.persist(&inner).await;
        drop(inner);

        self.emit_changed(id, from, UploadStatus::Completed, None);
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let index = inner.position(id)?;
        let item = &mut inner.items[index];
        let from = item.transition(UploadStatus::Failed)?;
        item.attempt_count += 1;
        item.last_error = Some(reason.to_string());

        self.persist(&inner).await;
        drop(inner);

        self.emit_changed(id, from, UploadStatus::Failed, Some(reason.to_string()));
        Ok(())
    }

    /// Returns an in-flight item to Pending without counting it as a failed attempt.
    pub async fn revert_to_pending(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let index = inner.position(id)?;
        let item = &mut inner.items[index];
        let from = item.transition(UploadStatus::Pending)?;
        item.last_error = Some(reason.to_string());

        self.persist(&inner).await;
        drop(inner);

        self.emit_changed(id, from, UploadStatus::Pending, Some(reason.to_string()));
        Ok(())
    }

    pub async fn clear_completed(&self) -> Vec<String> {
        self.remove_where(|item| item.status == UploadStatus::Completed)
            .await
    }

    /// Removes everything except an item that is currently being delivered;
    /// that one is left for the worker to resolve.
    pub async fn clear_all(&self) -> Vec<String> {
        self.remove_where(|item| item.status != UploadStatus::Uploading)
            .await
    }

    pub async fn retry_all_failed(&self) -> usize {
        let mut retried = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for item in inner
                .items
                .iter_mut()
                .filter(|item| item.status == UploadStatus::Failed)
            {
                if item.transition(UploadStatus::Pending).is_ok() {
                    item.last_error = None;
                    retried.push(item.id.clone());
                }
            }

            if !retried.is_empty() {
                self.persist(&inner).await;
            }
        }

        for id in &retried {
            self.emit_changed(id, UploadStatus::Failed, UploadStatus::Pending, None);
        }
        if !retried.is_empty() {
            info!("Retrying {} failed upload(s)", retried.len());
            self.wake.notify_one();
        }
        retried.len()
    }

    pub async fn items(&self) -> Vec<QueueItem> {
        self.inner.lock().await.items.clone()
    }

    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        let inner = self.inner.lock().await;
        inner.items.iter().find(|item| item.id == id).cloned()
    }

    pub async fn has_uploading(&self) -> bool {
        self.inner.lock().await.in_flight().is_some()
    }

    pub async fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock().await;
        inner
            .items
            .iter()
            .fold(QueueCounts::default(), |mut counts, item| {
                match item.status {
                    UploadStatus::Pending => counts.pending += 1,
                    UploadStatus::Uploading => counts.uploading += 1,
                    UploadStatus::Completed => counts.completed += 1,
                    UploadStatus::Failed => counts.failed += 1,
                }
                counts
            })
    }

    async fn remove_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&QueueItem) -> bool,
    {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let mut removed = Vec::new();
            inner.items.retain(|item| {
                if predicate(item) {
                    removed.push(item.id.clone());
                    false
                } else {
                    true
                }
            });

            if !removed.is_empty() {
                self.persist(&inner).await;
            }
            removed
        };

        if !removed.is_empty() {
            self.events.emit(CoreEvent::QueueItemsRemoved {
                session_ids: removed.clone(),
            });
        }
        removed
    }

    /// A failed write leaves the in-memory queue authoritative; the next
    /// successful write brings the snapshot back in line.
    async fn persist(&self, inner: &QueueInner) {
        if let Err(err) = self.store.save(inner.items.clone()).await {
            error!("Failed to persist upload queue: {err:#}");
            self.events.emit(CoreEvent::PersistenceFailed {
                message: format!("{err:#}"),
            });
        }
    }

    fn emit_changed(&self, id: &str, from: UploadStatus, to: UploadStatus, reason: Option<String>) {
        self.events.emit(CoreEvent::QueueItemChanged {
            session_id: id.to_string(),
            from: Some(from),
            to,
            reason,
        });
    }
}

#[async_trait]
impl SessionSink for UploadQueue {
    async fn session_completed(&self, session: Session) -> Result<(), QueueError> {
        self.enqueue(session).await
    }
}
