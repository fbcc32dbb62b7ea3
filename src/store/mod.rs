use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use tokio::sync::oneshot;

mod snapshot;

pub use snapshot::{normalize, read_snapshot, write_snapshot_atomic, RecoveredQueue};

use crate::models::QueueItem;

type StoreTask = Box<dyn FnOnce(&Path) + Send + 'static>;

/// Durable home of the upload queue: one JSON snapshot file, rewritten whole
/// on every change. All file access happens on a dedicated thread, so writes
/// are applied in the order they were requested. The thread finishes the
/// queued writes and exits once the last clone is dropped.
#[derive(Clone)]
pub struct QueueStore {
    sender: mpsc::Sender<StoreTask>,
    path: Arc<PathBuf>,
}

impl QueueStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create queue directory {}", parent.display())
            })?;
        }

        let (sender, tasks) = mpsc::channel::<StoreTask>();
        let snapshot_path = path.clone();

        thread::Builder::new()
            .name("vitalsync-store".into())
            .spawn(move || {
                for task in tasks {
                    task(&snapshot_path);
                }
                debug!("Queue store for {} closed", snapshot_path.display());
            })
            .context("failed to spawn queue store thread")?;

        info!("Queue store opened at {}", path.display());

        Ok(Self {
            sender,
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.sender
            .send(Box::new(move |path| {
                if reply_tx.send(task(path)).is_err() {
                    error!("Store caller dropped before receiving result");
                }
            }))
            .map_err(|_| anyhow!("queue store thread is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }

    /// Reads the snapshot and applies crash recovery. When recovery changed
    /// anything, the normalized queue is written back before returning.
    pub async fn load(&self) -> Result<RecoveredQueue> {
        self.execute(|path| {
            let recovered = read_snapshot(path)?;
            if recovered.needs_rewrite() {
                write_snapshot_atomic(path, &recovered.items)
                    .context("failed to rewrite recovered queue snapshot")?;
            }
            Ok(recovered)
        })
        .await
    }

    pub async fn save(&self, items: Vec<QueueItem>) -> Result<()> {
        self.execute(move |path| write_snapshot_atomic(path, &items))
            .await
    }
}
