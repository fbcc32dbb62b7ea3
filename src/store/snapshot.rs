use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, warn};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::models::{QueueItem, UploadStatus};

/// Queue contents as read at startup, after crash-recovery normalization.
#[derive(Debug, Clone, Default)]
pub struct RecoveredQueue {
    pub items: Vec<QueueItem>,
    /// Ids of items that were mid-upload when the previous process stopped.
    pub recovered_in_flight: Vec<String>,
    pub dropped_duplicates: usize,
    /// Entries that could not be decoded and were set aside.
    pub quarantined_entries: usize,
    /// Where undecodable content was moved, if any was found.
    pub quarantined: Option<String>,
}

impl RecoveredQueue {
    pub fn needs_rewrite(&self) -> bool {
        !self.recovered_in_flight.is_empty()
            || self.dropped_duplicates > 0
            || self.quarantined.is_some()
    }
}

/// Loads the snapshot at `path`. Entries that fail to decode are moved to a
/// quarantine file next to it and the rest of the queue is kept; content that
/// is not a JSON array at all is moved aside whole.
pub fn read_snapshot(path: &Path) -> Result<RecoveredQueue> {
    if !path.exists() {
        return Ok(RecoveredQueue::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read queue snapshot {}", path.display()))?;

    let entries = match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => return quarantine_file(path, "not a JSON array"),
        Err(err) => return quarantine_file(path, &err.to_string()),
    };

    let mut items = Vec::with_capacity(entries.len());
    let mut rejected = Vec::new();
    for entry in entries {
        match serde_json::from_value::<QueueItem>(entry.clone()) {
            Ok(item) => items.push(item),
            Err(err) => {
                warn!("Skipping undecodable queue entry: {err}");
                rejected.push(entry);
            }
        }
    }

    let mut recovered = normalize(items);
    if !rejected.is_empty() {
        let quarantine = quarantine_path(path);
        let json = serde_json::to_vec_pretty(&rejected)
            .context("failed to encode quarantined queue entries")?;
        fs::write(&quarantine, json).with_context(|| {
            format!("failed to write quarantined entries to {}", quarantine.display())
        })?;
        error!(
            "{} queue entries in {} were unreadable; moved to {}",
            rejected.len(),
            path.display(),
            quarantine.display()
        );
        recovered.quarantined_entries = rejected.len();
        recovered.quarantined = Some(quarantine.display().to_string());
    }

    Ok(recovered)
}

fn quarantine_file(path: &Path, reason: &str) -> Result<RecoveredQueue> {
    let quarantine = quarantine_path(path);
    error!(
        "Queue snapshot {} is unreadable ({reason}); moving it to {}",
        path.display(),
        quarantine.display()
    );
    fs::rename(path, &quarantine).with_context(|| {
        format!("failed to move corrupt snapshot to {}", quarantine.display())
    })?;

    Ok(RecoveredQueue {
        quarantined: Some(quarantine.display().to_string()),
        ..RecoveredQueue::default()
    })
}

/// `<file>.corrupt-<timestamp>`, suffixed with a counter when that name is taken.
fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
    let mut candidate = path.with_extension(format!("json.corrupt-{stamp}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = path.with_extension(format!("json.corrupt-{stamp}-{counter}"));
        counter += 1;
    }
    candidate
}

/// Anything still `Uploading` cannot have finished consistently, so it goes
/// back to `Pending`. Duplicate ids keep their first occurrence.
pub fn normalize(items: Vec<QueueItem>) -> RecoveredQueue {
    let mut seen = HashSet::new();
    let mut recovered = RecoveredQueue::default();

    for mut item in items {
        if !seen.insert(item.id.clone()) {
            warn!("Dropping duplicate queue entry for session {}", item.id);
            recovered.dropped_duplicates += 1;
            continue;
        }

        match item.status {
            UploadStatus::Uploading => {
                item.status = UploadStatus::Pending;
                recovered.recovered_in_flight.push(item.id.clone());
            }
            UploadStatus::Pending | UploadStatus::Completed | UploadStatus::Failed => {}
        }
        recovered.items.push(item);
    }

    recovered
}

/// Writes the whole queue to a temporary file next to `path`, then renames it
/// over the old snapshot so readers never observe a partial write.
pub fn write_snapshot_atomic(path: &Path, items: &[QueueItem]) -> Result<()> {
    let json = serde_json::to_vec_pretty(items).context("failed to encode queue snapshot")?;

    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("snapshot path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(&json)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|err| anyhow!("failed to replace {}: {}", path.display(), err.error))?;

    Ok(())
}
