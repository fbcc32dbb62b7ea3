use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

const DEBUG_SWEEP_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Fewer accepted intervals than this and the recording is refused.
    pub min_sample_count: usize,
    /// Recordings shorter than this (wall clock) are refused.
    pub min_duration_secs: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            min_sample_count: 10,
            min_duration_secs: 60,
        }
    }
}

impl RecorderSettings {
    pub fn min_duration(&self) -> Duration {
        Duration::from_secs(self.min_duration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    pub endpoint: String,
    pub sweep_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.vitalsync.invalid/v1/sessions".into(),
            sweep_interval_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

impl UploadSettings {
    /// Sweep interval, shortened when `VITALSYNC_DEBUG` is set.
    pub fn sweep_interval(&self) -> Duration {
        let debug_mode = std::env::var("VITALSYNC_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if debug_mode {
            Duration::from_secs(DEBUG_SWEEP_INTERVAL_SECS)
        } else {
            Duration::from_secs(self.sweep_interval_secs.max(1))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    recorder: RecorderSettings,
    upload: UploadSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    log::warn!(
                        "Ignoring unparsable settings at {}: {err}; using defaults",
                        path.display()
                    );
                    Settings::default()
                }
            }
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn recorder(&self) -> RecorderSettings {
        self.read().recorder.clone()
    }

    pub fn upload(&self) -> UploadSettings {
        self.read().upload.clone()
    }

    pub fn update_recorder(&self, settings: RecorderSettings) -> Result<()> {
        let mut guard = self.write();
        guard.recorder = settings;
        self.persist(&guard)
    }

    pub fn update_upload(&self, settings: UploadSettings) -> Result<()> {
        let mut guard = self.write();
        guard.upload = settings;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
