use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recorder::subtag;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MeasurementTag {
    Wake,
    Rest,
    Workout,
    Experiment,
    Sleep,
}

impl MeasurementTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementTag::Wake => "wake",
            MeasurementTag::Rest => "rest",
            MeasurementTag::Workout => "workout",
            MeasurementTag::Experiment => "experiment",
            MeasurementTag::Sleep => "sleep",
        }
    }

    /// Series tags are recorded as consecutive intervals that the backend
    /// accepts strictly in ascending order.
    pub fn is_series(&self) -> bool {
        match self {
            MeasurementTag::Sleep => true,
            MeasurementTag::Wake
            | MeasurementTag::Rest
            | MeasurementTag::Workout
            | MeasurementTag::Experiment => false,
        }
    }
}

impl std::fmt::Display for MeasurementTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RecordingMode {
    Single {
        tag: MeasurementTag,
        duration_minutes: u32,
        protocol_label: Option<String>,
    },
    SeriesRecording {
        interval_duration_minutes: u32,
        current_interval_number: u32,
    },
}

impl RecordingMode {
    pub fn is_series(&self) -> bool {
        matches!(self, RecordingMode::SeriesRecording { .. })
    }
}

/// One completed, validated measurement. Only the recorder builds these;
/// everything else sees them through the accessors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    id: String,
    user_id: String,
    tag: MeasurementTag,
    subtag: String,
    group_id: i64,
    duration_minutes: u32,
    recorded_at: DateTime<Utc>,
    samples: Vec<f64>,
}

impl Session {
    pub(crate) fn from_parts(
        id: String,
        user_id: String,
        tag: MeasurementTag,
        subtag: String,
        duration_minutes: u32,
        recorded_at: DateTime<Utc>,
        samples: Vec<f64>,
    ) -> Self {
        Self {
            id,
            user_id,
            tag,
            subtag,
            // Grouping ids are assigned by the backend.
            group_id: 0,
            duration_minutes,
            recorded_at,
            samples,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tag(&self) -> MeasurementTag {
        self.tag
    }

    pub fn subtag(&self) -> &str {
        &self.subtag
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Inter-beat intervals in milliseconds, in arrival order.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn is_series(&self) -> bool {
        self.tag.is_series()
    }

    /// Position within its series, when this session belongs to one.
    pub fn interval_number(&self) -> Option<u32> {
        subtag::parse_interval_number(self.tag, &self.subtag)
    }
}
