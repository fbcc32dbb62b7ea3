//! Subtag grammar. Every tag has exactly one way of spelling its subtag, so
//! the backend can group and order sessions without extra metadata.

use crate::models::MeasurementTag;

pub const MAX_LABEL_LEN: usize = 32;

const INTERVAL_MARKER: &str = "_interval_";

/// Context that feeds into the subtag besides the tag itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtagContext {
    pub paired: bool,
    pub interval_number: Option<u32>,
    pub protocol_label: Option<String>,
}

pub fn build_subtag(tag: MeasurementTag, context: &SubtagContext) -> String {
    let variant = if context.paired { "paired" } else { "single" };

    match tag {
        MeasurementTag::Wake => "wake_single".to_string(),
        MeasurementTag::Rest | MeasurementTag::Workout => format!("{}_{variant}", tag.as_str()),
        MeasurementTag::Experiment => {
            let label = context.protocol_label.as_deref().and_then(normalize_label);
            match (label, context.paired) {
                (Some(label), true) => format!("experiment_{label}_paired"),
                (Some(label), false) => format!("experiment_{label}"),
                (None, _) => "experiment_unlabeled".to_string(),
            }
        }
        MeasurementTag::Sleep => {
            let interval = context.interval_number.unwrap_or(1).max(1);
            format!("{}{INTERVAL_MARKER}{interval}", tag.as_str())
        }
    }
}

/// Lowercases the label and collapses anything that is not an ASCII
/// alphanumeric into single underscores. Returns `None` if nothing survives.
pub fn normalize_label(raw: &str) -> Option<String> {
    let mut normalized = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_separator = false;
            normalized.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    normalized.truncate(MAX_LABEL_LEN);
    let trimmed = normalized.trim_end_matches('_');

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn parse_interval_number(tag: MeasurementTag, subtag: &str) -> Option<u32> {
    if !tag.is_series() {
        return None;
    }

    subtag
        .strip_prefix(tag.as_str())?
        .strip_prefix(INTERVAL_MARKER)?
        .parse::<u32>()
        .ok()
        .filter(|interval| *interval > 0)
}
