pub const MAX_BPM: f64 = 300.0;
pub const MIN_RR_MS: f64 = 300.0;
pub const MAX_RR_MS: f64 = 2000.0;

/// Converts a heart-rate sample to an inter-beat interval in milliseconds.
/// Returns `None` for physiologically implausible input.
pub fn bpm_to_rr_ms(bpm: f64) -> Option<f64> {
    if !bpm.is_finite() || bpm <= 0.0 || bpm > MAX_BPM {
        return None;
    }

    let rr_ms = 60_000.0 / bpm;
    if rr_ms.is_finite() && (MIN_RR_MS..=MAX_RR_MS).contains(&rr_ms) {
        Some(rr_ms)
    } else {
        None
    }
}

/// Accepted intervals for the recording in progress, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    accepted: Vec<f64>,
    rejected: u64,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the sample was kept.
    pub fn push_bpm(&mut self, bpm: f64) -> bool {
        match bpm_to_rr_ms(bpm) {
            Some(rr_ms) => {
                self.accepted.push(rr_ms);
                true
            }
            None => {
                self.rejected += 1;
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn into_samples(self) -> Vec<f64> {
        self.accepted
    }
}
