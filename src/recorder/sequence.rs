/// Tracks the next interval number of an active series recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceTracker {
    current: u32,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self { current: 1 }
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number the next call to [`SequenceTracker::next_interval`] will hand out.
    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn next_interval(&mut self) -> u32 {
        let interval = self.current;
        self.current = self.current.saturating_add(1);
        interval
    }

    pub fn reset_series(&mut self) {
        self.current = 1;
    }
}
