// Run duration history
// Feeds `estimated_duration_secs` in validation results

use crate::domain::ScriptReference;
use dashmap::DashMap;

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    runs: u64,
    total_ms: i64,
}

/// Mean duration of successful runs, per script reference
#[derive(Debug, Default)]
pub struct DurationHistory {
    tallies: DashMap<ScriptReference, Tally>,
}

impl DurationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, script: &ScriptReference, duration_ms: i64) {
        let mut tally = self.tallies.entry(script.clone()).or_default();
        tally.runs += 1;
        tally.total_ms += duration_ms.max(0);
    }

    /// None until the script completed at least once
    pub fn mean_secs(&self, script: &ScriptReference) -> Option<f64> {
        self.tallies
            .get(script)
            .filter(|tally| tally.runs > 0)
            .map(|tally| tally.total_ms as f64 / tally.runs as f64 / 1000.0)
    }
}
