//! End-of-session report.

use serde::{Deserialize, Serialize};

use crate::crash::CrashArtifact;
use crate::stats::{FuzzStats, StatsTable};

/// Summary of one or more fuzz sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuzzReport {
    /// Session seeds, one per merged session.
    pub seeds: Vec<u64>,
    pub tests_run: u64,
    /// Tests that failed outside any series.
    pub test_failures: u64,
    /// Test errors swallowed because a series ran inside the test.
    pub suppressed_test_errors: u64,
    pub series: u64,
    pub bypassed: u64,
    pub restarts: u64,
    /// Sessions that ended with an unusable device.
    pub devices_lost: u64,
    pub elapsed_ns: u64,
    /// Structure kinds with a cached valid instance.
    pub cached_kinds: usize,
    /// Cumulative statistics per command kind.
    pub commands: StatsTable,
    pub crashes: Vec<CrashArtifact>,
}

impl FuzzReport {
    /// Sums the per-kind statistics.
    pub fn totals(&self) -> FuzzStats {
        self.commands.totals()
    }

    /// Folds another session's report into this one. Elapsed time is the
    /// longest of the two since sessions run side by side.
    pub fn merge(&mut self, other: FuzzReport) {
        self.seeds.extend(other.seeds);
        self.tests_run += other.tests_run;
        self.test_failures += other.test_failures;
        self.suppressed_test_errors += other.suppressed_test_errors;
        self.series += other.series;
        self.bypassed += other.bypassed;
        self.restarts += other.restarts;
        self.devices_lost += other.devices_lost;
        self.elapsed_ns = self.elapsed_ns.max(other.elapsed_ns);
        self.cached_kinds = self.cached_kinds.max(other.cached_kinds);
        self.commands.merge(&other.commands);
        self.crashes.extend(other.crashes);
    }

    /// Renders the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use tpmfuzz_types::CommandCode;

    use super::*;

    fn report(seed: u64, series: u64) -> FuzzReport {
        let mut commands = StatsTable::new();
        let stats = commands.entry(CommandCode::HASH);
        stats.series = series;
        stats.succeeded = series * 3;
        stats.targeted_mutations = series * 3;
        FuzzReport {
            seeds: vec![seed],
            tests_run: 10,
            series,
            elapsed_ns: seed * 100,
            commands,
            ..FuzzReport::default()
        }
    }

    #[test]
    fn merge_sums_counters_and_keeps_longest_elapsed() {
        let mut merged = report(1, 2);
        merged.merge(report(5, 3));
        assert_eq!(merged.seeds, vec![1, 5]);
        assert_eq!(merged.tests_run, 20);
        assert_eq!(merged.series, 5);
        assert_eq!(merged.elapsed_ns, 500);
        let totals = merged.totals();
        assert_eq!(totals.series, 5);
        assert_eq!(totals.succeeded, 15);
    }

    #[test]
    fn json_round_trips() {
        let original = report(9, 1);
        let json = original.to_json().expect("serialize");
        assert!(json.contains("\"seeds\""));
        let back: FuzzReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, original);
    }
}
