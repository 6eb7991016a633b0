//! Fuzzing statistics.
//!
//! [`FuzzStats`] accumulates per command kind for the whole session. A
//! running series keeps its own working copy and folds it into the
//! cumulative entry exactly once, when the series ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tpmfuzz_types::{CommandCode, ResponseCode};

use crate::decompose::LeafKind;

/// Counters for one command kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzStats {
    /// Series started.
    pub series: u64,
    /// Times the kind was evaluated but not selected.
    pub bypassed: u64,
    /// Dispatches mutated through the structural tree.
    pub targeted_mutations: u64,
    /// Dispatches mutated only as raw bytes.
    pub raw_mutations: u64,
    /// Mutated dispatches answered with success.
    pub succeeded: u64,
    /// Mutated dispatches answered with an error or lost to the transport.
    pub failed: u64,
    pub auth_failures: u64,
    pub lockouts: u64,
    /// Sends vetoed by the safety filter.
    pub suppressed: u64,
    /// Series ended early on a successful response.
    pub early_exits: u64,
    pub transport_failures: u64,
    /// Leaf mutations by leaf kind.
    pub leaf_mutations: BTreeMap<LeafKind, u64>,
    /// Device time spent on mutated dispatches.
    pub fuzz_time_ns: u64,
    /// Largest structural complexity observed for the kind.
    pub max_complexity: u32,
}

impl FuzzStats {
    /// Total mutated dispatches.
    pub fn mutations(&self) -> u64 {
        self.targeted_mutations + self.raw_mutations
    }

    /// Fraction of mutated dispatches that failed.
    pub fn failure_rate(&self) -> f64 {
        let answered = self.succeeded + self.failed;
        if answered == 0 {
            0.0
        } else {
            self.failed as f64 / answered as f64
        }
    }

    /// Records the normalized response code of a mutated dispatch.
    pub fn record_response(&mut self, rc: ResponseCode, duration_ns: u64) {
        if rc.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if rc.is_auth_failure() {
            self.auth_failures += 1;
        }
        if rc.is_lockout() {
            self.lockouts += 1;
        }
        self.fuzz_time_ns += duration_ns;
    }

    pub fn record_leaf(&mut self, kind: LeafKind) {
        *self.leaf_mutations.entry(kind).or_default() += 1;
    }

    pub fn observe_complexity(&mut self, complexity: u32) {
        self.max_complexity = self.max_complexity.max(complexity);
    }

    /// Adds another set of counters into this one.
    pub fn merge(&mut self, other: &FuzzStats) {
        self.series += other.series;
        self.bypassed += other.bypassed;
        self.targeted_mutations += other.targeted_mutations;
        self.raw_mutations += other.raw_mutations;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.auth_failures += other.auth_failures;
        self.lockouts += other.lockouts;
        self.suppressed += other.suppressed;
        self.early_exits += other.early_exits;
        self.transport_failures += other.transport_failures;
        for (kind, count) in &other.leaf_mutations {
            *self.leaf_mutations.entry(*kind).or_default() += count;
        }
        self.fuzz_time_ns += other.fuzz_time_ns;
        self.max_complexity = self.max_complexity.max(other.max_complexity);
    }
}

/// Cumulative statistics of every command kind seen in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsTable {
    kinds: BTreeMap<CommandCode, FuzzStats>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: CommandCode) -> Option<&FuzzStats> {
        self.kinds.get(&code)
    }

    /// Returns the entry for a kind, creating it on first sight.
    pub fn entry(&mut self, code: CommandCode) -> &mut FuzzStats {
        self.kinds.entry(code).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CommandCode, &FuzzStats)> {
        self.kinds.iter()
    }

    /// Number of kinds seen.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Average number of series per seen kind.
    pub fn average_series(&self) -> f64 {
        self.average(|stats| stats.series as f64)
    }

    /// Average maximum complexity per seen kind.
    pub fn average_complexity(&self) -> f64 {
        self.average(|stats| f64::from(stats.max_complexity))
    }

    fn average(&self, f: impl Fn(&FuzzStats) -> f64) -> f64 {
        if self.kinds.is_empty() {
            return 0.0;
        }
        self.kinds.values().map(f).sum::<f64>() / self.kinds.len() as f64
    }

    /// Sum over all kinds.
    pub fn totals(&self) -> FuzzStats {
        let mut total = FuzzStats::default();
        for stats in self.kinds.values() {
            total.merge(stats);
        }
        total
    }

    pub fn merge(&mut self, other: &StatsTable) {
        for (code, stats) in &other.kinds {
            self.entry(*code).merge(stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_are_classified() {
        let mut stats = FuzzStats::default();
        stats.record_response(ResponseCode::SUCCESS, 10);
        stats.record_response(ResponseCode::AUTH_FAIL, 5);
        stats.record_response(ResponseCode::LOCKOUT, 5);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.lockouts, 1);
        assert_eq!(stats.fuzz_time_ns, 20);
        assert!((stats.failure_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn averages_cover_seen_kinds() {
        let mut table = StatsTable::new();
        assert!(table.average_series().abs() < f64::EPSILON);
        table.entry(CommandCode::GET_RANDOM).series = 3;
        table.entry(CommandCode::GET_RANDOM).observe_complexity(20);
        table.entry(CommandCode::HASH).series = 1;
        table.entry(CommandCode::HASH).observe_complexity(40);
        assert!((table.average_series() - 2.0).abs() < f64::EPSILON);
        assert!((table.average_complexity() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_adds_counters_and_keeps_max_complexity() {
        let mut a = FuzzStats {
            series: 1,
            max_complexity: 30,
            ..FuzzStats::default()
        };
        a.record_leaf(LeafKind::Buffer);
        let mut b = FuzzStats {
            series: 2,
            max_complexity: 10,
            ..FuzzStats::default()
        };
        b.record_leaf(LeafKind::Buffer);
        b.record_leaf(LeafKind::Handle);
        a.merge(&b);
        assert_eq!(a.series, 3);
        assert_eq!(a.max_complexity, 30);
        assert_eq!(a.leaf_mutations[&LeafKind::Buffer], 2);
        assert_eq!(a.leaf_mutations[&LeafKind::Handle], 1);
    }

    #[test]
    fn table_round_trips_through_json() {
        let mut table = StatsTable::new();
        table.entry(CommandCode::NV_WRITE).targeted_mutations = 4;
        let json = serde_json::to_string(&table).expect("serialize");
        let back: StatsTable = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, table);
    }
}
