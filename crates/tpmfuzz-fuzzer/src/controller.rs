//! Series start probability.
//!
//! The controller decides, each time a command is about to be marshaled,
//! whether a fuzzing series starts on it. The decision compares a uniform
//! draw against a threshold computed from the kind's history:
//!
//! ```text
//!                       first series of the kind?
//!                      /                         \
//!                   yes                           no
//!                    │                             │
//!   base + (1 - 1/(bypassed+1))·(max - base)   same kind as the last series?
//!                                               /                   \
//!                                             no                    yes
//!                                              │                     │
//!                                            base        min + (t - min)·decay
//!                                              \                     /
//!                                               adjust_threshold (series, complexity)
//! ```
//!
//! `adjust_threshold` favors kinds fuzzed less often than the population
//! average and kinds more complex than the population average. The
//! threshold never leaves `[min, max]`.

use tpmfuzz_types::CommandCode;
use tracing::trace;

use crate::rng::SimRng;
use crate::stats::{FuzzStats, StatsTable};

/// Threshold bounds and shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityConfig {
    pub min: f64,
    pub base: f64,
    pub max: f64,
    /// Fraction of the distance to `min` kept when a kind repeats.
    pub repeat_decay: f64,
}

impl Default for ProbabilityConfig {
    fn default() -> Self {
        Self {
            min: 0.02,
            base: 0.25,
            max: 0.9,
            repeat_decay: 0.5,
        }
    }
}

/// Decides which commands start a fuzzing series.
#[derive(Debug, Clone)]
pub struct ProbabilityController {
    config: ProbabilityConfig,
    threshold: f64,
    last_fuzzed: Option<CommandCode>,
    exclusive: Option<CommandCode>,
}

impl ProbabilityController {
    pub fn new(config: ProbabilityConfig) -> Self {
        Self {
            threshold: config.base,
            config,
            last_fuzzed: None,
            exclusive: None,
        }
    }

    /// Restricts fuzzing to one command kind.
    pub fn with_exclusive(mut self, code: Option<CommandCode>) -> Self {
        self.exclusive = code;
        self
    }

    pub fn config(&self) -> &ProbabilityConfig {
        &self.config
    }

    /// Threshold of the most recent decision.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn last_fuzzed(&self) -> Option<CommandCode> {
        self.last_fuzzed
    }

    /// Decides whether a series starts on `code`.
    ///
    /// `has_surface` is false for commands with neither parameters nor
    /// handles; those are never selected. A rejected candidate counts as a
    /// bypass in `table`; an accepted one becomes the last fuzzed kind.
    pub fn select_for_fuzzing(
        &mut self,
        code: CommandCode,
        has_surface: bool,
        table: &mut StatsTable,
        rng: &mut SimRng,
    ) -> bool {
        if !has_surface {
            return false;
        }
        if let Some(exclusive) = self.exclusive {
            if exclusive != code {
                return false;
            }
            self.threshold = rng.next_f64_between(self.config.min, self.config.max);
        } else {
            self.update_threshold(code, table);
        }

        let selected = rng.next_bool_with_probability(self.threshold);
        trace!(command = %code, threshold = self.threshold, selected, "fuzz decision");
        if selected {
            self.last_fuzzed = Some(code);
        } else {
            table.entry(code).bypassed += 1;
        }
        selected
    }

    fn update_threshold(&mut self, code: CommandCode, table: &StatsTable) {
        let ProbabilityConfig {
            min,
            base,
            max,
            repeat_decay,
        } = self.config;
        let empty = FuzzStats::default();
        let stats = table.get(code).unwrap_or(&empty);

        if stats.series == 0 {
            let bypassed = stats.bypassed as f64;
            self.threshold = base + (1.0 - 1.0 / (bypassed + 1.0)) * (max - base);
        } else {
            self.threshold = if self.last_fuzzed == Some(code) {
                min + (self.threshold - min) * repeat_decay
            } else {
                base
            };
            self.adjust_threshold(stats, table.average_series(), table.average_complexity());
        }
        self.threshold = self.threshold.clamp(min, max);
    }

    /// Nudges the threshold toward under-fuzzed and more complex kinds.
    pub fn adjust_threshold(
        &mut self,
        stats: &FuzzStats,
        average_series: f64,
        average_complexity: f64,
    ) {
        let series_ratio = (average_series + 1.0) / (stats.series as f64 + 1.0);
        let complexity_ratio =
            (f64::from(stats.max_complexity) + 1.0) / (average_complexity + 1.0);
        self.threshold = self.nudge(self.threshold, series_ratio);
        self.threshold = self.nudge(self.threshold, complexity_ratio);
        self.threshold = self.threshold.clamp(self.config.min, self.config.max);
    }

    /// Moves `threshold` toward `max` for ratios above one and toward `min`
    /// for ratios below one.
    fn nudge(&self, threshold: f64, ratio: f64) -> f64 {
        if !ratio.is_finite() {
            return threshold;
        }
        if ratio >= 1.0 {
            threshold + (self.config.max - threshold) * (1.0 - 1.0 / ratio)
        } else {
            self.config.min + (threshold - self.config.min) * ratio
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn controller() -> ProbabilityController {
        ProbabilityController::new(ProbabilityConfig::default())
    }

    #[test]
    fn no_surface_is_never_selected() {
        let mut controller = controller();
        let mut table = StatsTable::new();
        let mut rng = SimRng::new(0);
        for _ in 0..100 {
            assert!(!controller.select_for_fuzzing(
                CommandCode::SELF_TEST,
                false,
                &mut table,
                &mut rng
            ));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn first_series_without_bypasses_uses_base() {
        let mut controller = controller();
        let mut table = StatsTable::new();
        controller.select_for_fuzzing(CommandCode::GET_RANDOM, true, &mut table, &mut SimRng::new(1));
        assert!((controller.threshold() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn bypasses_raise_the_first_series_threshold() {
        let mut controller = controller();
        let mut table = StatsTable::new();
        table.entry(CommandCode::GET_RANDOM).bypassed = 3;
        controller.select_for_fuzzing(CommandCode::GET_RANDOM, true, &mut table, &mut SimRng::new(1));
        let expected = 0.25 + 0.75 * 0.65;
        assert!((controller.threshold() - expected).abs() < 1e-12);
    }

    #[test]
    fn rejection_counts_a_bypass_and_selection_sets_last_fuzzed() {
        let mut controller = controller();
        let mut table = StatsTable::new();
        let mut rng = SimRng::new(9);
        let mut selections = 0;
        for _ in 0..50 {
            if controller.select_for_fuzzing(CommandCode::HASH, true, &mut table, &mut rng) {
                selections += 1;
                assert_eq!(controller.last_fuzzed(), Some(CommandCode::HASH));
            }
        }
        assert_eq!(table.get(CommandCode::HASH).map(|s| s.bypassed), Some(50 - selections));
    }

    #[test]
    fn repeating_kind_decays_toward_min() {
        let mut controller = controller();
        let mut table = StatsTable::new();
        // Two kinds with identical history keep the adjustment neutral.
        for code in [CommandCode::HASH, CommandCode::GET_RANDOM] {
            let stats = table.entry(code);
            stats.series = 1;
            stats.max_complexity = 10;
        }
        controller.last_fuzzed = Some(CommandCode::HASH);
        controller.threshold = 0.5;
        controller.update_threshold(CommandCode::HASH, &table);
        assert!((controller.threshold() - (0.02 + 0.48 * 0.5)).abs() < 1e-12);

        controller.update_threshold(CommandCode::GET_RANDOM, &table);
        assert!((controller.threshold() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn under_fuzzed_and_complex_kinds_are_favored() {
        let mut controller = controller();
        controller.threshold = 0.25;
        let stats = FuzzStats {
            series: 0,
            max_complexity: 60,
            ..FuzzStats::default()
        };
        controller.adjust_threshold(&stats, 3.0, 20.0);
        assert!(controller.threshold() > 0.25);

        controller.threshold = 0.25;
        let stats = FuzzStats {
            series: 9,
            max_complexity: 5,
            ..FuzzStats::default()
        };
        controller.adjust_threshold(&stats, 3.0, 20.0);
        assert!(controller.threshold() < 0.25);
    }

    #[test]
    fn exclusive_mode_only_fuzzes_its_kind() {
        let mut controller = controller().with_exclusive(Some(CommandCode::NV_READ));
        let mut table = StatsTable::new();
        let mut rng = SimRng::new(4);
        for _ in 0..100 {
            assert!(!controller.select_for_fuzzing(CommandCode::NV_WRITE, true, &mut table, &mut rng));
            controller.select_for_fuzzing(CommandCode::NV_READ, true, &mut table, &mut rng);
            assert!((0.02..=0.9).contains(&controller.threshold()));
        }
    }

    proptest! {
        #[test]
        fn threshold_stays_within_bounds(
            start in 0.02f64..=0.9,
            series in 0u64..1000,
            complexity in 0u32..5000,
            average_series in 0.0f64..1000.0,
            average_complexity in 0.0f64..5000.0,
        ) {
            let mut controller = controller();
            controller.threshold = start;
            let stats = FuzzStats { series, max_complexity: complexity, ..FuzzStats::default() };
            controller.adjust_threshold(&stats, average_series, average_complexity);
            prop_assert!(controller.threshold() >= 0.02);
            prop_assert!(controller.threshold() <= 0.9);
        }

        #[test]
        fn decisions_keep_threshold_within_bounds(
            seed in any::<u64>(),
            picks in proptest::collection::vec(0usize..4, 1..200),
        ) {
            let codes = [
                CommandCode::HASH,
                CommandCode::GET_RANDOM,
                CommandCode::NV_READ,
                CommandCode::PCR_EXTEND,
            ];
            let mut controller = controller();
            let mut table = StatsTable::new();
            let mut rng = SimRng::new(seed);
            for pick in picks {
                let code = codes[pick];
                table.entry(code).observe_complexity(pick as u32 * 17);
                if controller.select_for_fuzzing(code, true, &mut table, &mut rng) {
                    table.entry(code).series += 1;
                }
                prop_assert!(controller.threshold() >= 0.02);
                prop_assert!(controller.threshold() <= 0.9);
            }
        }
    }
}
