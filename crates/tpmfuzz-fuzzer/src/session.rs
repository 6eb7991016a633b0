//! Fuzz session driver.
//!
//! A [`FuzzSession`] runs ordinary test cases against a device and lets its
//! hooks turn some of their commands into fuzzing series:
//!
//! ```text
//!   SessionRunning ─────────────────────────────────────────► SessionDone
//!        │  pick a test, run it                     (deadline, run limit,
//!        ▼                                           unrecoverable device)
//!   ┌──────┐  controller selects the kind   ┌──────────────┐
//!   │ Idle │ ─────────────────────────────► │ SeriesActive │ ◄─┐ mutate, filter,
//!   └──────┘ ◄───────────────────────────── └──────────────┘ ──┘ send, observe
//!              deadline, fuzz count, early exit,
//!              transport failure: fold stats
//! ```
//!
//! One series lives entirely inside a single [`Tpm::execute`] call: the
//! pipeline re-dispatches the pristine command for as long as the
//! post-response hook asks it to. Every series runs on its own RNG seeded
//! from the session RNG, so the seed recorded in a crash artifact replays
//! the mutations of the failing series.

use std::path::PathBuf;
use std::sync::Arc;

use tpmfuzz_device::{Clock, CommandHooks, ExchangeOutcome, TpmError, Tpm, Transport};
use tpmfuzz_types::{CommandCode, ResponseCode};
use tpmfuzz_wire::{COMMAND_CODE_RANGE, Command, Parameters, Response};
use tracing::{debug, error, info, trace, warn};

use crate::controller::{ProbabilityConfig, ProbabilityController};
use crate::crash::CrashArtifact;
use crate::decompose::{ValidStructCache, decompose};
use crate::mutate::{LeafMutator, LeafMutatorConfig};
use crate::raw::fuzz_buffer;
use crate::report::FuzzReport;
use crate::rng::SimRng;
use crate::safety;
use crate::stats::{FuzzStats, StatsTable};
use crate::testcases::{CommandExecutor, TestCase};
use crate::FuzzError;

const NANOS_PER_SEC: u64 = 1_000_000_000;

// ============================================================================
// Configuration
// ============================================================================

/// Limits of one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesConfig {
    /// Wall-clock budget of a series.
    pub max_duration_ns: u64,
    /// Most dispatches per series.
    pub max_fuzz_count: u64,
    /// Progress (fraction of time or dispatches used) after which a
    /// successful response may end the series early.
    pub early_exit_min_progress: f64,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            max_duration_ns: 2 * NANOS_PER_SEC,
            max_fuzz_count: 256,
            early_exit_min_progress: 0.5,
        }
    }
}

/// How dispatches are mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationConfig {
    /// Probability that a dispatch gets only a raw mutation.
    pub raw_only_probability: f64,
    /// Fraction of raw-only mutations applied to the whole frame rather
    /// than the parameter area.
    pub whole_command_fraction: f64,
    /// Probability of a raw mutation on top of a targeted one.
    pub secondary_raw_probability: f64,
    pub max_leaves: usize,
    pub max_transfer: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        let leaves = LeafMutatorConfig::default();
        Self {
            raw_only_probability: 0.15,
            whole_command_fraction: 0.5,
            secondary_raw_probability: 0.05,
            max_leaves: leaves.max_leaves,
            max_transfer: leaves.max_transfer,
        }
    }
}

/// Configuration of a fuzz session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub seed: u64,
    pub probability: ProbabilityConfig,
    pub series: SeriesConfig,
    pub mutation: MutationConfig,
    /// Restart the device once after a transport failure.
    pub restart_on_failure: bool,
    /// Directory for crash artifacts. Artifacts are kept in memory only
    /// when unset.
    pub crash_dir: Option<PathBuf>,
    /// Only fuzz this command kind.
    pub exclusive: Option<CommandCode>,
    /// Stop after this many test runs.
    pub max_test_runs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            probability: ProbabilityConfig::default(),
            series: SeriesConfig::default(),
            mutation: MutationConfig::default(),
            restart_on_failure: true,
            crash_dir: None,
            exclusive: None,
            max_test_runs: None,
        }
    }
}

impl SessionConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_probability(mut self, probability: ProbabilityConfig) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_series(mut self, series: SeriesConfig) -> Self {
        self.series = series;
        self
    }

    pub fn with_mutation(mut self, mutation: MutationConfig) -> Self {
        self.mutation = mutation;
        self
    }

    pub fn with_restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }

    pub fn with_crash_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.crash_dir = Some(dir.into());
        self
    }

    pub fn with_exclusive(mut self, code: CommandCode) -> Self {
        self.exclusive = Some(code);
        self
    }

    pub fn with_max_test_runs(mut self, runs: u64) -> Self {
        self.max_test_runs = Some(runs);
        self
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Which counter the current dispatch was booked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Booking {
    Targeted,
    Raw,
}

/// Raw mutation deferred to the marshaled frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum FrameMutation {
    #[default]
    None,
    WholeCommand,
    Secondary,
}

/// A running series.
#[derive(Debug)]
struct Series {
    code: CommandCode,
    rng: SimRng,
    started_ns: u64,
    deadline_ns: u64,
    iterations: u64,
    stats: FuzzStats,
    booking: Option<Booking>,
    frame_mutation: FrameMutation,
}

impl Series {
    fn new(code: CommandCode, seed: u64, now_ns: u64, config: &SeriesConfig) -> Self {
        Self {
            code,
            rng: SimRng::new(seed),
            started_ns: now_ns,
            deadline_ns: now_ns.saturating_add(config.max_duration_ns),
            iterations: 0,
            stats: FuzzStats {
                series: 1,
                ..FuzzStats::default()
            },
            booking: None,
            frame_mutation: FrameMutation::None,
        }
    }

    fn seed(&self) -> u64 {
        self.rng.seed()
    }

    fn limits_reached(&self, now_ns: u64, config: &SeriesConfig) -> bool {
        now_ns >= self.deadline_ns || self.iterations >= config.max_fuzz_count
    }

    /// Fraction of the series budget used, by dispatches or by time.
    fn progress(&self, now_ns: u64, config: &SeriesConfig) -> f64 {
        let by_count = self.iterations as f64 / config.max_fuzz_count.max(1) as f64;
        let by_time = now_ns.saturating_sub(self.started_ns) as f64
            / config.max_duration_ns.max(1) as f64;
        by_count.max(by_time)
    }

    /// Decides whether a successful response ends the series early.
    fn early_exit(&mut self, now_ns: u64, config: &SeriesConfig) -> bool {
        let min = config.early_exit_min_progress;
        let progress = self.progress(now_ns, config);
        if progress <= min || min >= 1.0 {
            return false;
        }
        let odds = (progress - min) / (1.0 - min) * (0.5 + 0.5 * self.stats.failure_rate());
        self.rng.next_bool_with_probability(odds)
    }
}

/// Where the device was when the transport failed.
#[derive(Debug, Clone, Copy)]
struct FailureContext {
    code: CommandCode,
    series_seed: u64,
}

/// Fuzzing state reachable from the pipeline hooks.
#[derive(Debug)]
struct Engine {
    controller: ProbabilityController,
    mutator: LeafMutator,
    cache: ValidStructCache,
    stats: StatsTable,
    mutation: MutationConfig,
    series_config: SeriesConfig,
    series: Option<Series>,
    total_series: u64,
    /// Set when a series ran during the current test.
    series_in_test: bool,
    last_failure: Option<FailureContext>,
}

impl Engine {
    fn new(config: &SessionConfig) -> Self {
        Self {
            controller: ProbabilityController::new(config.probability)
                .with_exclusive(config.exclusive),
            mutator: LeafMutator::new(LeafMutatorConfig {
                max_leaves: config.mutation.max_leaves,
                max_transfer: config.mutation.max_transfer,
            }),
            cache: ValidStructCache::new(),
            stats: StatsTable::new(),
            mutation: config.mutation,
            series_config: config.series,
            series: None,
            total_series: 0,
            series_in_test: false,
            last_failure: None,
        }
    }

    /// Evaluates a pristine command as the start of a new series.
    fn try_start(&mut self, command: &Command, session_rng: &mut SimRng, now_ns: u64) -> bool {
        let code = command.code;
        let has_surface = !command.handles.is_empty() || !command.params.to_bytes().is_empty();
        if !has_surface {
            return false;
        }
        if !safety::is_safe(code, &command.handles) {
            trace!(command = %code, "unsafe handles, not fuzzing");
            return false;
        }

        let decomposition = decompose(command, &mut self.cache);
        self.stats.entry(code).observe_complexity(decomposition.complexity);
        if !self
            .controller
            .select_for_fuzzing(code, has_surface, &mut self.stats, session_rng)
        {
            return false;
        }

        let series = Series::new(code, session_rng.next_u64(), now_ns, &self.series_config);
        debug!(
            command = %code,
            seed = series.seed(),
            threshold = self.controller.threshold(),
            complexity = decomposition.complexity,
            "series started"
        );
        self.series = Some(series);
        self.total_series += 1;
        self.series_in_test = true;
        true
    }

    /// Mutates one dispatch of the running series.
    fn mutate(&mut self, command: &mut Command) {
        let Engine {
            mutator,
            cache,
            mutation,
            series,
            ..
        } = self;
        let Some(series) = series.as_mut() else {
            return;
        };
        series.iterations += 1;
        series.frame_mutation = FrameMutation::None;

        if series.rng.next_bool_with_probability(mutation.raw_only_probability) {
            series.booking = Some(Booking::Raw);
            series.stats.raw_mutations += 1;
            if series.rng.next_bool_with_probability(mutation.whole_command_fraction) {
                series.frame_mutation = FrameMutation::WholeCommand;
            } else {
                mutate_params_raw(command, &mut series.rng);
            }
            return;
        }

        let decomposition = decompose(command, cache);
        series.stats.observe_complexity(decomposition.complexity);
        if decomposition.is_empty() {
            series.booking = Some(Booking::Raw);
            series.stats.raw_mutations += 1;
            mutate_params_raw(command, &mut series.rng);
            return;
        }

        series.booking = Some(Booking::Targeted);
        series.stats.targeted_mutations += 1;
        let applied = mutator.mutate(
            command,
            &decomposition,
            cache,
            &mut series.stats,
            &mut series.rng,
        );
        trace!(command = %series.code, leaves = applied.len(), "targeted mutation");
        if series
            .rng
            .next_bool_with_probability(mutation.secondary_raw_probability)
        {
            series.frame_mutation = FrameMutation::Secondary;
        }
    }

    /// Applies deferred frame mutation and the raw safety check.
    fn prepare_frame(&mut self, raw: Vec<u8>) -> Option<Vec<u8>> {
        let Some(series) = self.series.as_mut() else {
            return Some(raw);
        };
        let raw = match std::mem::take(&mut series.frame_mutation) {
            FrameMutation::None => raw,
            FrameMutation::WholeCommand | FrameMutation::Secondary => {
                fuzz_buffer(&raw, &mut series.rng, true).0
            }
        };
        if safety::is_safe_raw(&raw) {
            return Some(raw);
        }
        match series.booking.take() {
            Some(Booking::Targeted) => series.stats.targeted_mutations -= 1,
            Some(Booking::Raw) => series.stats.raw_mutations -= 1,
            None => {}
        }
        series.stats.suppressed += 1;
        debug!(command = %series.code, "unsafe frame suppressed");
        None
    }

    /// Records the outcome of a dispatch. Returns true to continue.
    fn observe(&mut self, outcome: &ExchangeOutcome, now_ns: u64) -> bool {
        let config = self.series_config;
        let Some(series) = self.series.as_mut() else {
            return false;
        };
        let keep_going = match outcome {
            ExchangeOutcome::Response {
                rc, duration_ns, ..
            } => {
                series.booking = None;
                series.stats.record_response(*rc, *duration_ns);
                if series.limits_reached(now_ns, &config) {
                    false
                } else if rc.is_success() && series.early_exit(now_ns, &config) {
                    series.stats.early_exits += 1;
                    false
                } else {
                    true
                }
            }
            ExchangeOutcome::Suppressed { .. } => !series.limits_reached(now_ns, &config),
            ExchangeOutcome::Failed { code, error } => {
                if series.booking.take().is_some() {
                    series.stats.failed += 1;
                }
                series.stats.transport_failures += 1;
                self.last_failure = Some(FailureContext {
                    code: *code,
                    series_seed: series.seed(),
                });
                warn!(command = %code, seed = series.seed(), %error, "transport failed during series");
                false
            }
        };

        assert_eq!(
            series.stats.succeeded + series.stats.failed,
            series.stats.mutations(),
            "series bookkeeping out of balance for {}",
            series.code
        );
        if !keep_going {
            self.finish_series();
        }
        keep_going
    }

    /// Folds the running series into the cumulative statistics.
    fn finish_series(&mut self) {
        if let Some(series) = self.series.take() {
            debug!(
                command = %series.code,
                seed = series.seed(),
                iterations = series.iterations,
                failed = series.stats.failed,
                "series finished"
            );
            self.stats.entry(series.code).merge(&series.stats);
        }
    }
}

fn mutate_params_raw(command: &mut Command, rng: &mut SimRng) {
    let bytes = command.params.to_bytes();
    command.params = Parameters::Raw(fuzz_buffer(&bytes, rng, true).0);
}

// ============================================================================
// Pipeline Hooks
// ============================================================================

struct SessionHooks<'a> {
    engine: &'a mut Engine,
    rng: &'a mut SimRng,
    clock: &'a dyn Clock,
}

impl CommandHooks for SessionHooks<'_> {
    fn before_marshal(&mut self, command: &mut Command) -> bool {
        let continuing = self
            .engine
            .series
            .as_ref()
            .is_some_and(|series| series.code == command.code);
        if !continuing {
            debug_assert!(self.engine.series.is_none(), "series leaked across commands");
            self.engine.finish_series();
            if !self.engine.try_start(command, self.rng, self.clock.now()) {
                return false;
            }
        }
        self.engine.mutate(command);
        true
    }

    fn before_transmit(&mut self, _code: CommandCode, raw: Vec<u8>) -> Option<Vec<u8>> {
        self.engine.prepare_frame(raw)
    }

    fn after_response(&mut self, outcome: &ExchangeOutcome) -> bool {
        self.engine.observe(outcome, self.clock.now())
    }
}

/// A device seen through the session hooks.
struct HookedTpm<'a, T: Transport> {
    tpm: &'a mut Tpm<T>,
    hooks: SessionHooks<'a>,
}

impl<T: Transport> CommandExecutor for HookedTpm<'_, T> {
    fn execute(&mut self, command: Command) -> Result<Response, TpmError> {
        self.tpm.execute(command, &mut self.hooks)
    }
}

// ============================================================================
// Session
// ============================================================================

/// One fuzz session over one device.
pub struct FuzzSession {
    config: SessionConfig,
    rng: SimRng,
    engine: Engine,
    crashes: Vec<CrashArtifact>,
    restarts: u64,
    tests_run: u64,
    test_failures: u64,
    suppressed_test_errors: u64,
}

impl FuzzSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            rng: SimRng::new(config.seed),
            engine: Engine::new(&config),
            config,
            crashes: Vec::new(),
            restarts: 0,
            tests_run: 0,
            test_failures: 0,
            suppressed_test_errors: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Cumulative per-kind statistics.
    pub fn stats(&self) -> &StatsTable {
        &self.engine.stats
    }

    pub fn cache(&self) -> &ValidStructCache {
        &self.engine.cache
    }

    pub fn controller(&self) -> &ProbabilityController {
        &self.engine.controller
    }

    pub fn crashes(&self) -> &[CrashArtifact] {
        &self.crashes
    }

    /// Runs test cases until `end_ns` on the device clock.
    pub fn run<T: Transport>(
        &mut self,
        tpm: &mut Tpm<T>,
        tests: &[Box<dyn TestCase>],
        end_ns: u64,
    ) -> Result<FuzzReport, FuzzError> {
        let clock = Arc::clone(tpm.clock());
        let started_ns = clock.now();
        info!(seed = self.config.seed, tests = tests.len(), "fuzz session started");
        startup(tpm).map_err(FuzzError::Startup)?;

        let mut device_lost = false;
        while !tests.is_empty() && clock.now() < end_ns {
            if self
                .config
                .max_test_runs
                .is_some_and(|limit| self.tests_run >= limit)
            {
                break;
            }
            let test = &tests[self.rng.next_usize(tests.len())];
            let mut test_rng = self.rng.fork();
            self.engine.series_in_test = false;

            let result = {
                let mut executor = HookedTpm {
                    tpm: &mut *tpm,
                    hooks: SessionHooks {
                        engine: &mut self.engine,
                        rng: &mut self.rng,
                        clock: clock.as_ref(),
                    },
                };
                test.run(&mut executor, &mut test_rng)
            };
            self.tests_run += 1;

            match result {
                Ok(()) => {}
                Err(err) if err.is_transport() || tpm.is_dead() => {
                    self.record_crash(tpm, &err, clock.now());
                    if !self.recover(tpm) {
                        device_lost = true;
                        break;
                    }
                }
                Err(err) if self.engine.series_in_test => {
                    trace!(test = test.name(), error = %err, "test error during series suppressed");
                    self.suppressed_test_errors += 1;
                }
                Err(err) => {
                    warn!(test = test.name(), error = %err, "test failed");
                    self.test_failures += 1;
                }
            }
        }
        self.engine.finish_series();

        let report = self.report(clock.now().saturating_sub(started_ns), device_lost);
        info!(
            tests = report.tests_run,
            series = report.series,
            crashes = report.crashes.len(),
            "fuzz session finished"
        );
        Ok(report)
    }

    /// Keeps an artifact for a device failure. One that cannot be written
    /// stays in the report without a path.
    fn record_crash<T: Transport>(&mut self, tpm: &Tpm<T>, err: &TpmError, at_ns: u64) {
        let context = self.engine.last_failure.take();
        let raw = tpm.last_sent().map(<[u8]>::to_vec).unwrap_or_default();
        let command = context
            .map(|context| context.code)
            .or_else(|| {
                raw.get(COMMAND_CODE_RANGE)
                    .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                    .map(|bytes| CommandCode::new(u32::from_be_bytes(bytes)))
            })
            .unwrap_or_default();
        let mut artifact = CrashArtifact {
            command,
            series_seed: context.map(|context| context.series_seed),
            session_seed: self.config.seed,
            raw,
            error: err.to_string(),
            at_ns,
            path: None,
        };
        let sequence = self.crashes.len();
        let written = self
            .config
            .crash_dir
            .as_deref()
            .map(|dir| artifact.write_to(dir, sequence));
        match written {
            Some(Ok(path)) => {
                error!(command = %command, path = %path.display(), error = %err, "device failure recorded");
            }
            Some(Err(write_error)) => {
                error!(command = %command, error = %err, %write_error, "device failure, artifact not written");
            }
            None => error!(command = %command, error = %err, "device failure"),
        }
        self.crashes.push(artifact);
    }

    /// Restarts the device once. Returns false if it cannot be used again.
    fn recover<T: Transport>(&mut self, tpm: &mut Tpm<T>) -> bool {
        if !self.config.restart_on_failure {
            return false;
        }
        if let Err(err) = tpm.restart() {
            error!(error = %err, "device restart failed");
            return false;
        }
        if let Err(err) = startup(tpm) {
            error!(error = %err, "device did not come back after restart");
            return false;
        }
        self.restarts += 1;
        info!(restarts = self.restarts, "device restarted");
        true
    }

    fn report(&self, elapsed_ns: u64, device_lost: bool) -> FuzzReport {
        FuzzReport {
            seeds: vec![self.config.seed],
            tests_run: self.tests_run,
            test_failures: self.test_failures,
            suppressed_test_errors: self.suppressed_test_errors,
            series: self.engine.total_series,
            bypassed: self.engine.stats.totals().bypassed,
            restarts: self.restarts,
            devices_lost: u64::from(device_lost),
            elapsed_ns,
            cached_kinds: self.engine.cache.len(),
            commands: self.engine.stats.clone(),
            crashes: self.crashes.clone(),
        }
    }
}

/// Issues `Startup`, accepting a device that is already started.
fn startup<T: Transport>(tpm: &mut Tpm<T>) -> Result<(), TpmError> {
    match tpm.run(Command::startup(true)) {
        Ok(_) => Ok(()),
        Err(err)
            if err.response_code().map(ResponseCode::normalized)
                == Some(ResponseCode::INITIALIZE) =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SeriesConfig {
        SeriesConfig {
            max_duration_ns: 1_000,
            max_fuzz_count: 10,
            early_exit_min_progress: 0.5,
        }
    }

    #[test]
    fn series_limits() {
        let mut series = Series::new(CommandCode::HASH, 1, 100, &config());
        assert!(!series.limits_reached(100, &config()));
        assert!(series.limits_reached(1_100, &config()));
        series.iterations = 10;
        assert!(series.limits_reached(100, &config()));
    }

    #[test]
    fn no_early_exit_before_minimum_progress() {
        let mut series = Series::new(CommandCode::HASH, 1, 0, &config());
        series.iterations = 5;
        for _ in 0..100 {
            assert!(!series.early_exit(500, &config()));
        }
    }

    #[test]
    fn early_exit_grows_with_progress() {
        let mut series = Series::new(CommandCode::HASH, 1, 0, &config());
        series.iterations = 9;
        series.stats.failed = 10;
        series.stats.targeted_mutations = 10;
        let exits = (0..1000).filter(|_| series.early_exit(950, &config())).count();
        // progress 0.95: odds 0.9 at a failure rate of one.
        assert!(exits > 800, "exits {exits}");
    }

    #[test]
    fn progress_takes_the_larger_fraction() {
        let mut series = Series::new(CommandCode::HASH, 1, 0, &config());
        series.iterations = 2;
        assert!((series.progress(700, &config()) - 0.7).abs() < 1e-12);
        series.iterations = 8;
        assert!((series.progress(100, &config()) - 0.8).abs() < 1e-12);
    }
}
