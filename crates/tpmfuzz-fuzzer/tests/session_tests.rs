//! End-to-end fuzz sessions against the simulated device.
//!
//! Every session here runs on a `SimClock`, so a seed fully determines the
//! run.

use std::sync::Arc;

use tpmfuzz_device::{SimClock, SimTpm, SimTpmConfig, Tpm, TpmError};
use tpmfuzz_fuzzer::testcases::{self, HashTest, NvLifecycleTest, PrimaryObjectTest};
use tpmfuzz_fuzzer::{
    CommandExecutor, FuzzReport, FuzzSession, LeafKind, SeriesConfig, SessionConfig, SimRng,
    TestCase,
};
use tpmfuzz_types::{CommandCode, StructKind};
use tpmfuzz_wire::Command;

const MINUTE_NS: u64 = 60 * 1_000_000_000;
const HOUR_NS: u64 = 60 * MINUTE_NS;

fn device(config: SimTpmConfig) -> Tpm<SimTpm> {
    let clock = SimClock::new();
    let sim = SimTpm::new(config).with_clock(clock.clone());
    Tpm::new(sim, Arc::new(clock))
}

fn run(config: SessionConfig, device_config: SimTpmConfig, tests: &[Box<dyn TestCase>]) -> FuzzReport {
    let mut tpm = device(device_config);
    let mut session = FuzzSession::new(config);
    session.run(&mut tpm, tests, HOUR_NS).expect("session runs")
}

fn assert_balanced(report: &FuzzReport) {
    for (code, stats) in report.commands.iter() {
        assert_eq!(
            stats.succeeded + stats.failed,
            stats.targeted_mutations + stats.raw_mutations,
            "unbalanced counters for {code}"
        );
    }
}

/// Fails on every run without issuing anything the session fuzzes.
struct AlwaysFails;

impl TestCase for AlwaysFails {
    fn name(&self) -> &'static str {
        "always-fails"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, _rng: &mut SimRng) -> Result<(), TpmError> {
        tpm.execute(Command::get_random(4))?;
        Err(TpmError::Assertion("expected".to_string()))
    }
}

#[test]
fn test_builtin_library_keeps_counters_balanced() {
    let config = SessionConfig::default().with_seed(7).with_max_test_runs(150);
    let report = run(config, SimTpmConfig::default().with_seed(7), &testcases::builtin());

    assert_eq!(report.tests_run, 150);
    assert!(report.series > 0, "no series started");
    assert!(report.crashes.is_empty());
    assert_eq!(report.devices_lost, 0);
    assert_eq!(report.totals().series, report.series);
    assert_balanced(&report);
}

#[test]
fn test_same_seed_same_report() {
    let config = SessionConfig::default().with_seed(42).with_max_test_runs(60);
    let first = run(config.clone(), SimTpmConfig::default().with_seed(3), &testcases::builtin());
    let second = run(config, SimTpmConfig::default().with_seed(3), &testcases::builtin());
    assert_eq!(first, second);
}

#[test]
fn test_series_stops_at_max_fuzz_count() {
    let config = SessionConfig::default()
        .with_seed(11)
        .with_exclusive(CommandCode::HASH)
        .with_series(SeriesConfig {
            max_duration_ns: MINUTE_NS,
            max_fuzz_count: 5,
            early_exit_min_progress: 1.0,
        })
        .with_max_test_runs(40);
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(HashTest)];
    let report = run(config, SimTpmConfig::default(), &tests);

    let stats = report.commands.get(CommandCode::HASH).expect("hash was seen");
    assert!(stats.series > 0);
    assert_eq!(stats.series, report.series);
    // Vetoed sends still use up an iteration.
    assert_eq!(
        stats.targeted_mutations + stats.raw_mutations + stats.suppressed,
        5 * stats.series
    );
    assert_eq!(stats.early_exits, 0);
    assert_balanced(&report);
}

#[test]
fn test_failures_outside_series_are_reported() {
    let config = SessionConfig::default()
        .with_seed(5)
        .with_exclusive(CommandCode::NV_WRITE)
        .with_max_test_runs(20);
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(AlwaysFails)];
    let report = run(config, SimTpmConfig::default(), &tests);

    assert_eq!(report.series, 0);
    assert_eq!(report.test_failures, 20);
    assert_eq!(report.suppressed_test_errors, 0);
}

#[test]
fn test_planted_defect_is_captured_and_device_restarted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SessionConfig::default()
        .with_seed(1)
        .with_exclusive(CommandCode::CREATE_PRIMARY)
        .with_crash_dir(dir.path())
        .with_max_test_runs(400);
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(PrimaryObjectTest)];
    let report = run(config, SimTpmConfig::default().with_planted_defect(true), &tests);

    assert!(!report.crashes.is_empty(), "planted defect never triggered");
    assert_eq!(report.devices_lost, 0);
    assert_eq!(report.restarts, report.crashes.len() as u64);

    let crash = &report.crashes[0];
    assert_eq!(crash.command, CommandCode::CREATE_PRIMARY);
    assert!(crash.series_seed.is_some());
    assert_eq!(crash.session_seed, 1);
    assert!(!crash.raw.is_empty());
    let path = crash.path.as_ref().expect("artifact written");
    assert!(path.starts_with(dir.path()));
    let text = std::fs::read_to_string(path).expect("artifact readable");
    assert!(text.contains("CreatePrimary"));

    let stats = report.commands.get(CommandCode::CREATE_PRIMARY).expect("stats");
    assert_eq!(stats.transport_failures, report.crashes.len() as u64);
    assert_balanced(&report);
}

#[test]
fn test_unwritable_crash_dir_does_not_end_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"file").expect("write blocker");
    let config = SessionConfig::default()
        .with_seed(1)
        .with_exclusive(CommandCode::CREATE_PRIMARY)
        .with_crash_dir(&blocker)
        .with_max_test_runs(400);
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(PrimaryObjectTest)];
    let report = run(config, SimTpmConfig::default().with_planted_defect(true), &tests);

    assert!(!report.crashes.is_empty(), "planted defect never triggered");
    assert!(report.crashes.iter().all(|crash| crash.path.is_none()));
    assert_eq!(report.restarts, report.crashes.len() as u64);
    assert_eq!(report.devices_lost, 0);
    assert_eq!(report.tests_run, 400);
}

#[test]
fn test_device_lost_without_restart() {
    let config = SessionConfig::default()
        .with_seed(1)
        .with_exclusive(CommandCode::CREATE_PRIMARY)
        .with_restart_on_failure(false)
        .with_max_test_runs(400);
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(PrimaryObjectTest)];
    let report = run(config, SimTpmConfig::default().with_planted_defect(true), &tests);

    assert_eq!(report.crashes.len(), 1);
    assert_eq!(report.devices_lost, 1);
    assert_eq!(report.restarts, 0);
    assert!(report.tests_run < 400);
}

#[test]
fn test_optional_substructures_are_revived_during_a_session() {
    let mut tpm = device(SimTpmConfig::default());
    let mut session = FuzzSession::new(
        SessionConfig::default()
            .with_seed(3)
            .with_exclusive(CommandCode::CREATE_PRIMARY)
            .with_max_test_runs(300),
    );
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(PrimaryObjectTest)];
    let report = session.run(&mut tpm, &tests, HOUR_NS).expect("session runs");

    // Signing keys carry a scheme and a KDF; storage keys leave both absent.
    assert!(session.cache().get(StructKind::AsymScheme).is_some());
    assert!(session.cache().get(StructKind::KdfScheme).is_some());
    let stats = report.commands.get(CommandCode::CREATE_PRIMARY).expect("stats");
    let revived = stats
        .leaf_mutations
        .get(&LeafKind::AbsentStruct)
        .copied()
        .unwrap_or(0);
    assert!(revived > 0, "no absent substructure was revived");
    assert_balanced(&report);
}

#[test]
fn test_unsafe_frames_are_never_sent() {
    let mut tpm = device(SimTpmConfig::default());
    let mut session = FuzzSession::new(
        SessionConfig::default()
            .with_seed(9)
            .with_exclusive(CommandCode::NV_DEFINE_SPACE)
            .with_max_test_runs(150),
    );
    let tests: Vec<Box<dyn TestCase>> = vec![Box::new(NvLifecycleTest)];
    let report = session.run(&mut tpm, &tests, HOUR_NS).expect("session runs");

    let stats = report
        .commands
        .get(CommandCode::NV_DEFINE_SPACE)
        .expect("NV_DefineSpace was fuzzed");
    assert!(stats.series > 0);
    assert!(stats.suppressed > 0, "no frame was vetoed");
    // Vetoed sends are rolled back, so they never show up as answered.
    assert_eq!(
        stats.succeeded + stats.failed,
        stats.targeted_mutations + stats.raw_mutations
    );
    assert_eq!(tpm.transport().privileged_defines(), 0);
}

#[test]
fn test_session_stops_at_deadline() {
    let mut tpm = device(SimTpmConfig::default());
    let mut session = FuzzSession::new(SessionConfig::default().with_seed(2));
    let report = session
        .run(&mut tpm, &testcases::builtin(), 0)
        .expect("session runs");
    assert_eq!(report.tests_run, 0);
    assert_eq!(report.series, 0);
}

#[test]
fn test_dead_device_at_startup_is_an_error() {
    let mut tpm = device(SimTpmConfig::default().with_death_probability(1.0));
    let mut session = FuzzSession::new(SessionConfig::default());
    let result = session.run(&mut tpm, &testcases::builtin(), MINUTE_NS);
    assert!(result.is_err());
}
