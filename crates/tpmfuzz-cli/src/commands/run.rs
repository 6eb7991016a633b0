//! Fuzz campaign runner.
//!
//! Each thread owns one simulated device and one session. Sessions share
//! nothing while running; their reports are merged once every thread has
//! finished.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tpmfuzz_config::TpmFuzzConfig;
use tpmfuzz_device::{SimTpm, SimTpmConfig, SystemClock, Tpm};
use tpmfuzz_fuzzer::{
    FuzzReport, FuzzSession, MutationConfig, ProbabilityConfig, SeriesConfig, SessionConfig,
    testcases,
};
use tpmfuzz_types::CommandCode;
use tpmfuzz_wire::catalog;
use tracing::info;

use crate::style::{self, colors::SemanticStyle};

/// Command-line overrides for `tpmfuzz run`.
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub seed: Option<u64>,
    pub duration_secs: Option<u64>,
    pub threads: Option<usize>,
    pub exclusive: Option<String>,
    pub crash_dir: Option<PathBuf>,
    pub max_test_runs: Option<u64>,
    pub json: bool,
}

/// Runs a campaign and prints the merged report.
pub fn run(options: &RunOptions) -> Result<()> {
    let mut config = super::config::load(options.config.as_deref())?;
    apply_overrides(&mut config, options);
    config.validate().context("Invalid command-line overrides")?;

    let exclusive = config
        .session
        .exclusive
        .as_deref()
        .map(resolve_command)
        .transpose()?;
    let seed = config.session.seed.unwrap_or_else(rand::random);
    let threads = config.session.threads;

    info!(seed, threads, duration_secs = config.session.duration_secs, "starting campaign");
    let started = Instant::now();
    let reports: Vec<Result<FuzzReport>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|index| {
                let session_seed = seed.wrapping_add(index as u64);
                let config = &config;
                scope.spawn(move || run_session(config, session_seed, exclusive))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("fuzz thread panicked"))
                    .and_then(|report| report)
            })
            .collect()
    });

    let mut merged = FuzzReport::default();
    for report in reports {
        merged.merge(report?);
    }

    if options.json {
        println!("{}", merged.to_json()?);
    } else {
        print_summary(&merged, started.elapsed().as_secs_f64());
    }
    Ok(())
}

fn apply_overrides(config: &mut TpmFuzzConfig, options: &RunOptions) {
    let session = &mut config.session;
    if options.seed.is_some() {
        session.seed = options.seed;
    }
    if let Some(duration) = options.duration_secs {
        session.duration_secs = duration;
    }
    if let Some(threads) = options.threads {
        session.threads = threads;
    }
    if options.exclusive.is_some() {
        session.exclusive.clone_from(&options.exclusive);
    }
    if let Some(dir) = &options.crash_dir {
        session.crash_dir.clone_from(dir);
    }
    if options.max_test_runs.is_some() {
        session.max_test_runs = options.max_test_runs;
    }
}

fn resolve_command(name: &str) -> Result<CommandCode> {
    catalog::by_name(name).with_context(|| {
        let known: Vec<&str> = catalog::all().iter().map(|d| d.name).collect();
        format!("Unknown command '{name}'. Known commands: {}", known.join(", "))
    })
}

/// Maps the file configuration onto a session configuration.
fn session_config(config: &TpmFuzzConfig, seed: u64, exclusive: Option<CommandCode>) -> SessionConfig {
    let probability = &config.probability;
    let series = &config.series;
    let mutation = &config.mutation;
    SessionConfig {
        seed,
        probability: ProbabilityConfig {
            min: probability.min,
            base: probability.base,
            max: probability.max,
            repeat_decay: probability.repeat_decay,
        },
        series: SeriesConfig {
            max_duration_ns: series.max_duration_ms.saturating_mul(1_000_000),
            max_fuzz_count: series.max_fuzz_count,
            early_exit_min_progress: series.early_exit_min_progress,
        },
        mutation: MutationConfig {
            raw_only_probability: mutation.raw_only_probability,
            whole_command_fraction: mutation.whole_command_fraction,
            secondary_raw_probability: mutation.secondary_raw_probability,
            max_leaves: mutation.max_leaves,
            max_transfer: mutation.max_transfer,
        },
        restart_on_failure: config.session.restart_on_failure,
        crash_dir: Some(config.session.crash_dir.clone()),
        exclusive,
        max_test_runs: config.session.max_test_runs,
    }
}

fn run_session(config: &TpmFuzzConfig, seed: u64, exclusive: Option<CommandCode>) -> Result<FuzzReport> {
    let device = &config.device;
    let sim = SimTpm::new(
        SimTpmConfig::default()
            .with_seed(seed)
            .with_death_probability(device.death_probability)
            .with_hang_on_oversized(device.hang_on_oversized)
            .with_planted_defect(device.planted_defect)
            .with_lockout_threshold(device.lockout_threshold),
    );
    let mut tpm = Tpm::new(sim, Arc::new(SystemClock::new()));
    let mut session = FuzzSession::new(session_config(config, seed, exclusive));
    let end_ns = config.session.duration_secs.saturating_mul(1_000_000_000);
    session
        .run(&mut tpm, &testcases::builtin(), end_ns)
        .with_context(|| format!("Fuzz session with seed {seed} failed"))
}

fn print_summary(report: &FuzzReport, wall_secs: f64) {
    let totals = report.totals();
    println!("{}", "Fuzz campaign finished".header());
    println!(
        "  {} {}",
        "Seeds:".muted(),
        report
            .seeds
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  {} {} tests ({} failed, {} errors during series), {:.1}s",
        "Ran:".muted(),
        report.tests_run,
        report.test_failures,
        report.suppressed_test_errors,
        wall_secs
    );
    println!(
        "  {} {} series, {} mutations, {} suppressed sends, {} early exits",
        "Fuzzed:".muted(),
        report.series,
        totals.mutations(),
        totals.suppressed,
        totals.early_exits
    );
    println!();

    let mut table = style::styled_table(&[
        "Command", "Series", "Bypassed", "Targeted", "Raw", "Failed", "Auth", "Complexity",
    ]);
    for (code, stats) in report.commands.iter().filter(|(_, stats)| stats.series > 0) {
        table.add_row(vec![
            catalog::name(*code).unwrap_or("Unknown").to_string(),
            stats.series.to_string(),
            stats.bypassed.to_string(),
            stats.targeted_mutations.to_string(),
            stats.raw_mutations.to_string(),
            stats.failed.to_string(),
            stats.auth_failures.to_string(),
            stats.max_complexity.to_string(),
        ]);
    }
    println!("{table}");

    if report.crashes.is_empty() {
        println!("{} No device failures", "✓".success());
        return;
    }
    println!();
    println!(
        "{} {} device failure(s), {} restart(s), {} device(s) lost",
        "✗".error(),
        report.crashes.len(),
        report.restarts,
        report.devices_lost
    );
    for crash in &report.crashes {
        let location = crash
            .path
            .as_ref()
            .map_or_else(|| "not written".to_string(), |path| path.display().to_string());
        println!(
            "  {} {}: {}",
            catalog::name(crash.command).unwrap_or("Unknown"),
            crash.error,
            location.code()
        );
    }
    println!("{}", "Reproduce a session with:".warning());
    println!(
        "  {}",
        format!("tpmfuzz run --threads 1 --seed {}", report.crashes[0].session_seed).code()
    );
}
