//! tpmfuzz command line.
//!
//! Runs adaptive fuzz campaigns against simulated TPMs.
//!
//! # Quick Start
//!
//! ```bash
//! # One minute on one thread, default configuration
//! tpmfuzz run
//!
//! # Hammer a single command with a fixed seed and machine-readable output
//! tpmfuzz run --seed 42 --exclusive CreatePrimary --json
//!
//! # What can be fuzzed, and how rich each command is
//! tpmfuzz commands
//! ```

mod commands;
mod style;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// tpmfuzz - adaptive structure-aware TPM command fuzzer.
#[derive(Parser)]
#[command(name = "tpmfuzz")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fuzz campaign.
    Run {
        /// Explicit config file, layered above tpmfuzz.toml.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Session seed (random when omitted).
        #[arg(short, long)]
        seed: Option<u64>,

        /// Campaign duration in seconds.
        #[arg(short, long)]
        duration_secs: Option<u64>,

        /// Parallel sessions, each with its own simulated device.
        #[arg(short, long)]
        threads: Option<usize>,

        /// Only fuzz this command (catalogue name, e.g. NV_Write).
        #[arg(short, long)]
        exclusive: Option<String>,

        /// Directory for crash artifacts.
        #[arg(long)]
        crash_dir: Option<PathBuf>,

        /// Stop each session after this many test runs.
        #[arg(long)]
        max_test_runs: Option<u64>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List fuzzable commands.
    Commands,

    /// Show the effective configuration.
    Config {
        /// Explicit config file, layered above tpmfuzz.toml.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (toml, json).
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    style::set_no_color(cli.no_color);

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            seed,
            duration_secs,
            threads,
            exclusive,
            crash_dir,
            max_test_runs,
            json,
        } => commands::run::run(&commands::run::RunOptions {
            config,
            seed,
            duration_secs,
            threads,
            exclusive,
            crash_dir,
            max_test_runs,
            json,
        }),
        Commands::Commands => {
            commands::catalog::list();
            Ok(())
        }
        Commands::Config { config, format } => commands::config::show(config.as_deref(), &format),
    }
}
