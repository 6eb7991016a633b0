//! # tpmfuzz-fuzzer: Adaptive structure-aware command fuzzing
//!
//! The fuzzer rides on ordinary test cases. While a test runs, the
//! [`FuzzSession`] hooks into the command pipeline and occasionally turns
//! one of the test's commands into a *series*: a bounded burst of mutated
//! dispatches of that command.
//!
//! ```text
//!   TestCase ──► Tpm::execute ──► before_marshal ──► ProbabilityController
//!                                       │                 (start a series?)
//!                                       ▼
//!                               decompose ──► LeafMutator / raw bytes
//!                                       │
//!                                       ▼
//!                              before_transmit ──► safety filter ──► device
//!                                       │
//!                                       ▼
//!                               after_response ──► FuzzStats, early exit
//! ```
//!
//! - [`decompose`]: flattens a command into weighted fuzzable leaves
//! - [`mutate`]: mutates a weighted subset of those leaves
//! - [`raw`]: bit flips and resizes on plain byte buffers
//! - [`controller`]: decides which commands start a series
//! - [`safety`]: vetoes mutations that could damage the device
//! - [`session`]: drives tests, series, crash capture and restarts
//!
//! All randomness flows from one seed through [`SimRng`].

#![allow(clippy::cast_precision_loss)] // Probabilities and ratios are computed in f64
#![allow(clippy::cast_possible_truncation)] // Random sizes are bounded before narrowing
#![allow(clippy::cast_sign_loss)]

pub mod controller;
pub mod crash;
pub mod decompose;
mod error;
pub mod mutate;
pub mod raw;
mod report;
mod rng;
pub mod safety;
pub mod session;
pub mod stats;
pub mod testcases;

pub use controller::{ProbabilityConfig, ProbabilityController};
pub use crash::CrashArtifact;
pub use decompose::{Decomposition, FuzzableMember, LeafKind, LeafTarget, ValidStructCache, decompose};
pub use error::FuzzError;
pub use mutate::{LeafMutation, LeafMutator, LeafMutatorConfig};
pub use raw::{RawStrategy, fuzz_buffer};
pub use report::FuzzReport;
pub use rng::SimRng;
pub use session::{FuzzSession, MutationConfig, SeriesConfig, SessionConfig};
pub use stats::{FuzzStats, StatsTable};
pub use testcases::{CommandExecutor, TestCase};
