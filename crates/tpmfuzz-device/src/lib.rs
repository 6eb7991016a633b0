//! # tpmfuzz-device: Device access for `tpmfuzz`
//!
//! - [`Transport`]: synchronous frame-in/frame-out channel to a TPM
//! - [`SimTpm`]: in-memory simulated TPM with fault injection
//! - [`Clock`]: wall-clock or simulated time
//! - [`Tpm`]: command executor exposing the [`CommandHooks`] interception
//!   points used by the fuzzer
//!
//! A transport failure (I/O error, timeout, crash) is never confused with an
//! error response: the former marks the device dead until restarted, the
//! latter is an ordinary [`TpmError::Protocol`] result.

pub mod clock;
mod error;
mod pipeline;
pub mod sim;
mod transport;

pub use clock::{Clock, SimClock, SystemClock};
pub use error::{TpmError, TransportError};
pub use pipeline::{CommandHooks, ExchangeOutcome, NoHooks, Tpm};
pub use sim::{SimTpm, SimTpmConfig};
pub use transport::Transport;
