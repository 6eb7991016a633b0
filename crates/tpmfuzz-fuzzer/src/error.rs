//! Fuzzer error types.

use std::path::PathBuf;

use tpmfuzz_device::TpmError;

/// Fuzzer errors.
///
/// Protocol error responses, decomposition failures and vetoed mutations
/// are absorbed by the session and never surface here. Only a startup
/// failure ends a session; an unwritable crash artifact is logged.
#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    /// The device could not be brought up at session start.
    #[error("device failed to start: {0}")]
    Startup(#[source] TpmError),

    /// A crash artifact could not be written.
    #[error("failed to write crash artifact {path}: {source}")]
    CrashArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
