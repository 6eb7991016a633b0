//! Device error types.

use tpmfuzz_types::{CommandCode, ResponseCode};
use tpmfuzz_wire::WireError;

/// Failures of the device channel itself.
///
/// These are distinct from error responses: a transport failure means no
/// trustworthy response was received and the device must be considered dead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Underlying channel I/O failed.
    #[error("device I/O failed: {0}")]
    Io(String),

    /// The device did not answer within its timeout.
    #[error("device timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The device is dead and must be restarted before further use.
    #[error("device is dead")]
    DeviceDead,

    /// The transport cannot restart its device.
    #[error("device restart is not supported by this transport")]
    RestartUnsupported,
}

/// Errors from executing a command through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TpmError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response frame could not be parsed.
    #[error("malformed response: {0}")]
    Wire(#[from] WireError),

    /// The device rejected the command.
    #[error("{command} failed with response code {rc}")]
    Protocol { command: CommandCode, rc: ResponseCode },

    /// The send was suppressed by an interception hook.
    #[error("{0} was suppressed before transmission")]
    Suppressed(CommandCode),

    /// A test expectation did not hold.
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl TpmError {
    /// Returns true if the error means the device can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(self, TpmError::Transport(_))
    }

    /// Returns the response code of a protocol error.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            TpmError::Protocol { rc, .. } => Some(*rc),
            _ => None,
        }
    }
}
