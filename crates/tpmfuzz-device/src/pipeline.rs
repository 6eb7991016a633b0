//! Command pipeline with interception points.
//!
//! Every command issued by a test goes through [`Tpm::execute`]:
//!
//! ```text
//!        ┌──────────────────────────────────────────────────────┐
//!        │ pristine command (cloned per dispatch)               │
//!        └──────────────┬───────────────────────────────────────┘
//!                       ▼
//!   before_marshal(&mut Command) ── false ──► send once, no more hooks
//!                       │ true
//!                       ▼
//!   marshal ──► before_transmit(raw) ── None ──► suppressed
//!                       │ Some(raw)
//!                       ▼
//!                 transport.execute
//!                       ▼
//!   after_response(outcome) ── true ──► dispatch the pristine command again
//!                       │ false
//!                       ▼
//!                 result to the test
//! ```
//!
//! A single logical command can therefore carry a whole fuzzing series
//! without the test being aware of it.

use std::sync::Arc;

use tpmfuzz_types::{CommandCode, ResponseCode};
use tpmfuzz_wire::{Command, Response};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::{TpmError, Transport, TransportError};

/// What happened to one dispatch of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The device answered.
    Response {
        code: CommandCode,
        /// Normalized response code.
        rc: ResponseCode,
        duration_ns: u64,
    },
    /// The pre-transmit hook suppressed the send.
    Suppressed { code: CommandCode },
    /// The transport failed.
    Failed {
        code: CommandCode,
        error: TransportError,
    },
}

/// Interception points of the command pipeline.
///
/// The default implementation of every hook is a pass-through.
pub trait CommandHooks {
    /// Called with a fresh copy of the command before marshaling.
    ///
    /// May mutate the command. Returns false if the command is not being
    /// fuzzed, in which case it is sent once and no other hook is called.
    fn before_marshal(&mut self, command: &mut Command) -> bool {
        let _ = command;
        false
    }

    /// Called with the complete marshaled frame. Returning `None` suppresses
    /// the send.
    fn before_transmit(&mut self, code: CommandCode, raw: Vec<u8>) -> Option<Vec<u8>> {
        let _ = code;
        Some(raw)
    }

    /// Called after each fuzzed dispatch. Returns true to dispatch the
    /// pristine command again.
    fn after_response(&mut self, outcome: &ExchangeOutcome) -> bool {
        let _ = outcome;
        false
    }
}

/// Hooks that never intercept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl CommandHooks for NoHooks {}

/// Command executor over a transport.
pub struct Tpm<T: Transport> {
    transport: T,
    clock: Arc<dyn Clock>,
    dead: bool,
    /// Last frame handed to the transport.
    last_sent: Option<Vec<u8>>,
}

impl<T: Transport> Tpm<T> {
    pub fn new(transport: T, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            dead: false,
            last_sent: None,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Returns the last frame handed to the transport.
    pub fn last_sent(&self) -> Option<&[u8]> {
        self.last_sent.as_deref()
    }

    /// Restarts the device and clears the dead flag.
    pub fn restart(&mut self) -> Result<(), TransportError> {
        self.transport.restart()?;
        self.dead = false;
        Ok(())
    }

    /// Executes a command without interception.
    pub fn run(&mut self, command: Command) -> Result<Response, TpmError> {
        self.execute(command, &mut NoHooks)
    }

    /// Executes a command through the interception points.
    ///
    /// Returns the response of the last dispatch. An error response code is
    /// reported as [`TpmError::Protocol`].
    pub fn execute(
        &mut self,
        command: Command,
        hooks: &mut dyn CommandHooks,
    ) -> Result<Response, TpmError> {
        loop {
            let mut pending = command.clone();
            if !hooks.before_marshal(&mut pending) {
                let raw = pending.marshal();
                return self.send(command.code, &raw).map(|(response, _)| response)?;
            }

            let raw = pending.marshal();
            let Some(raw) = hooks.before_transmit(command.code, raw) else {
                debug!(command = %command.code, "send suppressed");
                if !hooks.after_response(&ExchangeOutcome::Suppressed { code: command.code }) {
                    return Err(TpmError::Suppressed(command.code));
                }
                continue;
            };

            match self.send(command.code, &raw) {
                Ok((response, duration_ns)) => {
                    let outcome = ExchangeOutcome::Response {
                        code: command.code,
                        rc: match &response {
                            Ok(response) => response.code().normalized(),
                            Err(TpmError::Protocol { rc, .. }) => rc.normalized(),
                            Err(_) => ResponseCode::FAILURE,
                        },
                        duration_ns,
                    };
                    if !hooks.after_response(&outcome) {
                        return response;
                    }
                }
                Err(err) => {
                    if let TpmError::Transport(error) = &err {
                        hooks.after_response(&ExchangeOutcome::Failed {
                            code: command.code,
                            error: error.clone(),
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Sends one frame. The outer error is a transport failure; the inner
    /// result carries the device's answer.
    fn send(
        &mut self,
        code: CommandCode,
        raw: &[u8],
    ) -> Result<(Result<Response, TpmError>, u64), TpmError> {
        if self.dead {
            return Err(TransportError::DeviceDead.into());
        }
        self.last_sent = Some(raw.to_vec());
        let start = self.clock.now();
        let frame = match self.transport.execute(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(command = %code, error = %err, "transport failure, device marked dead");
                self.dead = true;
                return Err(err.into());
            }
        };
        let duration_ns = self.clock.now().saturating_sub(start);

        let response = Response::parse(&frame).map_err(TpmError::from).and_then(|response| {
            if response.code().is_success() {
                Ok(response)
            } else {
                Err(TpmError::Protocol {
                    command: code,
                    rc: response.code(),
                })
            }
        });
        Ok((response, duration_ns))
    }
}
