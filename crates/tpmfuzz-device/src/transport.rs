//! Device transport trait.
//!
//! A [`Transport`] carries one complete command frame to the device and
//! returns one complete response frame. It is strictly synchronous: the
//! call blocks until the response arrives or the device-level timeout
//! expires. Socket and character-device adapters implement the same trait
//! as the in-process [`SimTpm`](crate::SimTpm).

use crate::TransportError;

/// Synchronous request/response channel to a TPM.
pub trait Transport: Send {
    /// Sends a command frame and returns the response frame.
    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Power-cycles the device, clearing a dead state.
    fn restart(&mut self) -> Result<(), TransportError> {
        Err(TransportError::RestartUnsupported)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).execute(command)
    }

    fn restart(&mut self) -> Result<(), TransportError> {
        (**self).restart()
    }
}
