//! # tpmfuzz-wire: Wire format for `tpmfuzz`
//!
//! - [`marshal`]: canonical big-endian encoding of the structural model
//! - [`unmarshal`]: template-driven decoding back into the model
//! - [`frame`]: 10-byte command/response headers
//! - [`catalog`]: per-command metadata (handle count, parameter template)
//! - [`command`]: typed command instances
//!
//! Encoding never fails: derived size, count and selector members are
//! computed from the data they describe, so any mutated tree has exactly
//! one encoding. Decoding is strict and reports the first malformed field.

pub mod catalog;
pub mod command;
mod error;
pub mod frame;
pub mod marshal;
pub mod unmarshal;

pub use catalog::{CommandDescriptor, descriptor};
pub use command::{Command, Parameters};
pub use error::WireError;
pub use frame::{
    BodyReader, COMMAND_CODE_RANGE, CommandHeader, FIRST_HANDLE_RANGE, HEADER_SIZE, Response,
    ResponseHeader, frame_command, frame_response,
};
pub use marshal::{encoded_len, marshal_structure, marshal_value, structure_bytes};
pub use unmarshal::{MAX_ARRAY_ITEMS, unmarshal_structure};
