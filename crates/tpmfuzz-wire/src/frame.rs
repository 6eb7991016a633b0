//! Command and response framing.
//!
//! Every command and response starts with a 10-byte header:
//!
//! ```text
//! ┌─────────┬──────────┬──────────────────────────┐
//! │ tag u16 │ size u32 │ command / response code  │
//! │         │ (total)  │ u32                      │
//! └─────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Commands continue with their handle area and then their parameter area.
//! Sessions are not modeled, so every frame carries the no-sessions tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tpmfuzz_types::{CommandCode, Handle, ResponseCode};

use crate::WireError;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 10;

/// Tag of a frame without an authorization area.
pub const TAG_NO_SESSIONS: u16 = 0x8001;

/// Tag of a frame with an authorization area.
pub const TAG_SESSIONS: u16 = 0x8002;

/// Byte range of the command code inside a command frame.
pub const COMMAND_CODE_RANGE: std::ops::Range<usize> = 6..10;

/// Byte range of the first handle inside a command frame.
pub const FIRST_HANDLE_RANGE: std::ops::Range<usize> = 10..14;

/// Frames a command from its handles and encoded parameters.
pub fn frame_command(code: CommandCode, handles: &[Handle], params: &[u8]) -> Vec<u8> {
    let size = HEADER_SIZE + handles.len() * 4 + params.len();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16(TAG_NO_SESSIONS);
    buf.put_u32(size as u32);
    buf.put_u32(code.as_u32());
    for handle in handles {
        buf.put_u32(handle.as_u32());
    }
    buf.put_slice(params);
    buf.to_vec()
}

/// Frames a response from a code and body.
pub fn frame_response(code: ResponseCode, body: &[u8]) -> Vec<u8> {
    let size = HEADER_SIZE + body.len();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16(TAG_NO_SESSIONS);
    buf.put_u32(size as u32);
    buf.put_u32(code.as_u32());
    buf.put_slice(body);
    buf.to_vec()
}

// ============================================================================
// Headers
// ============================================================================

/// Parsed command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub tag: u16,
    pub size: u32,
    pub code: CommandCode,
}

impl CommandHeader {
    /// Parses and checks the header of a complete command frame.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        let (tag, size, code) = parse_header(frame)?;
        Ok(Self {
            tag,
            size,
            code: CommandCode::new(code),
        })
    }
}

/// Parsed response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub tag: u16,
    pub size: u32,
    pub code: ResponseCode,
}

/// A parsed response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: Bytes,
}

impl Response {
    /// Parses a complete response frame.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        let (tag, size, code) = parse_header(frame)?;
        Ok(Self {
            header: ResponseHeader {
                tag,
                size,
                code: ResponseCode::new(code),
            },
            body: Bytes::copy_from_slice(&frame[HEADER_SIZE..]),
        })
    }

    /// Returns the response code.
    pub fn code(&self) -> ResponseCode {
        self.header.code
    }

    /// Returns a cursor over the body.
    pub fn reader(&self) -> BodyReader {
        BodyReader {
            inner: self.body.clone(),
        }
    }
}

fn parse_header(frame: &[u8]) -> Result<(u16, u32, u32), WireError> {
    if frame.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            needed: HEADER_SIZE,
            available: frame.len(),
        });
    }
    let mut cursor = frame;
    let tag = cursor.get_u16();
    let size = cursor.get_u32();
    let code = cursor.get_u32();
    if tag != TAG_NO_SESSIONS && tag != TAG_SESSIONS {
        return Err(WireError::InvalidTag(tag));
    }
    if size as usize != frame.len() {
        return Err(WireError::SizeMismatch {
            declared: size as usize,
            actual: frame.len(),
        });
    }
    Ok((tag, size, code))
}

/// Checked reader over a response body.
#[derive(Debug, Clone)]
pub struct BodyReader {
    inner: Bytes,
}

impl BodyReader {
    pub fn u8(&mut self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.inner.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        self.ensure(2)?;
        Ok(self.inner.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.ensure(4)?;
        Ok(self.inner.get_u32())
    }

    /// Reads a buffer with a 2-byte size prefix.
    pub fn sized(&mut self) -> Result<Bytes, WireError> {
        let len = usize::from(self.u16()?);
        self.ensure(len)?;
        Ok(self.inner.split_to(len))
    }

    pub fn remaining(&self) -> usize {
        self.inner.len()
    }

    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.inner.len() < needed {
            return Err(WireError::Truncated {
                needed,
                available: self.inner.len(),
            });
        }
        Ok(())
    }
}
