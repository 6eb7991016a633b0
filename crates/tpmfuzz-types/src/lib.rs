//! # tpmfuzz-types: Core types for `tpmfuzz`
//!
//! This crate contains the protocol vocabulary shared by every other crate:
//! - Identifiers ([`CommandCode`], [`Handle`], [`HandleType`])
//! - Response codes ([`ResponseCode`]) and their normalization
//! - The typed structural model of command parameters ([`model`])
//!
//! The structural model is what the fuzzer decomposes and mutates. It is
//! closed: every structure kind and every enumeration space is a variant of
//! a Rust enum, so traversal never needs runtime type inspection.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub mod model;

pub use model::{
    Derived, EnumSpace, Member, MemberPath, PathStep, StructKind, Structure, Value, Width,
};

// ============================================================================
// Command Codes
// ============================================================================

/// Stable identifier of a command kind (`TPM_CC`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommandCode(u32);

impl CommandCode {
    pub const NV_UNDEFINE_SPACE: CommandCode = CommandCode(0x0000_0122);
    pub const NV_DEFINE_SPACE: CommandCode = CommandCode(0x0000_012A);
    pub const CREATE_PRIMARY: CommandCode = CommandCode(0x0000_0131);
    pub const NV_WRITE: CommandCode = CommandCode(0x0000_0137);
    pub const DICTIONARY_ATTACK_LOCK_RESET: CommandCode = CommandCode(0x0000_0139);
    pub const SELF_TEST: CommandCode = CommandCode(0x0000_0143);
    pub const STARTUP: CommandCode = CommandCode(0x0000_0144);
    pub const SHUTDOWN: CommandCode = CommandCode(0x0000_0145);
    pub const STIR_RANDOM: CommandCode = CommandCode(0x0000_0146);
    pub const NV_READ: CommandCode = CommandCode(0x0000_014E);
    pub const FLUSH_CONTEXT: CommandCode = CommandCode(0x0000_0165);
    pub const READ_PUBLIC: CommandCode = CommandCode(0x0000_0173);
    pub const GET_CAPABILITY: CommandCode = CommandCode(0x0000_017A);
    pub const GET_RANDOM: CommandCode = CommandCode(0x0000_017B);
    pub const HASH: CommandCode = CommandCode(0x0000_017D);
    pub const PCR_READ: CommandCode = CommandCode(0x0000_017E);
    pub const PCR_EXTEND: CommandCode = CommandCode(0x0000_0182);

    pub fn new(code: u32) -> Self {
        Self(code)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

impl From<u32> for CommandCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<CommandCode> for u32 {
    fn from(code: CommandCode) -> Self {
        code.0
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Handle namespaces, encoded in the most significant byte of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandleType {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
    AttachedComponent = 0x90,
}

impl HandleType {
    /// Every namespace, in tag order.
    pub const ALL: [HandleType; 8] = [
        HandleType::Pcr,
        HandleType::NvIndex,
        HandleType::HmacSession,
        HandleType::PolicySession,
        HandleType::Permanent,
        HandleType::Transient,
        HandleType::Persistent,
        HandleType::AttachedComponent,
    ];

    /// Returns the namespace tag byte.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Looks up a namespace by its tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.tag() == tag)
    }
}

/// Opaque 32-bit reference to a device-resident entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Handle(u32);

impl Handle {
    pub const OWNER: Handle = Handle(0x4000_0001);
    pub const NULL: Handle = Handle(0x4000_0007);
    pub const PASSWORD: Handle = Handle(0x4000_0009);
    pub const LOCKOUT: Handle = Handle(0x4000_000A);
    pub const ENDORSEMENT: Handle = Handle(0x4000_000B);
    pub const PLATFORM: Handle = Handle(0x4000_000C);
    pub const PLATFORM_NV: Handle = Handle(0x4000_000D);

    /// Reserved permanent handles, used as remapping targets.
    pub const RESERVED: [Handle; 7] = [
        Handle::OWNER,
        Handle::NULL,
        Handle::PASSWORD,
        Handle::LOCKOUT,
        Handle::ENDORSEMENT,
        Handle::PLATFORM,
        Handle::PLATFORM_NV,
    ];

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds a handle from a namespace and a 24-bit index.
    pub fn from_type_and_index(ty: HandleType, index: u32) -> Self {
        Self((u32::from(ty.tag()) << 24) | (index & 0x00FF_FFFF))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the namespace tag byte (most significant byte).
    pub fn type_tag(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the namespace if the tag byte names a known one.
    pub fn handle_type(self) -> Option<HandleType> {
        HandleType::from_tag(self.type_tag())
    }

    /// Returns the 24-bit index within the namespace.
    pub fn index(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

// ============================================================================
// Response Codes
// ============================================================================

/// Response code returned in every response header (`TPM_RC`).
///
/// **Bit Layout** (format-one codes, bit 7 set):
/// - Bits 0..=5: error number
/// - Bit 6: parameter (1) or handle/session (0) qualifier
/// - Bit 7: format flag
/// - Bits 8..=11: parameter, handle or session number
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ResponseCode(u32);

impl ResponseCode {
    pub const SUCCESS: ResponseCode = ResponseCode(0x000);

    // Format-one codes
    pub const ATTRIBUTES: ResponseCode = ResponseCode(0x082);
    pub const HASH: ResponseCode = ResponseCode(0x083);
    pub const VALUE: ResponseCode = ResponseCode(0x084);
    pub const HIERARCHY: ResponseCode = ResponseCode(0x085);
    pub const KEY_SIZE: ResponseCode = ResponseCode(0x087);
    pub const TYPE: ResponseCode = ResponseCode(0x08A);
    pub const HANDLE: ResponseCode = ResponseCode(0x08B);
    pub const RANGE: ResponseCode = ResponseCode(0x08D);
    pub const AUTH_FAIL: ResponseCode = ResponseCode(0x08E);
    pub const SCHEME: ResponseCode = ResponseCode(0x092);
    pub const SIZE: ResponseCode = ResponseCode(0x095);
    pub const SYMMETRIC: ResponseCode = ResponseCode(0x096);
    pub const TAG: ResponseCode = ResponseCode(0x097);
    pub const SELECTOR: ResponseCode = ResponseCode(0x098);
    pub const INSUFFICIENT: ResponseCode = ResponseCode(0x09A);
    pub const BAD_AUTH: ResponseCode = ResponseCode(0x0A2);
    pub const CURVE: ResponseCode = ResponseCode(0x0A6);

    // Format-zero codes
    pub const BAD_TAG: ResponseCode = ResponseCode(0x01E);
    pub const INITIALIZE: ResponseCode = ResponseCode(0x100);
    pub const FAILURE: ResponseCode = ResponseCode(0x101);
    pub const COMMAND_SIZE: ResponseCode = ResponseCode(0x142);
    pub const COMMAND_CODE: ResponseCode = ResponseCode(0x143);
    pub const NV_RANGE: ResponseCode = ResponseCode(0x146);
    pub const NV_SIZE: ResponseCode = ResponseCode(0x147);
    pub const NV_UNINITIALIZED: ResponseCode = ResponseCode(0x14A);
    pub const NV_SPACE: ResponseCode = ResponseCode(0x14B);
    pub const NV_DEFINED: ResponseCode = ResponseCode(0x14C);

    // Warnings
    pub const OBJECT_MEMORY: ResponseCode = ResponseCode(0x902);
    pub const LOCKOUT: ResponseCode = ResponseCode(0x921);

    const FMT1: u32 = 0x080;
    const PARAMETER: u32 = 0x040;
    const FMT1_MASK: u32 = 0x0BF;

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Returns true for format-one codes (bit 7 set).
    pub fn is_format_one(self) -> bool {
        self.0 & Self::FMT1 != 0
    }

    /// Strips the parameter/handle number so codes compare by meaning only.
    pub fn normalized(self) -> Self {
        if self.is_format_one() {
            Self(self.0 & Self::FMT1_MASK)
        } else {
            self
        }
    }

    /// Qualifies a format-one code with a 1-based parameter number.
    pub fn with_parameter(self, number: u8) -> Self {
        Self((self.0 & Self::FMT1_MASK) | Self::PARAMETER | (u32::from(number & 0xF) << 8))
    }

    /// Qualifies a format-one code with a 1-based handle number.
    pub fn with_handle(self, number: u8) -> Self {
        Self((self.0 & Self::FMT1_MASK & !Self::PARAMETER) | (u32::from(number & 0x7) << 8))
    }

    /// Returns true if the code reports an authorization failure.
    pub fn is_auth_failure(self) -> bool {
        matches!(self.normalized(), Self::AUTH_FAIL | Self::BAD_AUTH)
    }

    /// Returns true if the code reports dictionary-attack lockout.
    pub fn is_lockout(self) -> bool {
        self.normalized() == Self::LOCKOUT
    }
}

impl Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

impl From<u32> for ResponseCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ============================================================================
// Size Limits
// ============================================================================

/// Largest buffer a single command may transfer.
pub const MAX_TRANSFER_SIZE: usize = 1024;

/// Largest command the device accepts, header included.
pub const MAX_COMMAND_SIZE: usize = 4096;

/// Digest sizes of the supported hash algorithms (SHA-1, SHA-256, SHA-384, SHA-512).
pub const DIGEST_SIZES: [usize; 4] = [20, 32, 48, 64];

#[cfg(test)]
mod tests;
