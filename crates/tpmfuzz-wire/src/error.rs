//! Wire error types.

use tpmfuzz_types::{CommandCode, EnumSpace, StructKind};

/// Errors from marshaling, unmarshaling and framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Input ended before a field was complete.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Bytes remained after the last field of a sized region.
    #[error("{count} trailing bytes after {context}")]
    TrailingBytes { context: &'static str, count: usize },

    /// An enumerated field held a value outside its space.
    #[error("invalid {space:?} enumerator {value:#x}")]
    InvalidEnumerator { space: EnumSpace, value: u32 },

    /// A union selector named no variant of the union.
    #[error("invalid selector {selector:#06x} for {kind}")]
    InvalidSelector { kind: StructKind, selector: u16 },

    /// A length or count exceeded its limit.
    #[error("{what} of {len} exceeds limit {max}")]
    Oversized {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// The command code is not in the catalogue.
    #[error("unknown command code {0}")]
    UnknownCommand(CommandCode),

    /// The header tag is not a known structure tag.
    #[error("invalid tag {0:#06x}")]
    InvalidTag(u16),

    /// The header size disagrees with the buffer length.
    #[error("declared size {declared} does not match actual size {actual}")]
    SizeMismatch { declared: usize, actual: usize },
}
