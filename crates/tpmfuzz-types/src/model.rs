//! Typed structural model of command parameters.
//!
//! A command's parameter area is a [`Structure`]: an ordered list of named
//! [`Member`]s whose [`Value`]s are either leaves (numbers, enumerations,
//! handles, buffers) or containers (substructures and arrays of
//! substructures). Length, count and union-selector fields are modeled as
//! [`Value::Derived`] members: their wire value is computed from the member
//! that follows them, so they can never disagree with the data they
//! describe.
//!
//! Every structure kind is a variant of the closed [`StructKind`]
//! enumeration and every enumeration space is a variant of [`EnumSpace`].
//! Generic code dispatches on those enums instead of inspecting types at
//! runtime.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::Handle;

/// Algorithm identifier used as the wire marker of an absent optional
/// substructure (`TPM_ALG_NULL`).
pub const ALG_NULL: u32 = 0x0010;

// ============================================================================
// Widths
// ============================================================================

/// Wire width of a fixed-width numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    U8,
    U16,
    U32,
    U64,
}

impl Width {
    /// Number of bytes on the wire.
    pub fn bytes(self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }

    /// Largest value representable at this width.
    pub fn max_value(self) -> u64 {
        match self {
            Width::U8 => u64::from(u8::MAX),
            Width::U16 => u64::from(u16::MAX),
            Width::U32 => u64::from(u32::MAX),
            Width::U64 => u64::MAX,
        }
    }
}

// ============================================================================
// Enumeration Spaces
// ============================================================================

/// Closed set of enumeration spaces used by command parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnumSpace {
    HashAlg,
    SymAlg,
    SymMode,
    AsymScheme,
    KdfScheme,
    EccCurve,
    StartupType,
    YesNo,
    Capability,
}

impl EnumSpace {
    /// Wire width of values in this space.
    pub fn width(self) -> Width {
        match self {
            EnumSpace::YesNo => Width::U8,
            EnumSpace::Capability => Width::U32,
            _ => Width::U16,
        }
    }

    /// Every valid enumerator, in ascending order.
    pub fn values(self) -> &'static [u32] {
        match self {
            EnumSpace::HashAlg => &[0x0004, 0x000B, 0x000C, 0x000D, 0x0010, 0x0012],
            EnumSpace::SymAlg => &[0x0006, 0x0010, 0x0013, 0x0026],
            EnumSpace::SymMode => &[0x0010, 0x0040, 0x0041, 0x0042, 0x0043, 0x0044],
            EnumSpace::AsymScheme => &[0x0010, 0x0014, 0x0015, 0x0016, 0x0017, 0x0018, 0x001A],
            EnumSpace::KdfScheme => &[0x0007, 0x0010, 0x0020, 0x0021, 0x0022],
            EnumSpace::EccCurve => &[0x0001, 0x0002, 0x0003, 0x0004, 0x0005, 0x0010, 0x0011, 0x0020],
            EnumSpace::StartupType => &[0x0000, 0x0001],
            EnumSpace::YesNo => &[0, 1],
            EnumSpace::Capability => &[0, 1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    /// Returns true if `value` is a valid enumerator.
    pub fn contains(self, value: u32) -> bool {
        self.values().binary_search(&value).is_ok()
    }
}

// ============================================================================
// Structure Kinds
// ============================================================================

/// Closed set of structure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StructKind {
    /// Top-level parameter area of a command.
    Parameters,
    PcrSelection,
    HashValue,
    NvPublic,
    SensitiveCreate,
    Public,
    RsaParms,
    EccParms,
    SymDefObject,
    AsymScheme,
    KdfScheme,
}

impl StructKind {
    pub const COUNT: usize = 11;

    pub const ALL: [StructKind; Self::COUNT] = [
        StructKind::Parameters,
        StructKind::PcrSelection,
        StructKind::HashValue,
        StructKind::NvPublic,
        StructKind::SensitiveCreate,
        StructKind::Public,
        StructKind::RsaParms,
        StructKind::EccParms,
        StructKind::SymDefObject,
        StructKind::AsymScheme,
        StructKind::KdfScheme,
    ];

    /// Dense index in `0..COUNT`, for kind-keyed tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns true for kinds that may be absent, encoded as [`ALG_NULL`].
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            StructKind::SymDefObject | StructKind::AsymScheme | StructKind::KdfScheme
        )
    }

    /// Selector value of a union variant.
    pub fn selector(self) -> Option<u16> {
        match self {
            StructKind::RsaParms => Some(0x0001),
            StructKind::EccParms => Some(0x0023),
            _ => None,
        }
    }

    /// Variants of the union this kind belongs to (empty for non-unions).
    pub fn union_variants(self) -> &'static [StructKind] {
        match self {
            StructKind::RsaParms | StructKind::EccParms => {
                &[StructKind::RsaParms, StructKind::EccParms]
            }
            _ => &[],
        }
    }

    /// Resolves a selector value to a variant of this kind's union.
    pub fn variant_for_selector(self, selector: u16) -> Option<StructKind> {
        self.union_variants()
            .iter()
            .copied()
            .find(|kind| kind.selector() == Some(selector))
    }

    /// Returns a well-formed default instance of this kind.
    pub fn template(self) -> Structure {
        let members = match self {
            StructKind::Parameters => Vec::new(),
            StructKind::PcrSelection => vec![
                Member::new("hash", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
                Member::new("pcrSelect", Value::small_buffer(vec![0x03, 0x00, 0x00])),
            ],
            StructKind::HashValue => vec![
                Member::new("hashAlg", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
                Member::new("digest", Value::buffer(vec![0; 32])),
            ],
            StructKind::NvPublic => vec![
                Member::new("nvIndex", Value::handle(Handle::new(0x0150_0000))),
                Member::new("nameAlg", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
                Member::new("attributes", Value::u32(0x0006_0006)),
                Member::new("authPolicy", Value::buffer(Vec::new())),
                Member::new("dataSize", Value::u16(32)),
            ],
            StructKind::SensitiveCreate => vec![
                Member::new("userAuth", Value::buffer(Vec::new())),
                Member::new("data", Value::buffer(Vec::new())),
            ],
            StructKind::Public => vec![
                Member::new("type", Value::Derived(Derived::Selector)),
                Member::new("nameAlg", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
                Member::new("objectAttributes", Value::u32(0x0003_0072)),
                Member::new("authPolicy", Value::buffer(Vec::new())),
                Member::new("parameters", Value::sub(StructKind::RsaParms.template())),
                Member::new("unique", Value::buffer(Vec::new())),
            ],
            StructKind::RsaParms => vec![
                Member::new("symmetric", Value::sub(StructKind::SymDefObject.template())),
                Member::new("scheme", Value::absent(StructKind::AsymScheme)),
                Member::new("keyBits", Value::u16(2048)),
                Member::new("exponent", Value::u32(0)),
            ],
            StructKind::EccParms => vec![
                Member::new("symmetric", Value::sub(StructKind::SymDefObject.template())),
                Member::new("scheme", Value::absent(StructKind::AsymScheme)),
                Member::new("curveID", Value::enumerated(EnumSpace::EccCurve, 0x0003)),
                Member::new("kdf", Value::absent(StructKind::KdfScheme)),
            ],
            StructKind::SymDefObject => vec![
                Member::new("algorithm", Value::enumerated(EnumSpace::SymAlg, 0x0006)),
                Member::new("keyBits", Value::u16(128)),
                Member::new("mode", Value::enumerated(EnumSpace::SymMode, 0x0043)),
            ],
            StructKind::AsymScheme => vec![
                Member::new("scheme", Value::enumerated(EnumSpace::AsymScheme, 0x0014)),
                Member::new("hashAlg", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
            ],
            StructKind::KdfScheme => vec![
                Member::new("scheme", Value::enumerated(EnumSpace::KdfScheme, 0x0007)),
                Member::new("hashAlg", Value::enumerated(EnumSpace::HashAlg, 0x000B)),
            ],
        };
        Structure::new(self, members)
    }
}

impl Display for StructKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ============================================================================
// Values
// ============================================================================

/// Metadata members whose wire value is computed from the next member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Derived {
    /// `u16` byte length of the next member's encoding.
    Size,
    /// `u32` element count of the next (array) member.
    Count,
    /// `u16` selector of the next (union) member's variant.
    Selector,
}

impl Derived {
    pub fn width(self) -> Width {
        match self {
            Derived::Size | Derived::Selector => Width::U16,
            Derived::Count => Width::U32,
        }
    }
}

/// A member value in the structural model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Fixed-width numeric. `None` is an unset field, encoded as zero.
    Fixed { width: Width, value: Option<u64> },
    /// Enumerated value (the raw integer may be outside the space after mutation).
    Enum { space: EnumSpace, value: u32 },
    /// Opaque handle reference.
    Handle(Handle),
    /// Size-prefixed byte buffer. `None` is absent, encoded as an empty buffer.
    Buffer { prefix: Width, bytes: Option<Vec<u8>> },
    /// Substructure slot. `None` is an absent optional substructure.
    Struct {
        kind: StructKind,
        body: Option<Box<Structure>>,
    },
    /// Array of substructures of one kind (its count is a preceding [`Derived::Count`]).
    Array {
        kind: StructKind,
        items: Vec<Structure>,
    },
    /// Length/count/selector metadata.
    Derived(Derived),
}

impl Value {
    pub fn u8(value: u8) -> Self {
        Value::Fixed {
            width: Width::U8,
            value: Some(u64::from(value)),
        }
    }

    pub fn u16(value: u16) -> Self {
        Value::Fixed {
            width: Width::U16,
            value: Some(u64::from(value)),
        }
    }

    pub fn u32(value: u32) -> Self {
        Value::Fixed {
            width: Width::U32,
            value: Some(u64::from(value)),
        }
    }

    pub fn u64(value: u64) -> Self {
        Value::Fixed {
            width: Width::U64,
            value: Some(value),
        }
    }

    pub fn enumerated(space: EnumSpace, value: u32) -> Self {
        Value::Enum { space, value }
    }

    pub fn handle(handle: Handle) -> Self {
        Value::Handle(handle)
    }

    /// Buffer with a 2-byte size prefix.
    pub fn buffer(bytes: Vec<u8>) -> Self {
        Value::Buffer {
            prefix: Width::U16,
            bytes: Some(bytes),
        }
    }

    /// Buffer with a 1-byte size prefix.
    pub fn small_buffer(bytes: Vec<u8>) -> Self {
        Value::Buffer {
            prefix: Width::U8,
            bytes: Some(bytes),
        }
    }

    pub fn sub(body: Structure) -> Self {
        Value::Struct {
            kind: body.kind,
            body: Some(Box::new(body)),
        }
    }

    pub fn absent(kind: StructKind) -> Self {
        Value::Struct { kind, body: None }
    }

    pub fn array(kind: StructKind, items: Vec<Structure>) -> Self {
        Value::Array { kind, items }
    }

    /// Returns the numeric value of a fixed-width or enumerated member.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Fixed { value, .. } => Some(value.unwrap_or(0)),
            Value::Enum { value, .. } => Some(u64::from(*value)),
            Value::Handle(handle) => Some(u64::from(handle.as_u32())),
            _ => None,
        }
    }

    /// Returns the bytes of a buffer member (empty when absent).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Buffer { bytes, .. } => Some(bytes.as_deref().unwrap_or(&[])),
            _ => None,
        }
    }
}

/// A named member of a structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: &'static str,
    pub value: Value,
    /// False for members that expose no usable setter.
    pub writable: bool,
}

impl Member {
    pub fn new(name: &'static str, value: Value) -> Self {
        Self {
            name,
            value,
            writable: true,
        }
    }

    pub fn read_only(name: &'static str, value: Value) -> Self {
        Self {
            name,
            value,
            writable: false,
        }
    }
}

/// An instance of a structure kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    pub kind: StructKind,
    pub members: Vec<Member>,
}

impl Structure {
    pub fn new(kind: StructKind, members: Vec<Member>) -> Self {
        Self { kind, members }
    }

    /// Creates a top-level parameter structure.
    pub fn parameters(members: Vec<Member>) -> Self {
        Self::new(StructKind::Parameters, members)
    }

    /// Looks up a member value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.members
            .iter()
            .find(|member| member.name == name)
            .map(|member| &member.value)
    }

    /// Looks up a member value by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.members
            .iter_mut()
            .find(|member| member.name == name)
            .map(|member| &mut member.value)
    }

    /// Replaces a member value by name. Returns false if no such member exists.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Resolves a path to a member.
    pub fn at(&self, path: &MemberPath) -> Option<&Member> {
        member_at(self, &path.0)
    }

    /// Resolves a path to a member, mutably.
    pub fn at_mut(&mut self, path: &MemberPath) -> Option<&mut Member> {
        member_at_mut(self, &path.0)
    }
}

fn member_at<'a>(structure: &'a Structure, steps: &[PathStep]) -> Option<&'a Member> {
    let (PathStep::Member(index), rest) = steps.split_first()? else {
        return None;
    };
    let member = structure.members.get(*index)?;
    match rest.first() {
        None => Some(member),
        Some(PathStep::Member(_)) => match &member.value {
            Value::Struct {
                body: Some(body), ..
            } => member_at(body, rest),
            _ => None,
        },
        Some(PathStep::Item(item)) => match &member.value {
            Value::Array { items, .. } => member_at(items.get(*item)?, &rest[1..]),
            _ => None,
        },
    }
}

fn member_at_mut<'a>(structure: &'a mut Structure, steps: &[PathStep]) -> Option<&'a mut Member> {
    let (PathStep::Member(index), rest) = steps.split_first()? else {
        return None;
    };
    let member = structure.members.get_mut(*index)?;
    match rest.first() {
        None => Some(member),
        Some(PathStep::Member(_)) => match &mut member.value {
            Value::Struct {
                body: Some(body), ..
            } => member_at_mut(body, rest),
            _ => None,
        },
        Some(PathStep::Item(item)) => match &mut member.value {
            Value::Array { items, .. } => member_at_mut(items.get_mut(*item)?, &rest[1..]),
            _ => None,
        },
    }
}

// ============================================================================
// Paths
// ============================================================================

/// One step of a [`MemberPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathStep {
    /// Member index within a structure (or within the body of a substructure member).
    Member(usize),
    /// Element index within an array member.
    Item(usize),
}

/// Address of a member inside a structure.
///
/// A path alternates between member indices and, for array members, item
/// indices: `[Member(4), Member(0), Member(1)]` reaches member 1 of the body
/// of member 0 of the body of member 4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemberPath(Vec<PathStep>);

impl MemberPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns a new path extended by one step.
    pub fn child(&self, step: PathStep) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        Self(steps)
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for MemberPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, step) in self.0.iter().enumerate() {
            match step {
                PathStep::Member(index) if i == 0 => write!(f, "{index}")?,
                PathStep::Member(index) => write!(f, ".{index}")?,
                PathStep::Item(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}
