//! Command catalogue.
//!
//! One [`CommandDescriptor`] per modeled command: its code, its display
//! name, how many handles precede the parameter area, and a well-formed
//! template of the parameter area. The simulated device validates incoming
//! commands against the same templates.

use tpmfuzz_types::{
    CommandCode, Derived, EnumSpace, Handle, HandleType, Member, StructKind, Structure, Value,
};

/// Static metadata of one command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub code: CommandCode,
    pub name: &'static str,
    /// Number of handles in the handle area.
    pub handles_in: usize,
    /// Well-formed parameter area.
    pub template: Structure,
}

type Entry = (CommandCode, &'static str, usize, fn() -> Structure);

const ENTRIES: &[Entry] = &[
    (CommandCode::NV_UNDEFINE_SPACE, "NV_UndefineSpace", 2, empty),
    (CommandCode::NV_DEFINE_SPACE, "NV_DefineSpace", 1, nv_define_space),
    (CommandCode::CREATE_PRIMARY, "CreatePrimary", 1, create_primary),
    (CommandCode::NV_WRITE, "NV_Write", 2, nv_write),
    (CommandCode::DICTIONARY_ATTACK_LOCK_RESET, "DictionaryAttackLockReset", 1, empty),
    (CommandCode::SELF_TEST, "SelfTest", 0, self_test),
    (CommandCode::STARTUP, "Startup", 0, startup),
    (CommandCode::SHUTDOWN, "Shutdown", 0, shutdown),
    (CommandCode::STIR_RANDOM, "StirRandom", 0, stir_random),
    (CommandCode::NV_READ, "NV_Read", 2, nv_read),
    (CommandCode::FLUSH_CONTEXT, "FlushContext", 0, flush_context),
    (CommandCode::READ_PUBLIC, "ReadPublic", 1, empty),
    (CommandCode::GET_CAPABILITY, "GetCapability", 0, get_capability),
    (CommandCode::GET_RANDOM, "GetRandom", 0, get_random),
    (CommandCode::HASH, "Hash", 0, hash),
    (CommandCode::PCR_READ, "PCR_Read", 0, pcr_read),
    (CommandCode::PCR_EXTEND, "PCR_Extend", 1, pcr_extend),
];

/// Looks up the descriptor of a command kind.
pub fn descriptor(code: CommandCode) -> Option<CommandDescriptor> {
    ENTRIES
        .iter()
        .find(|(entry, ..)| *entry == code)
        .map(build)
}

/// Returns the display name of a command kind, if modeled.
pub fn name(code: CommandCode) -> Option<&'static str> {
    ENTRIES
        .iter()
        .find(|(entry, ..)| *entry == code)
        .map(|(_, name, ..)| *name)
}

/// Looks up a command kind by display name (case-insensitive).
pub fn by_name(name: &str) -> Option<CommandCode> {
    ENTRIES
        .iter()
        .find(|(_, entry, ..)| entry.eq_ignore_ascii_case(name))
        .map(|(code, ..)| *code)
}

/// Returns every descriptor, ordered by command code.
pub fn all() -> Vec<CommandDescriptor> {
    ENTRIES.iter().map(build).collect()
}

fn build(entry: &Entry) -> CommandDescriptor {
    let (code, name, handles_in, template) = *entry;
    CommandDescriptor {
        code,
        name,
        handles_in,
        template: template(),
    }
}

// ============================================================================
// Parameter Templates
// ============================================================================

const SHA256: u32 = 0x000B;

fn empty() -> Structure {
    Structure::parameters(Vec::new())
}

pub(crate) fn startup() -> Structure {
    Structure::parameters(vec![Member::new(
        "startupType",
        Value::enumerated(EnumSpace::StartupType, 0),
    )])
}

pub(crate) fn shutdown() -> Structure {
    Structure::parameters(vec![Member::new(
        "shutdownType",
        Value::enumerated(EnumSpace::StartupType, 0),
    )])
}

pub(crate) fn self_test() -> Structure {
    Structure::parameters(vec![Member::new(
        "fullTest",
        Value::enumerated(EnumSpace::YesNo, 1),
    )])
}

pub(crate) fn get_random() -> Structure {
    Structure::parameters(vec![Member::new("bytesRequested", Value::u16(16))])
}

pub(crate) fn stir_random() -> Structure {
    Structure::parameters(vec![Member::new("inData", Value::buffer(vec![0; 16]))])
}

pub(crate) fn pcr_read() -> Structure {
    Structure::parameters(vec![
        Member::new("count", Value::Derived(Derived::Count)),
        Member::new(
            "pcrSelectionIn",
            Value::array(
                StructKind::PcrSelection,
                vec![StructKind::PcrSelection.template()],
            ),
        ),
    ])
}

pub(crate) fn pcr_extend() -> Structure {
    Structure::parameters(vec![
        Member::new("count", Value::Derived(Derived::Count)),
        Member::new(
            "digests",
            Value::array(StructKind::HashValue, vec![StructKind::HashValue.template()]),
        ),
    ])
}

pub(crate) fn hash() -> Structure {
    Structure::parameters(vec![
        Member::new("data", Value::buffer(b"tpmfuzz".to_vec())),
        Member::new("hashAlg", Value::enumerated(EnumSpace::HashAlg, SHA256)),
        Member::new("hierarchy", Value::handle(Handle::OWNER)),
    ])
}

pub(crate) fn get_capability() -> Structure {
    Structure::parameters(vec![
        Member::new("capability", Value::enumerated(EnumSpace::Capability, 6)),
        Member::new("property", Value::u32(0x100)),
        Member::new("propertyCount", Value::u32(8)),
    ])
}

pub(crate) fn nv_define_space() -> Structure {
    Structure::parameters(vec![
        Member::new("auth", Value::buffer(Vec::new())),
        Member::new("size", Value::Derived(Derived::Size)),
        Member::new("publicInfo", Value::sub(StructKind::NvPublic.template())),
    ])
}

pub(crate) fn nv_write() -> Structure {
    Structure::parameters(vec![
        Member::new("data", Value::buffer(vec![0; 8])),
        Member::new("offset", Value::u16(0)),
    ])
}

pub(crate) fn nv_read() -> Structure {
    Structure::parameters(vec![
        Member::new("size", Value::u16(8)),
        Member::new("offset", Value::u16(0)),
    ])
}

pub(crate) fn create_primary() -> Structure {
    Structure::parameters(vec![
        Member::new("inSensitiveSize", Value::Derived(Derived::Size)),
        Member::new(
            "inSensitive",
            Value::sub(StructKind::SensitiveCreate.template()),
        ),
        Member::new("inPublicSize", Value::Derived(Derived::Size)),
        Member::new("inPublic", Value::sub(StructKind::Public.template())),
        Member::new("outsideInfo", Value::buffer(Vec::new())),
        Member::new("count", Value::Derived(Derived::Count)),
        Member::new(
            "creationPCR",
            Value::array(StructKind::PcrSelection, Vec::new()),
        ),
    ])
}

pub(crate) fn flush_context() -> Structure {
    Structure::parameters(vec![Member::new(
        "flushHandle",
        Value::handle(Handle::from_type_and_index(HandleType::Transient, 0)),
    )])
}
