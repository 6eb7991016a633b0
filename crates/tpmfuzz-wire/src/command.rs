//! Typed command instances.

use tpmfuzz_types::{
    CommandCode, EnumSpace, Handle, HandleType, StructKind, Structure, Value,
};

use crate::{catalog, frame_command, structure_bytes};

const ALG_RSASSA: u32 = 0x0014;
const ALG_ECDSA: u32 = 0x0018;
const ALG_KDF1_SP800_56A: u32 = 0x0020;

/// fixedTPM, fixedParent, sensitiveDataOrigin, userWithAuth and sign.
const SIGNING_KEY_ATTRIBUTES: u32 = 0x0004_0072;

/// Parameter area of a command instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameters {
    /// Typed parameter tree, marshaled on transmission.
    Structured(Structure),
    /// Already-encoded parameter bytes.
    Raw(Vec<u8>),
}

impl Parameters {
    /// Returns the encoded parameter bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Parameters::Structured(structure) => structure_bytes(structure),
            Parameters::Raw(bytes) => bytes.clone(),
        }
    }

    /// Returns the typed tree, if the parameters are still structured.
    pub fn structure(&self) -> Option<&Structure> {
        match self {
            Parameters::Structured(structure) => Some(structure),
            Parameters::Raw(_) => None,
        }
    }
}

/// A command instance: code, handle area and parameter area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub code: CommandCode,
    pub handles: Vec<Handle>,
    pub params: Parameters,
}

impl Command {
    pub fn new(code: CommandCode, handles: Vec<Handle>, params: Structure) -> Self {
        Self {
            code,
            handles,
            params: Parameters::Structured(params),
        }
    }

    /// Creates a command whose parameter area is opaque bytes.
    pub fn raw(code: CommandCode, handles: Vec<Handle>, params: Vec<u8>) -> Self {
        Self {
            code,
            handles,
            params: Parameters::Raw(params),
        }
    }

    /// Encodes the complete command frame.
    pub fn marshal(&self) -> Vec<u8> {
        frame_command(self.code, &self.handles, &self.params.to_bytes())
    }

    /// Returns the display name of the command kind.
    pub fn name(&self) -> &'static str {
        catalog::name(self.code).unwrap_or("Unknown")
    }

    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    pub fn startup(clear: bool) -> Self {
        let mut params = catalog::startup();
        params.set(
            "startupType",
            Value::enumerated(EnumSpace::StartupType, u32::from(!clear)),
        );
        Self::new(CommandCode::STARTUP, Vec::new(), params)
    }

    pub fn shutdown(clear: bool) -> Self {
        let mut params = catalog::shutdown();
        params.set(
            "shutdownType",
            Value::enumerated(EnumSpace::StartupType, u32::from(!clear)),
        );
        Self::new(CommandCode::SHUTDOWN, Vec::new(), params)
    }

    pub fn self_test(full: bool) -> Self {
        let mut params = catalog::self_test();
        params.set("fullTest", Value::enumerated(EnumSpace::YesNo, u32::from(full)));
        Self::new(CommandCode::SELF_TEST, Vec::new(), params)
    }

    pub fn get_random(count: u16) -> Self {
        let mut params = catalog::get_random();
        params.set("bytesRequested", Value::u16(count));
        Self::new(CommandCode::GET_RANDOM, Vec::new(), params)
    }

    pub fn stir_random(data: Vec<u8>) -> Self {
        let mut params = catalog::stir_random();
        params.set("inData", Value::buffer(data));
        Self::new(CommandCode::STIR_RANDOM, Vec::new(), params)
    }

    /// Reads one SHA-256 PCR.
    pub fn pcr_read(pcr: u8) -> Self {
        let mut params = catalog::pcr_read();
        params.set(
            "pcrSelectionIn",
            Value::array(StructKind::PcrSelection, vec![pcr_selection(pcr)]),
        );
        Self::new(CommandCode::PCR_READ, Vec::new(), params)
    }

    /// Extends one PCR with a SHA-256 digest.
    pub fn pcr_extend(pcr: u8, digest: Vec<u8>) -> Self {
        let mut value = StructKind::HashValue.template();
        value.set("digest", Value::buffer(digest));
        let mut params = catalog::pcr_extend();
        params.set("digests", Value::array(StructKind::HashValue, vec![value]));
        Self::new(
            CommandCode::PCR_EXTEND,
            vec![Handle::from_type_and_index(HandleType::Pcr, u32::from(pcr))],
            params,
        )
    }

    pub fn hash(data: Vec<u8>, hash_alg: u32) -> Self {
        let mut params = catalog::hash();
        params.set("data", Value::buffer(data));
        params.set("hashAlg", Value::enumerated(EnumSpace::HashAlg, hash_alg));
        Self::new(CommandCode::HASH, Vec::new(), params)
    }

    pub fn get_capability(capability: u32, property: u32, count: u32) -> Self {
        let mut params = catalog::get_capability();
        params.set(
            "capability",
            Value::enumerated(EnumSpace::Capability, capability),
        );
        params.set("property", Value::u32(property));
        params.set("propertyCount", Value::u32(count));
        Self::new(CommandCode::GET_CAPABILITY, Vec::new(), params)
    }

    pub fn nv_define_space(auth: Handle, index: Handle, data_size: u16) -> Self {
        let mut public = StructKind::NvPublic.template();
        public.set("nvIndex", Value::handle(index));
        public.set("dataSize", Value::u16(data_size));
        let mut params = catalog::nv_define_space();
        params.set("publicInfo", Value::sub(public));
        Self::new(CommandCode::NV_DEFINE_SPACE, vec![auth], params)
    }

    pub fn nv_undefine_space(auth: Handle, index: Handle) -> Self {
        Self::new(
            CommandCode::NV_UNDEFINE_SPACE,
            vec![auth, index],
            Structure::parameters(Vec::new()),
        )
    }

    pub fn nv_write(auth: Handle, index: Handle, data: Vec<u8>, offset: u16) -> Self {
        let mut params = catalog::nv_write();
        params.set("data", Value::buffer(data));
        params.set("offset", Value::u16(offset));
        Self::new(CommandCode::NV_WRITE, vec![auth, index], params)
    }

    pub fn nv_read(auth: Handle, index: Handle, size: u16, offset: u16) -> Self {
        let mut params = catalog::nv_read();
        params.set("size", Value::u16(size));
        params.set("offset", Value::u16(offset));
        Self::new(CommandCode::NV_READ, vec![auth, index], params)
    }

    /// Creates a primary storage key under `hierarchy`, RSA or ECC.
    pub fn create_primary(hierarchy: Handle, ecc: bool) -> Self {
        let mut params = catalog::create_primary();
        if ecc {
            let mut public = StructKind::Public.template();
            public.set("parameters", Value::sub(StructKind::EccParms.template()));
            params.set("inPublic", Value::sub(public));
        }
        Self::new(CommandCode::CREATE_PRIMARY, vec![hierarchy], params)
    }

    /// Creates an unrestricted primary signing key with an explicit scheme:
    /// RSASSA for RSA, ECDSA with an SP800-56A KDF for ECC.
    pub fn create_signing_primary(hierarchy: Handle, ecc: bool) -> Self {
        let mut scheme = StructKind::AsymScheme.template();
        let mut parameters = if ecc {
            scheme.set("scheme", Value::enumerated(EnumSpace::AsymScheme, ALG_ECDSA));
            let mut kdf = StructKind::KdfScheme.template();
            kdf.set("scheme", Value::enumerated(EnumSpace::KdfScheme, ALG_KDF1_SP800_56A));
            let mut parameters = StructKind::EccParms.template();
            parameters.set("kdf", Value::sub(kdf));
            parameters
        } else {
            scheme.set("scheme", Value::enumerated(EnumSpace::AsymScheme, ALG_RSASSA));
            StructKind::RsaParms.template()
        };
        parameters.set("scheme", Value::sub(scheme));

        let mut public = StructKind::Public.template();
        public.set("objectAttributes", Value::u32(SIGNING_KEY_ATTRIBUTES));
        public.set("parameters", Value::sub(parameters));
        let mut params = catalog::create_primary();
        params.set("inPublic", Value::sub(public));
        Self::new(CommandCode::CREATE_PRIMARY, vec![hierarchy], params)
    }

    pub fn flush_context(handle: Handle) -> Self {
        let mut params = catalog::flush_context();
        params.set("flushHandle", Value::handle(handle));
        Self::new(CommandCode::FLUSH_CONTEXT, Vec::new(), params)
    }

    pub fn read_public(handle: Handle) -> Self {
        Self::new(
            CommandCode::READ_PUBLIC,
            vec![handle],
            Structure::parameters(Vec::new()),
        )
    }

    pub fn dictionary_attack_lock_reset() -> Self {
        Self::new(
            CommandCode::DICTIONARY_ATTACK_LOCK_RESET,
            vec![Handle::LOCKOUT],
            Structure::parameters(Vec::new()),
        )
    }
}

/// SHA-256 selection of a single PCR in a 3-byte bitmap.
fn pcr_selection(pcr: u8) -> Structure {
    let mut bitmap = vec![0u8; 3];
    if let Some(byte) = bitmap.get_mut(usize::from(pcr / 8)) {
        *byte = 1 << (pcr % 8);
    }
    let mut selection = StructKind::PcrSelection.template();
    selection.set("pcrSelect", Value::small_buffer(bitmap));
    selection
}
