//! Per-command handlers of the simulated device.

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tpmfuzz_types::{Handle, HandleType, ResponseCode, StructKind, Structure, Value};
use tpmfuzz_wire::structure_bytes;

use super::{Fail, NvIndex, PCR_COUNT, Reply, SimTpm};

const SHA1: u64 = 0x0004;
const SHA256: u64 = 0x000B;
const SHA384: u64 = 0x000C;
const SHA512: u64 = 0x000D;
const SM3_256: u64 = 0x0012;

const AES: u64 = 0x0006;
const CFB: u64 = 0x0043;
const NIST_P256: u64 = 0x0003;
const NIST_P384: u64 = 0x0004;

const RSA_SCHEMES: &[u64] = &[0x0014, 0x0015, 0x0016, 0x0017];
const ECC_SCHEMES: &[u64] = &[0x0018, 0x001A];
const ECC_KDFS: &[u64] = &[0x0020, 0x0021, 0x0022];

/// `TPMA_OBJECT_RESTRICTED`
const RESTRICTED: u64 = 0x0001_0000;

const MAX_RANDOM: usize = 64;
const MAX_STIR: usize = 128;
const MAX_DIGEST_BUFFER: usize = 1024;
const MAX_NV_BUFFER: usize = 1024;
const MAX_NV_INDEX_SIZE: usize = 2048;
const MAX_NV_INDICES: usize = 8;
const NV_CAPACITY: usize = 4096;
const MAX_OBJECTS: usize = 3;
const MAX_AUTH: usize = 64;
const MAX_UNIQUE: usize = 512;

const TPM_PT_FIXED: u32 = 0x100;
const TPM_PT_COUNT: u32 = 48;
const MAX_CAP_PROPERTIES: u32 = 8;

/// `TPMA_NV_PLATFORMCREATE`
const NV_PLATFORM_CREATE: u64 = 0x4000_0000;

// ============================================================================
// Parameter Access
// ============================================================================

// Parameters were decoded against the catalogue template, so a missing
// member only occurs for absent optional data and reads as zero or empty.

fn number(structure: &Structure, name: &str) -> u64 {
    structure.get(name).and_then(Value::as_u64).unwrap_or(0)
}

fn data<'a>(structure: &'a Structure, name: &str) -> &'a [u8] {
    structure.get(name).and_then(Value::as_bytes).unwrap_or(&[])
}

fn body<'a>(structure: &'a Structure, name: &str) -> Option<&'a Structure> {
    match structure.get(name) {
        Some(Value::Struct {
            body: Some(body), ..
        }) => Some(body),
        _ => None,
    }
}

fn items<'a>(structure: &'a Structure, name: &str) -> &'a [Structure] {
    match structure.get(name) {
        Some(Value::Array { items, .. }) => items,
        _ => &[],
    }
}

fn handle(structure: &Structure, name: &str) -> Handle {
    match structure.get(name) {
        Some(Value::Handle(handle)) => *handle,
        _ => Handle::NULL,
    }
}

fn digest_size(alg: u64) -> Option<usize> {
    match alg {
        SHA1 => Some(20),
        SHA256 | SM3_256 => Some(32),
        SHA384 => Some(48),
        SHA512 => Some(64),
        _ => None,
    }
}

fn digest(alg: u64, input: &[&[u8]]) -> Option<Vec<u8>> {
    fn run<D: Digest>(input: &[&[u8]]) -> Vec<u8> {
        let mut hasher = D::new();
        for chunk in input {
            hasher.update(*chunk);
        }
        hasher.finalize().to_vec()
    }
    match alg {
        SHA256 => Some(run::<Sha256>(input)),
        SHA384 => Some(run::<Sha384>(input)),
        SHA512 => Some(run::<Sha512>(input)),
        _ => None,
    }
}

fn is_hierarchy(handle: Handle) -> bool {
    matches!(
        handle,
        Handle::OWNER | Handle::ENDORSEMENT | Handle::PLATFORM | Handle::NULL
    )
}

fn put_sized(body: &mut BytesMut, bytes: &[u8]) {
    body.put_u16(bytes.len() as u16);
    body.put_slice(bytes);
}

// ============================================================================
// Handlers
// ============================================================================

impl SimTpm {
    fn check_lockout(&self) -> Result<(), Fail> {
        if self.persistent.failed_tries >= self.config.lockout_threshold {
            return Err(ResponseCode::LOCKOUT.into());
        }
        Ok(())
    }

    /// Rejects an authorization, counting it toward lockout when the
    /// presented handle is a real authority.
    fn reject_auth(&mut self, presented: Handle, position: u8) -> Fail {
        if presented.handle_type() == Some(HandleType::Permanent)
            || presented.handle_type() == Some(HandleType::NvIndex)
        {
            self.persistent.failed_tries += 1;
            ResponseCode::AUTH_FAIL.with_handle(position).into()
        } else {
            ResponseCode::HANDLE.with_handle(position).into()
        }
    }

    pub(super) fn startup(&mut self, params: &Structure) -> Reply {
        if self.volatile.started {
            return Err(ResponseCode::INITIALIZE.into());
        }
        let resume = number(params, "startupType") == 1;
        if resume && !self.volatile.orderly_shutdown {
            return Err(ResponseCode::VALUE.with_parameter(1).into());
        }
        self.volatile.started = true;
        self.volatile.orderly_shutdown = false;
        Ok(Vec::new())
    }

    pub(super) fn shutdown(&mut self) -> Reply {
        self.volatile.orderly_shutdown = true;
        Ok(Vec::new())
    }

    pub(super) fn get_random(&mut self, params: &Structure) -> Reply {
        let count = (number(params, "bytesRequested") as usize).min(MAX_RANDOM);
        let mut bytes = vec![0u8; count];
        self.rng.fill_bytes(&mut bytes);
        let mut body = BytesMut::new();
        put_sized(&mut body, &bytes);
        Ok(body.to_vec())
    }

    pub(super) fn stir_random(&mut self, params: &Structure) -> Reply {
        if data(params, "inData").len() > MAX_STIR {
            return Err(ResponseCode::SIZE.with_parameter(1).into());
        }
        Ok(Vec::new())
    }

    pub(super) fn pcr_read(&mut self, params: &Structure) -> Reply {
        let selections = items(params, "pcrSelectionIn");
        let mut body = BytesMut::new();
        let mut digests = Vec::new();
        body.put_u32(self.volatile.pcr_update_counter);
        body.put_u32(selections.len() as u32);
        for selection in selections {
            let alg = number(selection, "hash");
            let bitmap = data(selection, "pcrSelect");
            if !(3..=4).contains(&bitmap.len()) {
                return Err(ResponseCode::VALUE.with_parameter(1).into());
            }
            body.put_u16(alg as u16);
            body.put_u8(bitmap.len() as u8);
            for (i, byte) in bitmap.iter().enumerate() {
                let mut echoed = 0u8;
                for bit in 0..8 {
                    let pcr = i * 8 + bit;
                    if alg == SHA256 && byte & (1 << bit) != 0 && pcr < PCR_COUNT && digests.len() < 8
                    {
                        echoed |= 1 << bit;
                        digests.push(self.volatile.pcrs[pcr]);
                    }
                }
                body.put_u8(echoed);
            }
        }
        body.put_u32(digests.len() as u32);
        for value in &digests {
            put_sized(&mut body, value);
        }
        Ok(body.to_vec())
    }

    pub(super) fn pcr_extend(&mut self, pcr: Handle, params: &Structure) -> Reply {
        let index = pcr.index() as usize;
        if pcr.handle_type() != Some(HandleType::Pcr) || index >= PCR_COUNT {
            return Err(ResponseCode::VALUE.with_handle(1).into());
        }
        for value in items(params, "digests") {
            let alg = number(value, "hashAlg");
            let bytes = data(value, "digest");
            let expected = digest_size(alg).ok_or(ResponseCode::HASH.with_parameter(1))?;
            if bytes.len() != expected {
                return Err(ResponseCode::SIZE.with_parameter(1).into());
            }
            if alg == SHA256 {
                if let Some(extended) = digest(SHA256, &[&self.volatile.pcrs[index], bytes]) {
                    self.volatile.pcrs[index].copy_from_slice(&extended);
                }
            }
        }
        self.volatile.pcr_update_counter = self.volatile.pcr_update_counter.wrapping_add(1);
        Ok(Vec::new())
    }

    pub(super) fn hash(&mut self, params: &Structure) -> Reply {
        let input = data(params, "data");
        if input.len() > MAX_DIGEST_BUFFER {
            return Err(ResponseCode::SIZE.with_parameter(1).into());
        }
        let out = digest(number(params, "hashAlg"), &[input])
            .ok_or(ResponseCode::HASH.with_parameter(2))?;
        let hierarchy = handle(params, "hierarchy");
        if !is_hierarchy(hierarchy) {
            return Err(ResponseCode::VALUE.with_parameter(3).into());
        }
        let mut body = BytesMut::new();
        put_sized(&mut body, &out);
        body.put_u16(0x8024);
        body.put_u32(hierarchy.as_u32());
        put_sized(&mut body, &[]);
        Ok(body.to_vec())
    }

    pub(super) fn get_capability(&mut self, params: &Structure) -> Reply {
        let capability = number(params, "capability") as u32;
        let property = number(params, "property") as u32;
        let requested = number(params, "propertyCount") as u32;

        let mut body = BytesMut::new();
        match capability {
            // TPM_CAP_TPM_PROPERTIES
            6 => {
                let first = property.max(TPM_PT_FIXED);
                let end = TPM_PT_FIXED + TPM_PT_COUNT;
                let available = end.saturating_sub(first);
                let count = requested.min(MAX_CAP_PROPERTIES).min(available);
                body.put_u8(u8::from(available > count));
                body.put_u32(capability);
                body.put_u32(count);
                for pt in first..first + count {
                    body.put_u32(pt);
                    body.put_u32(pt.wrapping_mul(0x9E37_79B9) >> 16);
                }
            }
            // TPM_CAP_COMMANDS
            2 => {
                let codes: Vec<u32> = tpmfuzz_wire::catalog::all()
                    .iter()
                    .map(|descriptor| descriptor.code.as_u32())
                    .filter(|code| *code >= property)
                    .collect();
                let count = (requested.min(MAX_CAP_PROPERTIES) as usize).min(codes.len());
                body.put_u8(u8::from(codes.len() > count));
                body.put_u32(capability);
                body.put_u32(count as u32);
                for code in &codes[..count] {
                    body.put_u32(*code);
                }
            }
            _ => {
                body.put_u8(0);
                body.put_u32(capability);
                body.put_u32(0);
            }
        }
        Ok(body.to_vec())
    }

    pub(super) fn nv_define_space(&mut self, auth: Handle, params: &Structure) -> Reply {
        self.check_lockout()?;
        let platform = match auth {
            Handle::OWNER => false,
            Handle::PLATFORM => true,
            other if other.handle_type() == Some(HandleType::Permanent) => {
                return Err(ResponseCode::HIERARCHY.with_handle(1).into());
            }
            other => return Err(self.reject_auth(other, 1)),
        };
        if data(params, "auth").len() > MAX_AUTH {
            return Err(ResponseCode::SIZE.with_parameter(1).into());
        }
        let public = body(params, "publicInfo").ok_or(ResponseCode::SIZE.with_parameter(2))?;

        let index = handle(public, "nvIndex");
        if index.handle_type() != Some(HandleType::NvIndex) {
            return Err(ResponseCode::VALUE.with_parameter(2).into());
        }
        let name_size =
            digest_size(number(public, "nameAlg")).ok_or(ResponseCode::HASH.with_parameter(2))?;
        let policy = data(public, "authPolicy").len();
        if policy != 0 && policy != name_size {
            return Err(ResponseCode::SIZE.with_parameter(2).into());
        }
        let platform_create = number(public, "attributes") & NV_PLATFORM_CREATE != 0;
        if platform_create != platform {
            return Err(ResponseCode::ATTRIBUTES.with_parameter(2).into());
        }
        let data_size = number(public, "dataSize") as usize;
        if data_size > MAX_NV_INDEX_SIZE {
            return Err(ResponseCode::NV_SIZE.into());
        }
        if self.persistent.nv.contains_key(&index.as_u32()) {
            return Err(ResponseCode::NV_DEFINED.into());
        }
        let used: usize = self.persistent.nv.values().map(|nv| nv.data_size).sum();
        if self.persistent.nv.len() >= MAX_NV_INDICES || used + data_size > NV_CAPACITY {
            return Err(ResponseCode::NV_SPACE.into());
        }

        self.persistent.nv.insert(
            index.as_u32(),
            NvIndex {
                data_size,
                platform,
                data: vec![0xFF; data_size],
                written: false,
            },
        );
        Ok(Vec::new())
    }

    pub(super) fn nv_undefine_space(&mut self, auth: Handle, index: Handle) -> Reply {
        self.check_lockout()?;
        let platform = self
            .persistent
            .nv
            .get(&index.as_u32())
            .map(|nv| nv.platform)
            .ok_or(ResponseCode::HANDLE.with_handle(2))?;
        let required = if platform {
            Handle::PLATFORM
        } else {
            Handle::OWNER
        };
        if auth != required {
            return Err(self.reject_auth(auth, 1));
        }
        self.persistent.nv.remove(&index.as_u32());
        Ok(Vec::new())
    }

    /// Resolves an NV index and checks that `auth` may access it.
    fn nv_access(&mut self, auth: Handle, index: Handle) -> Result<(), Fail> {
        self.check_lockout()?;
        let platform = self
            .persistent
            .nv
            .get(&index.as_u32())
            .map(|nv| nv.platform)
            .ok_or(ResponseCode::HANDLE.with_handle(2))?;
        let hierarchy = if platform {
            Handle::PLATFORM
        } else {
            Handle::OWNER
        };
        if auth != index && auth != hierarchy {
            return Err(self.reject_auth(auth, 1));
        }
        Ok(())
    }

    pub(super) fn nv_write(&mut self, auth: Handle, index: Handle, params: &Structure) -> Reply {
        self.nv_access(auth, index)?;
        let bytes = data(params, "data");
        if bytes.len() > MAX_NV_BUFFER {
            return Err(ResponseCode::SIZE.with_parameter(1).into());
        }
        let offset = number(params, "offset") as usize;
        let Some(nv) = self.persistent.nv.get_mut(&index.as_u32()) else {
            return Err(ResponseCode::HANDLE.with_handle(2).into());
        };
        if offset + bytes.len() > nv.data_size {
            return Err(ResponseCode::NV_RANGE.into());
        }
        nv.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        nv.written = true;
        Ok(Vec::new())
    }

    pub(super) fn nv_read(&mut self, auth: Handle, index: Handle, params: &Structure) -> Reply {
        self.nv_access(auth, index)?;
        let size = number(params, "size") as usize;
        if size > MAX_NV_BUFFER {
            return Err(ResponseCode::VALUE.with_parameter(1).into());
        }
        let offset = number(params, "offset") as usize;
        let Some(nv) = self.persistent.nv.get(&index.as_u32()) else {
            return Err(ResponseCode::HANDLE.with_handle(2).into());
        };
        if !nv.written {
            return Err(ResponseCode::NV_UNINITIALIZED.into());
        }
        if offset + size > nv.data_size {
            return Err(ResponseCode::NV_RANGE.into());
        }
        let mut body = BytesMut::new();
        put_sized(&mut body, &nv.data[offset..offset + size]);
        Ok(body.to_vec())
    }

    pub(super) fn create_primary(&mut self, hierarchy: Handle, params: &Structure) -> Reply {
        if !is_hierarchy(hierarchy) {
            return Err(ResponseCode::VALUE.with_handle(1).into());
        }
        let sensitive =
            body(params, "inSensitive").ok_or(ResponseCode::SIZE.with_parameter(1))?;
        if data(sensitive, "userAuth").len() > MAX_AUTH || !data(sensitive, "data").is_empty() {
            return Err(ResponseCode::SIZE.with_parameter(1).into());
        }

        let public = body(params, "inPublic").ok_or(ResponseCode::SIZE.with_parameter(2))?;
        self.check_public(public)?;

        if data(params, "outsideInfo").len() > MAX_AUTH {
            return Err(ResponseCode::SIZE.with_parameter(3).into());
        }
        for selection in items(params, "creationPCR") {
            if digest_size(number(selection, "hash")).is_none() {
                return Err(ResponseCode::HASH.with_parameter(4).into());
            }
        }
        if self.volatile.objects.len() >= MAX_OBJECTS {
            return Err(ResponseCode::OBJECT_MEMORY.into());
        }

        let handle = Handle::from_type_and_index(HandleType::Transient, self.volatile.next_object);
        self.volatile.next_object = self.volatile.next_object.wrapping_add(1) & 0x00FF_FFFF;
        self.volatile.objects.insert(handle.as_u32(), public.clone());

        let mut body = BytesMut::new();
        body.put_u32(handle.as_u32());
        put_sized(&mut body, &structure_bytes(public));
        Ok(body.to_vec())
    }

    fn check_public(&self, public: &Structure) -> Result<(), Fail> {
        let name_size =
            digest_size(number(public, "nameAlg")).ok_or(ResponseCode::HASH.with_parameter(2))?;
        let policy = data(public, "authPolicy").len();
        if policy != 0 && policy != name_size {
            return Err(ResponseCode::SIZE.with_parameter(2).into());
        }
        if data(public, "unique").len() > MAX_UNIQUE {
            return Err(ResponseCode::SIZE.with_parameter(2).into());
        }

        let parameters = body(public, "parameters").ok_or(ResponseCode::TYPE.with_parameter(2))?;
        if let Some(symmetric) = body(parameters, "symmetric") {
            if number(symmetric, "algorithm") != AES || number(symmetric, "mode") != CFB {
                return Err(ResponseCode::SYMMETRIC.with_parameter(2).into());
            }
            if !matches!(number(symmetric, "keyBits"), 128 | 256) {
                return Err(ResponseCode::KEY_SIZE.with_parameter(2).into());
            }
        }

        let schemes = match parameters.kind {
            StructKind::RsaParms => {
                let key_bits = number(parameters, "keyBits");
                if self.config.planted_defect && key_bits % 8 != 0 {
                    return Err(Fail::Crash("unaligned RSA modulus size"));
                }
                if !matches!(key_bits, 1024 | 2048) {
                    return Err(ResponseCode::KEY_SIZE.with_parameter(2).into());
                }
                if !matches!(number(parameters, "exponent"), 0 | 65_537) {
                    return Err(ResponseCode::VALUE.with_parameter(2).into());
                }
                RSA_SCHEMES
            }
            StructKind::EccParms => {
                if !matches!(number(parameters, "curveID"), NIST_P256 | NIST_P384) {
                    return Err(ResponseCode::CURVE.with_parameter(2).into());
                }
                if let Some(kdf) = body(parameters, "kdf") {
                    let restricted = number(public, "objectAttributes") & RESTRICTED != 0;
                    if restricted || !ECC_KDFS.contains(&number(kdf, "scheme")) {
                        return Err(ResponseCode::SCHEME.with_parameter(2).into());
                    }
                    if digest_size(number(kdf, "hashAlg")).is_none() {
                        return Err(ResponseCode::HASH.with_parameter(2).into());
                    }
                }
                ECC_SCHEMES
            }
            _ => return Err(ResponseCode::TYPE.with_parameter(2).into()),
        };
        if let Some(scheme) = body(parameters, "scheme") {
            if !schemes.contains(&number(scheme, "scheme")) {
                return Err(ResponseCode::SCHEME.with_parameter(2).into());
            }
            if digest_size(number(scheme, "hashAlg")).is_none() {
                return Err(ResponseCode::HASH.with_parameter(2).into());
            }
        }
        Ok(())
    }

    pub(super) fn flush_context(&mut self, params: &Structure) -> Reply {
        let target = handle(params, "flushHandle");
        self.volatile
            .objects
            .remove(&target.as_u32())
            .map(|_| Vec::new())
            .ok_or_else(|| ResponseCode::HANDLE.with_parameter(1).into())
    }

    pub(super) fn read_public(&mut self, object: Handle) -> Reply {
        let public = self
            .volatile
            .objects
            .get(&object.as_u32())
            .ok_or(ResponseCode::HANDLE.with_handle(1))?;
        let mut body = BytesMut::new();
        put_sized(&mut body, &structure_bytes(public));
        Ok(body.to_vec())
    }

    pub(super) fn lock_reset(&mut self, lock: Handle) -> Reply {
        if lock != Handle::LOCKOUT {
            return Err(self.reject_auth(lock, 1));
        }
        self.persistent.failed_tries = 0;
        Ok(Vec::new())
    }
}
