//! Ordinary test cases driven through the fuzzing pipeline.
//!
//! Test cases know nothing about fuzzing. They issue well-formed commands
//! through a [`CommandExecutor`] and check the answers; the session's hooks
//! decide which of those commands carry a series. Between them the built-in
//! cases exercise every command in the catalogue except `Startup`.

use tpmfuzz_device::TpmError;
use tpmfuzz_types::{Handle, ResponseCode};
use tpmfuzz_wire::{Command, Response};

use crate::rng::SimRng;

/// First NV index used by the built-in cases.
pub const NV_INDEX_BASE: u32 = 0x0150_0000;

/// Executes commands on behalf of a test case.
pub trait CommandExecutor {
    fn execute(&mut self, command: Command) -> Result<Response, TpmError>;
}

/// One ordinary test.
pub trait TestCase: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError>;
}

/// Returns the built-in test library.
pub fn builtin() -> Vec<Box<dyn TestCase>> {
    vec![
        Box::new(RandomTest),
        Box::new(SelfTestTest),
        Box::new(PcrTest),
        Box::new(HashTest),
        Box::new(CapabilityTest),
        Box::new(NvLifecycleTest),
        Box::new(PrimaryObjectTest),
    ]
}

fn check(condition: bool, message: impl Into<String>) -> Result<(), TpmError> {
    if condition {
        Ok(())
    } else {
        Err(TpmError::Assertion(message.into()))
    }
}

// ============================================================================
// Built-in Cases
// ============================================================================

/// `GetRandom` and `StirRandom`.
pub struct RandomTest;

impl TestCase for RandomTest {
    fn name(&self) -> &'static str {
        "random"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError> {
        let requested = rng.next_usize_inclusive(1, 48) as u16;
        let response = tpm.execute(Command::get_random(requested))?;
        let bytes = response.reader().sized()?;
        check(
            bytes.len() == usize::from(requested),
            format!("asked for {requested} random bytes, got {}", bytes.len()),
        )?;
        tpm.execute(Command::stir_random(rng.bytes(16)))?;
        Ok(())
    }
}

/// `SelfTest`.
pub struct SelfTestTest;

impl TestCase for SelfTestTest {
    fn name(&self) -> &'static str {
        "self-test"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError> {
        tpm.execute(Command::self_test(rng.next_bool()))?;
        Ok(())
    }
}

/// `PCR_Extend` changes what `PCR_Read` reports.
pub struct PcrTest;

impl TestCase for PcrTest {
    fn name(&self) -> &'static str {
        "pcr"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError> {
        let pcr = rng.next_usize(16) as u8;
        let before = tpm.execute(Command::pcr_read(pcr))?;
        tpm.execute(Command::pcr_extend(pcr, rng.bytes(32)))?;
        let after = tpm.execute(Command::pcr_read(pcr))?;
        check(before.body != after.body, format!("PCR {pcr} unchanged by extend"))
    }
}

/// SHA-256 `Hash` of random data.
pub struct HashTest;

impl TestCase for HashTest {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError> {
        let len = rng.next_usize_inclusive(1, 64);
        let response = tpm.execute(Command::hash(rng.bytes(len), 0x000B))?;
        let digest = response.reader().sized()?;
        check(digest.len() == 32, format!("SHA-256 digest of {} bytes", digest.len()))
    }
}

/// `GetCapability` for properties and commands.
pub struct CapabilityTest;

impl TestCase for CapabilityTest {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, _rng: &mut SimRng) -> Result<(), TpmError> {
        tpm.execute(Command::get_capability(6, 0x100, 8))?;
        let response = tpm.execute(Command::get_capability(2, 0, 8))?;
        let mut reader = response.reader();
        let _more = reader.u8()?;
        let _capability = reader.u32()?;
        let count = reader.u32()?;
        check(count > 0, "no commands reported")
    }
}

/// Define, write, read back and undefine an owner NV index.
pub struct NvLifecycleTest;

impl NvLifecycleTest {
    fn exercise(
        tpm: &mut dyn CommandExecutor,
        index: Handle,
        rng: &mut SimRng,
    ) -> Result<(), TpmError> {
        let data = rng.bytes(8);
        let offset = rng.next_usize(24) as u16;
        tpm.execute(Command::nv_write(Handle::OWNER, index, data.clone(), offset))?;
        let response = tpm.execute(Command::nv_read(index, index, 8, offset))?;
        let read = response.reader().sized()?;
        check(read[..] == data[..], "NV read back differs from write")
    }
}

impl TestCase for NvLifecycleTest {
    fn name(&self) -> &'static str {
        "nv-lifecycle"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError> {
        tpm.execute(Command::dictionary_attack_lock_reset())?;
        let index = Handle::new(NV_INDEX_BASE | rng.next_usize(16) as u32);
        match tpm.execute(Command::nv_define_space(Handle::OWNER, index, 32)) {
            Ok(_) => {}
            Err(err) if err.response_code().map(ResponseCode::normalized)
                == Some(ResponseCode::NV_DEFINED) => {}
            Err(err) => return Err(err),
        }
        let result = Self::exercise(tpm, index, rng);
        let cleanup = tpm.execute(Command::nv_undefine_space(Handle::OWNER, index));
        result?;
        cleanup.map(|_| ())
    }
}

/// Create, inspect and flush a primary key: storage or signing, RSA or ECC.
pub struct PrimaryObjectTest;

impl TestCase for PrimaryObjectTest {
    fn name(&self) -> &'static str {
        "primary-object"
    }

    fn run(&self, tpm: &mut dyn CommandExecutor, rng: &mut SimRng) -> Result<(), TpmError> {
        let ecc = rng.next_bool();
        let command = if rng.next_bool() {
            Command::create_signing_primary(Handle::OWNER, ecc)
        } else {
            Command::create_primary(Handle::OWNER, ecc)
        };
        let response = tpm.execute(command)?;
        let object = Handle::new(response.reader().u32()?);
        let inspected = tpm.execute(Command::read_public(object));
        let flushed = tpm.execute(Command::flush_context(object));
        inspected?;
        flushed.map(|_| ())
    }
}
