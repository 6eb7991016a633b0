//! In-memory simulated TPM.
//!
//! [`SimTpm`] validates every command against the catalogue exactly the way
//! a device front end does: header first, then the command code, then the
//! startup state, then the handle area, then a template-driven decode of the
//! parameter area. Commands that pass reach a per-command handler operating
//! on a small amount of device state.
//!
//! ## State
//!
//! - *Volatile*: startup flag, PCR bank, loaded transient objects. Lost on
//!   restart.
//! - *Persistent*: NV indices and the dictionary-attack failure counter.
//!   Survive restarts, which is why an undeletable NV index is permanent
//!   damage.
//!
//! ## Fault Injection
//!
//! Failures that a real device would surface as a hung or crashed channel
//! are reported as transport errors and leave the device dead until
//! [`Transport::restart`]:
//! - random death with a configurable per-command probability
//! - a hang on commands larger than the maximum command size
//! - a planted defect in `CreatePrimary` (RSA key sizes that are not a
//!   multiple of eight bits)

mod commands;

use std::collections::BTreeMap;

use bytes::Buf;
use rand::rngs::SmallRng;
use rand::{Rng as _, SeedableRng};
use tpmfuzz_types::{
    CommandCode, EnumSpace, Handle, MAX_COMMAND_SIZE, ResponseCode, Structure,
};
use tpmfuzz_wire::{
    CommandHeader, HEADER_SIZE, WireError, descriptor, frame_response, unmarshal_structure,
};
use tracing::{debug, info, warn};

use crate::clock::SimClock;
use crate::{Transport, TransportError};

/// Number of PCRs in the SHA-256 bank.
pub const PCR_COUNT: usize = 24;

/// Commands between decrements of the dictionary-attack failure counter.
pub const LOCKOUT_RECOVERY_INTERVAL: u64 = 128;

// ============================================================================
// Configuration
// ============================================================================

/// Behavior knobs of the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimTpmConfig {
    /// Seed of the device's own RNG (random bytes, fault rolls, latency).
    pub seed: u64,
    /// Probability that any command kills the device.
    pub death_probability: f64,
    /// Whether oversized commands hang the device instead of being rejected.
    pub hang_on_oversized: bool,
    /// Whether the planted `CreatePrimary` defect is armed.
    pub planted_defect: bool,
    /// Authorization failures before the device enters lockout.
    pub lockout_threshold: u32,
    /// Reported timeout of a hung device.
    pub timeout_ms: u64,
    /// Simulated execution latency range, applied to an attached clock.
    pub min_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl Default for SimTpmConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            death_probability: 0.0,
            hang_on_oversized: false,
            planted_defect: false,
            lockout_threshold: 8,
            timeout_ms: 2_000,
            min_latency_ns: 50_000,
            max_latency_ns: 2_000_000,
        }
    }
}

impl SimTpmConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_death_probability(mut self, probability: f64) -> Self {
        self.death_probability = probability;
        self
    }

    pub fn with_hang_on_oversized(mut self, hang: bool) -> Self {
        self.hang_on_oversized = hang;
        self
    }

    pub fn with_planted_defect(mut self, armed: bool) -> Self {
        self.planted_defect = armed;
        self
    }

    pub fn with_lockout_threshold(mut self, threshold: u32) -> Self {
        self.lockout_threshold = threshold;
        self
    }
}

// ============================================================================
// Device State
// ============================================================================

/// State lost on restart.
#[derive(Debug, Clone)]
struct Volatile {
    started: bool,
    orderly_shutdown: bool,
    pcrs: [[u8; 32]; PCR_COUNT],
    pcr_update_counter: u32,
    objects: BTreeMap<u32, Structure>,
    next_object: u32,
}

impl Volatile {
    fn new() -> Self {
        Self {
            started: false,
            orderly_shutdown: false,
            pcrs: [[0; 32]; PCR_COUNT],
            pcr_update_counter: 0,
            objects: BTreeMap::new(),
            next_object: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NvIndex {
    data_size: usize,
    platform: bool,
    data: Vec<u8>,
    written: bool,
}

/// State that survives restarts.
#[derive(Debug, Clone, Default)]
struct Persistent {
    nv: BTreeMap<u32, NvIndex>,
    failed_tries: u32,
}

/// Outcome of a handler that did not produce a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fail {
    /// The device answers with an error response.
    Rc(ResponseCode),
    /// The device crashes without answering.
    Crash(&'static str),
}

impl From<ResponseCode> for Fail {
    fn from(rc: ResponseCode) -> Self {
        Fail::Rc(rc)
    }
}

type Reply = Result<Vec<u8>, Fail>;

// ============================================================================
// Simulated Device
// ============================================================================

/// In-memory TPM implementing [`Transport`].
#[derive(Debug)]
pub struct SimTpm {
    config: SimTpmConfig,
    rng: SmallRng,
    clock: Option<SimClock>,
    volatile: Volatile,
    persistent: Persistent,
    dead: bool,
    boots: u64,
    commands: u64,
    privileged_defines: u64,
}

impl SimTpm {
    pub fn new(config: SimTpmConfig) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(config.seed),
            config,
            clock: None,
            volatile: Volatile::new(),
            persistent: Persistent::default(),
            dead: false,
            boots: 0,
            commands: 0,
            privileged_defines: 0,
        }
    }

    /// Attaches a simulated clock advanced by each command's latency.
    pub fn with_clock(mut self, clock: SimClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Number of restarts since construction.
    pub fn boots(&self) -> u64 {
        self.boots
    }

    pub fn failed_tries(&self) -> u32 {
        self.persistent.failed_tries
    }

    pub fn nv_index_count(&self) -> usize {
        self.persistent.nv.len()
    }

    /// `NV_DefineSpace` frames received with an authorization other than
    /// the owner, whether or not they were accepted.
    pub fn privileged_defines(&self) -> u64 {
        self.privileged_defines
    }

    /// Returns true if the NV index is defined.
    pub fn nv_defined(&self, index: Handle) -> bool {
        self.persistent.nv.contains_key(&index.as_u32())
    }

    fn die(&mut self, reason: &'static str) -> TransportError {
        warn!(reason, commands = self.commands, "simulated device died");
        self.dead = true;
        TransportError::Timeout {
            timeout_ms: self.config.timeout_ms,
        }
    }

    fn tick(&mut self) {
        if let Some(clock) = &self.clock {
            let (min, max) = (self.config.min_latency_ns, self.config.max_latency_ns);
            let latency = if max > min {
                self.rng.gen_range(min..=max)
            } else {
                min
            };
            clock.advance(latency);
        }
        if self.commands % LOCKOUT_RECOVERY_INTERVAL == 0 && self.persistent.failed_tries > 0 {
            self.persistent.failed_tries -= 1;
        }
    }

    fn process(&mut self, frame: &[u8]) -> Reply {
        let header = CommandHeader::parse(frame).map_err(|err| match err {
            WireError::InvalidTag(_) => ResponseCode::BAD_TAG,
            _ => ResponseCode::COMMAND_SIZE,
        })?;
        let descriptor = descriptor(header.code).ok_or(ResponseCode::COMMAND_CODE)?;
        if !self.volatile.started && header.code != CommandCode::STARTUP {
            return Err(ResponseCode::INITIALIZE.into());
        }

        let mut rest = &frame[HEADER_SIZE..];
        if rest.len() < descriptor.handles_in * 4 {
            return Err(ResponseCode::INSUFFICIENT.into());
        }
        let handles: Vec<Handle> = (0..descriptor.handles_in)
            .map(|_| Handle::new(rest.get_u32()))
            .collect();
        if header.code == CommandCode::NV_DEFINE_SPACE && handles.first() != Some(&Handle::OWNER) {
            self.privileged_defines += 1;
        }
        let params = unmarshal_structure(&descriptor.template, rest)
            .map_err(|err| wire_error_code(&err).with_parameter(1))?;

        debug!(command = descriptor.name, handles = handles.len(), "dispatch");
        self.dispatch(header.code, &handles, &params)
    }

    fn dispatch(&mut self, code: CommandCode, handles: &[Handle], params: &Structure) -> Reply {
        match code {
            CommandCode::STARTUP => self.startup(params),
            CommandCode::SHUTDOWN => self.shutdown(),
            CommandCode::SELF_TEST => Ok(Vec::new()),
            CommandCode::GET_RANDOM => self.get_random(params),
            CommandCode::STIR_RANDOM => self.stir_random(params),
            CommandCode::PCR_READ => self.pcr_read(params),
            CommandCode::PCR_EXTEND => self.pcr_extend(handles[0], params),
            CommandCode::HASH => self.hash(params),
            CommandCode::GET_CAPABILITY => self.get_capability(params),
            CommandCode::NV_DEFINE_SPACE => self.nv_define_space(handles[0], params),
            CommandCode::NV_UNDEFINE_SPACE => self.nv_undefine_space(handles[0], handles[1]),
            CommandCode::NV_WRITE => self.nv_write(handles[0], handles[1], params),
            CommandCode::NV_READ => self.nv_read(handles[0], handles[1], params),
            CommandCode::CREATE_PRIMARY => self.create_primary(handles[0], params),
            CommandCode::FLUSH_CONTEXT => self.flush_context(params),
            CommandCode::READ_PUBLIC => self.read_public(handles[0]),
            CommandCode::DICTIONARY_ATTACK_LOCK_RESET => self.lock_reset(handles[0]),
            _ => Err(ResponseCode::COMMAND_CODE.into()),
        }
    }
}

impl Transport for SimTpm {
    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.dead {
            return Err(TransportError::DeviceDead);
        }
        self.commands += 1;
        self.tick();

        if self.config.death_probability > 0.0
            && self.rng.r#gen::<f64>() < self.config.death_probability
        {
            return Err(self.die("random device death"));
        }
        if command.len() > MAX_COMMAND_SIZE {
            if self.config.hang_on_oversized {
                return Err(self.die("oversized command"));
            }
            return Ok(frame_response(ResponseCode::COMMAND_SIZE, &[]));
        }

        match self.process(command) {
            Ok(body) => Ok(frame_response(ResponseCode::SUCCESS, &body)),
            Err(Fail::Rc(rc)) => Ok(frame_response(rc, &[])),
            Err(Fail::Crash(reason)) => Err(self.die(reason)),
        }
    }

    fn restart(&mut self) -> Result<(), TransportError> {
        self.boots += 1;
        self.dead = false;
        self.volatile = Volatile::new();
        info!(boots = self.boots, "simulated device restarted");
        Ok(())
    }
}

/// Maps a decode failure to the response code a device front end reports.
fn wire_error_code(err: &WireError) -> ResponseCode {
    match err {
        WireError::Truncated { .. } => ResponseCode::INSUFFICIENT,
        WireError::TrailingBytes { .. } | WireError::Oversized { .. } => ResponseCode::SIZE,
        WireError::InvalidEnumerator { space, .. } => match space {
            EnumSpace::HashAlg => ResponseCode::HASH,
            EnumSpace::SymAlg | EnumSpace::SymMode => ResponseCode::SYMMETRIC,
            EnumSpace::AsymScheme | EnumSpace::KdfScheme => ResponseCode::SCHEME,
            EnumSpace::EccCurve => ResponseCode::CURVE,
            _ => ResponseCode::VALUE,
        },
        WireError::InvalidSelector { .. } => ResponseCode::SELECTOR,
        _ => ResponseCode::VALUE,
    }
}
