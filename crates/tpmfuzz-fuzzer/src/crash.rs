//! Crash artifacts.
//!
//! When the device channel fails, the session captures what it needs to
//! reproduce the failure: the last frame handed to the transport, the
//! command kind, the seed of the active series, and the error. Artifacts
//! are plain text, one file per crash.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tpmfuzz_types::CommandCode;
use tpmfuzz_wire::catalog;

use crate::FuzzError;

/// Everything known about one device failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashArtifact {
    /// Command kind being executed.
    pub command: CommandCode,
    /// Seed of the active series, if the failure happened during one.
    pub series_seed: Option<u64>,
    /// Seed of the session.
    pub session_seed: u64,
    /// Last frame handed to the transport.
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    /// Error detail.
    pub error: String,
    /// Clock reading at the failure, in nanoseconds.
    pub at_ns: u64,
    /// Where the artifact was written, if it was.
    pub path: Option<PathBuf>,
}

impl CrashArtifact {
    /// Renders the artifact as text.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let name = catalog::name(self.command).unwrap_or("Unknown");
        let _ = writeln!(out, "command: {name} ({})", self.command);
        match self.series_seed {
            Some(seed) => {
                let _ = writeln!(out, "series seed: {seed:#018x}");
            }
            None => out.push_str("series seed: none (no active series)\n"),
        }
        let _ = writeln!(out, "session seed: {:#018x}", self.session_seed);
        let _ = writeln!(out, "at: {} ns", self.at_ns);
        let _ = writeln!(out, "error: {}", self.error);
        let _ = writeln!(out, "raw ({} bytes):", self.raw.len());
        for chunk in self.raw.chunks(16) {
            out.push_str("  ");
            out.push_str(&hex_bytes::encode(chunk, " "));
            out.push('\n');
        }
        out
    }

    /// File name for this artifact.
    pub fn file_name(&self, sequence: usize) -> String {
        format!(
            "crash-{:016x}-{sequence:04}.txt",
            self.series_seed.unwrap_or(self.session_seed)
        )
    }

    /// Writes the artifact into `dir`, creating it if needed, and records
    /// the path.
    pub fn write_to(&mut self, dir: &Path, sequence: usize) -> Result<PathBuf, FuzzError> {
        let path = dir.join(self.file_name(sequence));
        let io_error = |source| FuzzError::CrashArtifact {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(io_error)?;
        std::fs::write(&path, self.to_text()).map_err(io_error)?;
        self.path = Some(path.clone());
        Ok(path)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(bytes: &[u8], separator: &str) -> String {
        bytes
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(separator)
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes, ""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd number of hex digits"));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| {
                text.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| serde::de::Error::custom("invalid hex digit"))
            })
            .collect()
    }
}
