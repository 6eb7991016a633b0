//! Configuration management for tpmfuzz
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (`TPMFUZZ_<SECTION>__<KEY>`)
//! 3. An explicit `--config` file
//! 4. tpmfuzz.local.toml (gitignored, local overrides)
//! 5. tpmfuzz.toml (git-tracked, campaign config)
//! 6. ~/.config/tpmfuzz/config.toml (user defaults)
//! 7. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{
    ConfigFile, ConfigLayer, LOCAL_FILE, PROJECT_FILE, config_files, user_config_file,
};

/// Largest buffer a sized TPM2B field can describe
pub const MAX_BUFFER_SIZE: usize = u16::MAX as usize;

/// Main tpmfuzz configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpmFuzzConfig {
    pub session: SessionSection,
    pub probability: ProbabilitySection,
    pub series: SeriesSection,
    pub mutation: MutationSection,
    pub device: DeviceSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Session seed. Drawn from the OS when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub duration_secs: u64,
    pub threads: usize,
    pub restart_on_failure: bool,
    pub crash_dir: PathBuf,
    /// Only fuzz this command, by catalogue name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_test_runs: Option<u64>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            seed: None,
            duration_secs: 60,
            threads: 1,
            restart_on_failure: true,
            crash_dir: PathBuf::from("crashes"),
            exclusive: None,
            max_test_runs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbabilitySection {
    pub min: f64,
    pub base: f64,
    pub max: f64,
    pub repeat_decay: f64,
}

impl Default for ProbabilitySection {
    fn default() -> Self {
        Self {
            min: 0.02,
            base: 0.25,
            max: 0.9,
            repeat_decay: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesSection {
    pub max_duration_ms: u64,
    pub max_fuzz_count: u64,
    pub early_exit_min_progress: f64,
}

impl Default for SeriesSection {
    fn default() -> Self {
        Self {
            max_duration_ms: 2_000,
            max_fuzz_count: 256,
            early_exit_min_progress: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationSection {
    pub raw_only_probability: f64,
    pub whole_command_fraction: f64,
    pub secondary_raw_probability: f64,
    pub max_leaves: usize,
    pub max_transfer: usize,
}

impl Default for MutationSection {
    fn default() -> Self {
        Self {
            raw_only_probability: 0.15,
            whole_command_fraction: 0.5,
            secondary_raw_probability: 0.05,
            max_leaves: 8,
            max_transfer: 1024,
        }
    }
}

/// Fault knobs of the simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub death_probability: f64,
    pub hang_on_oversized: bool,
    pub planted_defect: bool,
    pub lockout_threshold: u32,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            death_probability: 0.0,
            hang_on_oversized: true,
            planted_defect: true,
            lockout_threshold: 8,
        }
    }
}

impl TpmFuzzConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Check value ranges and the ordering of the probability bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ProbabilitySection {
            min,
            base,
            max,
            repeat_decay,
        } = self.probability;

        let probabilities = [
            ("probability.min", min),
            ("probability.base", base),
            ("probability.max", max),
            ("probability.repeat_decay", repeat_decay),
            ("series.early_exit_min_progress", self.series.early_exit_min_progress),
            ("mutation.raw_only_probability", self.mutation.raw_only_probability),
            ("mutation.whole_command_fraction", self.mutation.whole_command_fraction),
            (
                "mutation.secondary_raw_probability",
                self.mutation.secondary_raw_probability,
            ),
            ("device.death_probability", self.device.death_probability),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if min > base || base > max {
            return Err(ConfigError::ValidationError(format!(
                "probability bounds must satisfy min <= base <= max, got {min} / {base} / {max}"
            )));
        }
        if self.series.max_fuzz_count == 0 {
            return Err(ConfigError::ValidationError(
                "series.max_fuzz_count must be positive".to_string(),
            ));
        }
        if self.series.max_duration_ms == 0 {
            return Err(ConfigError::ValidationError(
                "series.max_duration_ms must be positive".to_string(),
            ));
        }
        if !(1..=MAX_BUFFER_SIZE).contains(&self.mutation.max_transfer) {
            return Err(ConfigError::ValidationError(format!(
                "mutation.max_transfer must be within [1, {MAX_BUFFER_SIZE}], got {}",
                self.mutation.max_transfer
            )));
        }
        if self.session.threads == 0 {
            return Err(ConfigError::ValidationError(
                "session.threads must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.session.crash_dir.is_relative() {
            self.session.crash_dir = base.join(&self.session.crash_dir);
        }
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TpmFuzzConfig::default();
        assert_eq!(config.probability.base, 0.25);
        assert_eq!(config.series.max_fuzz_count, 256);
        assert_eq!(config.mutation.max_leaves, 8);
        assert_eq!(config.session.threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_probability_order_is_enforced() {
        let mut config = TpmFuzzConfig::default();
        config.probability.min = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = TpmFuzzConfig::default();
        config.probability.base = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_probability_is_rejected() {
        let mut config = TpmFuzzConfig::default();
        config.mutation.raw_only_probability = 1.5;
        let err = config.validate().expect_err("should be rejected");
        assert!(err.to_string().contains("mutation.raw_only_probability"));
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let mut config = TpmFuzzConfig::default();
        config.series.max_fuzz_count = 0;
        assert!(config.validate().is_err());

        let mut config = TpmFuzzConfig::default();
        config.series.max_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_limit_is_bounded() {
        let mut config = TpmFuzzConfig::default();
        config.mutation.max_transfer = usize::MAX;
        let err = config.validate().expect_err("should be rejected");
        assert!(err.to_string().contains("mutation.max_transfer"));

        config.mutation.max_transfer = 0;
        assert!(config.validate().is_err());

        config.mutation.max_transfer = MAX_BUFFER_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_resolution() {
        let mut config = TpmFuzzConfig::default();
        config.resolve_paths("/home/user/campaign");

        assert_eq!(
            config.session.crash_dir,
            PathBuf::from("/home/user/campaign/crashes")
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = TpmFuzzConfig::default();
        config.session.seed = Some(99);
        config.session.exclusive = Some("Hash".to_string());
        let text = config.to_toml().expect("render");
        assert!(text.contains("[probability]"));
        let back: TpmFuzzConfig = toml::from_str(&text).expect("parse");
        assert_eq!(back, config);
    }
}
