//! Configuration loader with multi-source merging

use crate::paths::config_files;
use crate::{ConfigError, TpmFuzzConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    config_file: Option<PathBuf>,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            env_prefix: "TPMFUZZ".to_string(),
            user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Add an explicit config file, layered above the project files
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "TPMFUZZ")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/tpmfuzz/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TpmFuzzConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = TpmFuzzConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2-5. User, project, local and explicit files, in that order
        let files = config_files(
            &self.project_dir,
            self.config_file.as_deref(),
            self.user_config,
        );
        for file in files {
            let required = file.required();
            if required && !file.path.exists() {
                return Err(ConfigError::MissingFile { path: file.path }.into());
            }
            builder = builder.add_source(toml_file(file.path, required));
        }

        // 6. Environment variables (TPMFUZZ_SESSION__SEED=7)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // Build and deserialize
        let config = builder.build().context("Failed to build configuration")?;

        let mut tpmfuzz_config: TpmFuzzConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tpmfuzz_config
            .validate()
            .context("Configuration failed validation")?;

        // Resolve relative paths
        tpmfuzz_config.resolve_paths(&self.project_dir);

        Ok(tpmfuzz_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn toml_file(path: PathBuf, required: bool) -> impl config::Source + Send + Sync + 'static {
    config::File::from(path)
        .required(required)
        .format(config::FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(project_dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("TPMFUZZ_TEST_UNSET")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.series.max_fuzz_count, 256);
        assert_eq!(config.probability.max, 0.9);
        assert!(config.session.seed.is_none());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[session]
seed = 1234
exclusive = "CreatePrimary"
threads = 4

[series]
max_fuzz_count = 64

[device]
planted_defect = false
"#;
        fs::write(project_dir.join("tpmfuzz.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.session.seed, Some(1234));
        assert_eq!(config.session.exclusive.as_deref(), Some("CreatePrimary"));
        assert_eq!(config.session.threads, 4);
        assert_eq!(config.series.max_fuzz_count, 64);
        assert!(!config.device.planted_defect);
        // Untouched keys keep their defaults
        assert_eq!(config.series.max_duration_ms, 2_000);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("tpmfuzz.toml"),
            "[session]\nduration_secs = 600\n",
        )
        .expect("Failed to write project config");
        fs::write(
            project_dir.join("tpmfuzz.local.toml"),
            "[session]\nduration_secs = 5\n",
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        // Local config should override project config
        assert_eq!(config.session.duration_secs, 5);
    }

    #[test]
    fn test_explicit_file_overrides_project() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        let explicit = project_dir.join("campaign.toml");

        fs::write(project_dir.join("tpmfuzz.toml"), "[probability]\nbase = 0.3\n")
            .expect("Failed to write project config");
        fs::write(&explicit, "[probability]\nbase = 0.4\n").expect("Failed to write config");

        let config = loader(project_dir)
            .with_config_file(&explicit)
            .load()
            .expect("Failed to load config");
        assert_eq!(config.probability.base, 0.4);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let err = loader(temp_dir.path())
            .with_config_file(temp_dir.path().join("absent.toml"))
            .load()
            .expect_err("missing file should fail");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingFile { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("tpmfuzz.toml"),
            "[probability]\nmin = 0.5\nbase = 0.25\n",
        )
        .expect("Failed to write config");

        let err = loader(project_dir).load().expect_err("should fail validation");
        assert!(format!("{err:#}").contains("min <= base <= max"));
    }

    // Environment variables are not exercised here: the process environment
    // is shared between tests. In actual usage
    //
    // TPMFUZZ_SESSION__SEED=7
    // TPMFUZZ_SERIES__MAX_FUZZ_COUNT=32
    //
    // override the corresponding config file values.

    #[test]
    fn test_path_resolution() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert!(config.session.crash_dir.is_absolute());
        assert!(config.session.crash_dir.starts_with(temp_dir.path()));
    }
}
