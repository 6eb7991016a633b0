//! Configuration management commands.

use anyhow::{Context, Result};
use std::path::Path;
use tpmfuzz_config::{ConfigLoader, TpmFuzzConfig};

/// Loads the effective configuration, optionally layering an explicit file.
pub fn load(config_file: Option<&Path>) -> Result<TpmFuzzConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = config_file {
        loader = loader.with_config_file(path);
    }
    loader.load().context("Failed to load configuration")
}

/// Show current configuration.
pub fn show(config_file: Option<&Path>, format: &str) -> Result<()> {
    let config = load(config_file)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", config.to_toml()?),
        other => anyhow::bail!("Unknown format '{other}' (expected toml or json)"),
    }
    Ok(())
}
