//! Client configuration: `~/.opk/config.yml`.
//!
//! Holds the provider list and the default alias used by `login`. A
//! default config ships inside the binary; `--create-config` writes it out
//! and refuses to clobber anything that already exists.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::providers::config::ProviderConfig;

/// The config written by `--create-config`.
pub const DEFAULT_CLIENT_CONFIG: &str = include_str!("default-client-config.yml");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ClientConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let config: ClientConfig =
            serde_yaml::from_str(content).context("parsing client config YAML")?;
        for provider in &config.providers {
            provider.validate()?;
        }
        Ok(config)
    }

    /// The built-in defaults, used when no config file exists.
    pub fn builtin() -> Self {
        Self::parse(DEFAULT_CLIENT_CONFIG).expect("embedded default config parses")
    }
}

/// `$HOME/.opk/config.yml`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".opk").join("config.yml"))
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading client config: {}", path.display()))?;
    ClientConfig::parse(&content)
}

/// Write the embedded default config. Fails if the file already exists.
pub fn create_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!(
            "config file already exists at {}, refusing to overwrite",
            path.display()
        );
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }
    std::fs::write(path, DEFAULT_CLIENT_CONFIG)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    info!(path = %path.display(), "Created client config file");
    Ok(())
}
