//! Server configuration: `/etc/opk/server_config.yml`.
//!
//! Optional, root-owned like the policy files. `env_vars` are exported
//! into the verifier process before anything else runs, so deployments can
//! steer proxies and trust stores without touching sshd_config.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::errors::AuthError;
use crate::policy::files::{check_perms, OwnerSpec};

fn default_request_timeout() -> u64 {
    10
}

fn default_total_timeout() -> u64 {
    25
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Exported into the verifier's environment on load.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Hard deadline for any single OIDC network request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Budget for the whole verification, in seconds.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            env_vars: HashMap::new(),
            request_timeout_secs: default_request_timeout(),
            total_timeout_secs: default_total_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    /// Export `env_vars` into this process.
    pub fn export_env(&self) {
        for (name, value) in &self.env_vars {
            debug!(name, "Exporting environment variable from server config");
            std::env::set_var(name, value);
        }
    }
}

/// Load the server config if present, enforcing ownership and mode first.
/// A missing file is fine (defaults apply); a present but untrusted or
/// unparseable file is an error.
pub fn load_server_config(
    path: &Path,
    owner: &OwnerSpec,
) -> Result<Option<ServerConfig>, AuthError> {
    if !path.exists() {
        return Ok(None);
    }
    check_perms(path, owner, &[0o640])?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| AuthError::PolicyFs(format!("cannot read {}: {e}", path.display())))?;
    let config: ServerConfig = serde_yaml::from_str(&content)
        .map_err(|e| AuthError::ConfigParse(format!("{}: {e}", path.display())))?;
    Ok(Some(config))
}
