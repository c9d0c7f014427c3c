//! Provider configuration.
//!
//! Providers arrive from three places: YAML files (one per provider under
//! `/etc/opk/providers.d` on servers, or the `providers` list in the client
//! config), the single-string form `<issuer>,<client_id>[,<secret>],<policy>`
//! used on command lines, and the `OPKSSH_PROVIDERS` environment variable
//! (comma-of-semicolon-joined strings). All three produce the same struct.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::AuthError;
use crate::policy::files::{check_perms, OwnerSpec};

/// Alias reserved for "let the user pick interactively". Interactive
/// choosers live outside this crate; resolution falls back to the sole
/// configured provider.
pub const WEBCHOOSER_ALIAS: &str = "WEBCHOOSER";

/// Comma-joined provider strings (entries separated by `;`).
pub const PROVIDERS_ENV: &str = "OPKSSH_PROVIDERS";
/// Default provider alias.
pub const DEFAULT_ALIAS_ENV: &str = "OPKSSH_DEFAULT";

/// When a PK token stops being acceptable, independent of the certificate
/// validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationPolicy {
    /// Honor the ID token's own `exp`.
    #[default]
    Oidc,
    /// Honor the refreshed ID token's `exp`; requires a refresh member.
    OidcRefreshed,
    /// Accept tokens younger than the given age, regardless of `exp`.
    MaxAge(Duration),
    /// Accept anything. Test environments only.
    NeverExpire,
}

impl std::str::FromStr for ExpirationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oidc" => Ok(Self::Oidc),
            "oidc_refreshed" => Ok(Self::OidcRefreshed),
            "never_expire" => Ok(Self::NeverExpire),
            other => match other.strip_prefix("max_age:") {
                Some(age) => humantime::parse_duration(age.trim())
                    .map(Self::MaxAge)
                    .map_err(|e| format!("invalid max_age duration '{age}': {e}")),
                None => Err(format!(
                    "unknown expiration policy '{other}' \
                     (expected oidc, oidc_refreshed, max_age:<duration>, never_expire)"
                )),
            },
        }
    }
}

impl std::fmt::Display for ExpirationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oidc => f.write_str("oidc"),
            Self::OidcRefreshed => f.write_str("oidc_refreshed"),
            Self::MaxAge(d) => write!(f, "max_age:{}", humantime::format_duration(*d)),
            Self::NeverExpire => f.write_str("never_expire"),
        }
    }
}

impl Serialize for ExpirationPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExpirationPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "email".to_string(), "profile".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Short name used for `--provider-alias` and `default_provider`.
    #[serde(default)]
    pub alias: Option<String>,
    pub issuer: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Redirect URIs for the login callback; the port of the first usable
    /// one is bound locally.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiration_policy: ExpirationPolicy,
    /// Extended validation: claims that must equal the given values
    /// (GitHub- and GCP-style deployments pin repository or project here).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_claims: HashMap<String, String>,
}

impl ProviderConfig {
    /// Parse `<issuer>,<client_id>[,<client_secret>],<expiration_policy>`.
    pub fn from_string_form(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let (issuer, client_id, client_secret, policy) = match parts.as_slice() {
            [issuer, client_id, policy] => (*issuer, *client_id, None, *policy),
            [issuer, client_id, secret, policy] => {
                (*issuer, *client_id, Some(secret.to_string()), *policy)
            }
            _ => anyhow::bail!(
                "provider string must be <issuer>,<client_id>[,<client_secret>],<policy>, got '{s}'"
            ),
        };
        let config = Self {
            alias: None,
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            client_secret,
            redirect_uris: Vec::new(),
            scopes: default_scopes(),
            expiration_policy: policy
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            extra_claims: HashMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.issuer)
            .with_context(|| format!("issuer is not a URL: {}", self.issuer))?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            anyhow::bail!("issuer must use http or https: {}", self.issuer);
        }
        if self.client_id.is_empty() {
            anyhow::bail!("client_id must not be empty for issuer {}", self.issuer);
        }
        Ok(())
    }

    /// Alias used for lookup; falls back to the issuer host.
    pub fn effective_alias(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => url::Url::parse(&self.issuer)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| self.issuer.clone()),
        }
    }
}

/// Providers from `OPKSSH_PROVIDERS`, if set. Entries are separated by
/// `;`, each entry in the single-string form.
pub fn providers_from_env() -> Result<Option<Vec<ProviderConfig>>> {
    let raw = match std::env::var(PROVIDERS_ENV) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return Ok(None),
    };
    let mut configs = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        configs.push(
            ProviderConfig::from_string_form(entry)
                .with_context(|| format!("parsing {PROVIDERS_ENV} entry '{entry}'"))?,
        );
    }
    Ok(Some(configs))
}

/// Build an alias → config map, rejecting duplicates and the reserved
/// chooser alias.
pub fn providers_map(configs: &[ProviderConfig]) -> Result<HashMap<String, ProviderConfig>> {
    let mut map = HashMap::new();
    for config in configs {
        let alias = config.effective_alias();
        if alias.eq_ignore_ascii_case(WEBCHOOSER_ALIAS) {
            anyhow::bail!("provider alias '{alias}' is reserved");
        }
        if map.insert(alias.clone(), config.clone()).is_some() {
            anyhow::bail!("duplicate provider alias '{alias}'");
        }
    }
    Ok(map)
}

/// Load every `*.yml` under the providers directory, one provider per
/// file, enforcing ownership and mode on each. A file that fails the
/// permission check or does not parse is skipped with an error logged:
/// an untrusted or broken entry must be ignored, and one bad file cannot
/// lock every provider out.
pub fn load_providers_dir(
    dir: &Path,
    owner: &OwnerSpec,
) -> Result<Vec<ProviderConfig>, AuthError> {
    let mut configs = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(configs),
        Err(e) => {
            return Err(AuthError::PolicyFs(format!(
                "cannot read providers directory {}: {e}",
                dir.display()
            )))
        }
    };

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        if let Err(e) = check_perms(&path, owner, &[0o640]) {
            warn!(path = %path.display(), error = %e, "Skipping untrusted provider file");
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AuthError::PolicyFs(format!("cannot read {}: {e}", path.display()))
        })?;
        match serde_yaml::from_str::<ProviderConfig>(&content) {
            Ok(config) => match config.validate() {
                Ok(()) => configs.push(config),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping invalid provider file"
                ),
            },
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "Skipping unparseable provider file"
            ),
        }
    }
    Ok(configs)
}
