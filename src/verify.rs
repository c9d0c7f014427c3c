//! The `AuthorizedKeysCommand` core.
//!
//! sshd invokes `opkssh verify <user> <b64cert> <type>` per connection.
//! Everything here either ends in exactly one `cert-authority` line on
//! stdout with exit 0, or in a logged error kind and a nonzero exit with
//! no stdout at all. A deny is never recovered into an allow.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::server::{load_server_config, ServerConfig};
use crate::errors::AuthError;
use crate::policy::files::OwnerSpec;
use crate::policy::PolicyLoader;
use crate::providers::{self, ProviderRegistry};
use crate::sshcert;

pub struct VerifyCmd {
    pub registry: ProviderRegistry,
    pub policy: PolicyLoader,
}

impl VerifyCmd {
    /// Wire up against the real system paths: load and apply the server
    /// config, build the HTTP client with its deadline, and read the
    /// provider registry. Returns the command plus the config that was
    /// applied, so the caller can enforce the total budget.
    pub fn from_system() -> Result<(Self, ServerConfig), AuthError> {
        let system_owner = OwnerSpec::system(crate::paths::SYSTEM_GROUP)?;

        let server_config = load_server_config(
            std::path::Path::new(crate::paths::SERVER_CONFIG),
            &system_owner,
        )?
        .unwrap_or_default();
        server_config.export_env();

        let http = reqwest::Client::builder()
            .timeout(server_config.request_timeout())
            .build()
            .map_err(|e| AuthError::ProviderNet(format!("cannot build HTTP client: {e}")))?;

        let registry = ProviderRegistry::from_dir(
            std::path::Path::new(crate::paths::PROVIDERS_DIR),
            &system_owner,
            &http,
        )?;

        let policy = PolicyLoader {
            system_path: PathBuf::from(crate::paths::SYSTEM_POLICY),
            home_root: PathBuf::from(crate::paths::HOME_ROOT),
            system_owner,
        };

        Ok((Self { registry, policy }, server_config))
    }

    /// Run the verification pipeline and produce the one authority line.
    pub async fn authorized_keys_command(
        &self,
        user: &str,
        cert_b64: &str,
        type_arg: &str,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();

        let (cert, pkt) = sshcert::parse(type_arg, cert_b64)?;
        sshcert::verify_self_signed(&cert, now as u64)?;

        let issuer = pkt.unverified_issuer()?;
        let (config, provider) = self.registry.resolve_issuer(&issuer)?;

        let identity = providers::verify_pk_token(provider, config, &pkt, now).await?;

        self.policy.authorized(user, &identity)?;

        info!(
            user,
            issuer = %identity.issuer,
            sub = %identity.sub,
            email = identity.email.as_deref().unwrap_or(""),
            key_id = %cert.key_id(),
            "Verified PK token and authorized principal"
        );

        sshcert::authority_line(&cert)
    }
}

/// Entry point used by main: run with the total deadline and translate the
/// outcome into the process contract (one stdout line or nothing).
pub async fn run(user: &str, cert_b64: &str, type_arg: &str) -> Result<String, AuthError> {
    let (cmd, server_config) = VerifyCmd::from_system()?;
    match tokio::time::timeout(
        server_config.total_timeout(),
        cmd.authorized_keys_command(user, cert_b64, type_arg),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(user, "Verification exceeded total time budget");
            Err(AuthError::ProviderNet(format!(
                "verification exceeded {}s budget",
                server_config.total_timeout().as_secs()
            )))
        }
    }
}
