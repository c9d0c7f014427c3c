//! OpenID providers behind one capability set.
//!
//! Every provider can state its issuer and verify a JWS it signed; refresh
//! is optional and callers must check for it. The variants are a network
//! provider and the in-memory mock; both feed the same PK token
//! verification pipeline.

pub mod config;
pub mod mock;
pub mod oidc;

use std::path::Path;

use crate::errors::AuthError;
use crate::jose::CompactJws;
use crate::pktoken::PkToken;
use crate::policy::files::OwnerSpec;
use crate::policy::Identity;
use config::{ExpirationPolicy, ProviderConfig};
use mock::MockProvider;
use oidc::{OidcProvider, TokenResponse};

pub enum Provider {
    Oidc(OidcProvider),
    Mock(MockProvider),
}

impl Provider {
    pub fn issuer(&self) -> &str {
        match self {
            Provider::Oidc(p) => p.issuer(),
            Provider::Mock(p) => p.issuer(),
        }
    }

    /// Verify a JWS this provider signed. Signature only; claims are
    /// checked by [`verify_pk_token`].
    pub async fn verify_jws(&self, jws: &CompactJws) -> Result<(), AuthError> {
        match self {
            Provider::Oidc(p) => p.verify_jws(jws).await,
            Provider::Mock(p) => p.verify_jws(jws),
        }
    }

    pub fn supports_refresh(&self) -> bool {
        match self {
            Provider::Oidc(_) => true,
            Provider::Mock(_) => true,
        }
    }

    pub async fn refresh(
        &self,
        config: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        match self {
            Provider::Oidc(p) => p.refresh(config, refresh_token).await,
            Provider::Mock(p) => p.refresh(refresh_token),
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Oidc(p) => write!(f, "Oidc({})", p.issuer()),
            Provider::Mock(p) => write!(f, "Mock({})", p.issuer()),
        }
    }
}

/// The providers the verifier will trust, resolved by issuer.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: Vec<(ProviderConfig, Provider)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the on-disk registry, enforcing file ownership, with
    /// network providers for every entry.
    pub fn from_dir(
        dir: &Path,
        owner: &OwnerSpec,
        http: &reqwest::Client,
    ) -> Result<Self, AuthError> {
        let mut registry = Self::new();
        for cfg in config::load_providers_dir(dir, owner)? {
            let provider = Provider::Oidc(OidcProvider::new(cfg.issuer.clone(), http.clone()));
            registry.insert(cfg, provider);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, config: ProviderConfig, provider: Provider) {
        self.entries.push((config, provider));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the provider for a token's issuer claim.
    pub fn resolve_issuer(&self, issuer: &str) -> Result<&(ProviderConfig, Provider), AuthError> {
        self.entries
            .iter()
            .find(|(cfg, _)| cfg.issuer.trim_end_matches('/') == issuer.trim_end_matches('/'))
            .ok_or_else(|| AuthError::ProviderUnknown(issuer.to_string()))
    }
}

/// The full verification contract for a PK token:
/// provider signature, key binding, issuer, audience, expiration policy,
/// and any provider-specific claim pins. Returns the attested identity.
pub async fn verify_pk_token(
    provider: &Provider,
    config: &ProviderConfig,
    pkt: &PkToken,
    now: i64,
) -> Result<Identity, AuthError> {
    provider.verify_jws(&pkt.op).await?;
    pkt.verify_binding()?;

    let claims = pkt.op_claims()?;
    if claims.iss.trim_end_matches('/') != config.issuer.trim_end_matches('/') {
        return Err(AuthError::PktIssuer {
            expected: config.issuer.clone(),
            got: claims.iss,
        });
    }
    if !claims.aud.contains(&config.client_id) {
        return Err(AuthError::PktAudience(claims.aud.to_string()));
    }

    match config.expiration_policy {
        ExpirationPolicy::Oidc => {
            if now >= claims.exp {
                return Err(AuthError::PktExpired(format!(
                    "exp {} is in the past",
                    claims.exp
                )));
            }
        }
        ExpirationPolicy::OidcRefreshed => {
            let refresh = pkt.refresh.as_ref().ok_or_else(|| {
                AuthError::PktExpired(
                    "policy oidc_refreshed requires a refresh signature".to_string(),
                )
            })?;
            provider.verify_jws(refresh).await?;
            let rclaims = pkt
                .refresh_claims()?
                .expect("refresh member present was just checked");
            if rclaims.iss.trim_end_matches('/') != config.issuer.trim_end_matches('/') {
                return Err(AuthError::PktIssuer {
                    expected: config.issuer.clone(),
                    got: rclaims.iss,
                });
            }
            if rclaims.sub != claims.sub {
                return Err(AuthError::PktBind(
                    "refreshed token is for a different subject".to_string(),
                ));
            }
            if now >= rclaims.exp {
                return Err(AuthError::PktExpired(format!(
                    "refreshed exp {} is in the past",
                    rclaims.exp
                )));
            }
        }
        ExpirationPolicy::MaxAge(max_age) => {
            let age = now - claims.iat;
            if age < 0 || age as u64 >= max_age.as_secs() {
                return Err(AuthError::PktExpired(format!(
                    "token age {age}s exceeds max_age {}s",
                    max_age.as_secs()
                )));
            }
        }
        ExpirationPolicy::NeverExpire => {}
    }

    if !config.extra_claims.is_empty() {
        let payload = pkt.op.decoded_payload()?;
        for (claim, expected) in &config.extra_claims {
            let got = payload.get(claim).and_then(|v| v.as_str());
            if got != Some(expected.as_str()) {
                return Err(AuthError::PktClaims(format!(
                    "claim {claim}: expected '{expected}', got '{}'",
                    got.unwrap_or("<absent>")
                )));
            }
        }
    }

    Ok(Identity::from_claims(&claims))
}
