//! Network-backed OpenID provider.
//!
//! Discovery and JWKS results are cached for the life of the process; the
//! verifier is spawned per SSH connection, so nothing survives across
//! invocations.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::errors::AuthError;
use crate::jose::CompactJws;
use crate::providers::config::ProviderConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    pub jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwksKey {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<JwksKey>,
}

/// What a token or refresh exchange hands back.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub id_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub struct OidcProvider {
    issuer: String,
    http: reqwest::Client,
    discovery: OnceCell<Discovery>,
    jwks: OnceCell<Jwks>,
}

impl OidcProvider {
    pub fn new(issuer: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            issuer: issuer.into(),
            http,
            discovery: OnceCell::new(),
            jwks: OnceCell::new(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub async fn discovery(&self) -> Result<&Discovery, AuthError> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/.well-known/openid-configuration",
                    self.issuer.trim_end_matches('/')
                );
                let resp = self.http.get(&url).send().await.map_err(net_err)?;
                if !resp.status().is_success() {
                    return Err(AuthError::ProviderNet(format!(
                        "discovery at {url} returned {}",
                        resp.status()
                    )));
                }
                resp.json::<Discovery>().await.map_err(net_err)
            })
            .await
    }

    pub async fn jwks(&self) -> Result<&Jwks, AuthError> {
        let discovery = self.discovery().await?;
        self.jwks
            .get_or_try_init(|| async {
                let resp = self
                    .http
                    .get(&discovery.jwks_uri)
                    .send()
                    .await
                    .map_err(net_err)?;
                if !resp.status().is_success() {
                    return Err(AuthError::ProviderNet(format!(
                        "JWKS at {} returned {}",
                        discovery.jwks_uri,
                        resp.status()
                    )));
                }
                resp.json::<Jwks>().await.map_err(net_err)
            })
            .await
    }

    /// Verify a provider-signed JWS against the published keys. Checks the
    /// signature and nothing else.
    pub async fn verify_jws(&self, jws: &CompactJws) -> Result<(), AuthError> {
        let header = jsonwebtoken::decode_header(jws.as_str())
            .map_err(|e| AuthError::PktBadSig(format!("invalid JWS header: {e}")))?;
        let jwks = self.jwks().await?;
        let key = select_key(jwks, header.kid.as_deref(), header.alg)?;
        verify_jws_with_key(jws, &decoding_key(key)?, header.alg)
    }

    /// Exchange an authorization code at the token endpoint.
    pub async fn exchange_code(
        &self,
        config: &ProviderConfig,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", config.client_id.clone()),
            ("code_verifier", code_verifier.to_string()),
        ];
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.token_request(&form).await
    }

    /// Trade a refresh token for a fresh ID token.
    pub async fn refresh(
        &self,
        config: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", config.client_id.clone()),
        ];
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, String)]) -> Result<TokenResponse, AuthError> {
        let endpoint = self
            .discovery()
            .await?
            .token_endpoint
            .clone()
            .ok_or_else(|| {
                AuthError::ProviderNet(format!(
                    "issuer {} advertises no token endpoint",
                    self.issuer
                ))
            })?;
        let resp = self
            .http
            .post(&endpoint)
            .form(form)
            .send()
            .await
            .map_err(net_err)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::ProviderNet(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        resp.json::<TokenResponse>().await.map_err(net_err)
    }
}

fn net_err(e: reqwest::Error) -> AuthError {
    AuthError::ProviderNet(e.to_string())
}

/// Pick the JWKS key for a JWS: by `kid` when the header names one,
/// otherwise the first key of a compatible type.
fn select_key<'a>(
    jwks: &'a Jwks,
    kid: Option<&str>,
    alg: Algorithm,
) -> Result<&'a JwksKey, AuthError> {
    let wanted_kty = match alg {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => "RSA",
        Algorithm::ES256 => "EC",
        other => {
            return Err(AuthError::PktBadSig(format!(
                "unsupported JWS algorithm {other:?}"
            )))
        }
    };
    let found = match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|k| k.kty == wanted_kty && k.kid.as_deref() == Some(kid)),
        None => jwks.keys.iter().find(|k| k.kty == wanted_kty),
    };
    found.ok_or_else(|| {
        AuthError::PktBadSig(format!(
            "no {wanted_kty} key in JWKS matches kid {}",
            kid.unwrap_or("<none>")
        ))
    })
}

fn decoding_key(key: &JwksKey) -> Result<DecodingKey, AuthError> {
    match key.kty.as_str() {
        "RSA" => {
            let n = key.n.as_deref().ok_or_else(|| bad_jwk("missing n"))?;
            let e = key.e.as_deref().ok_or_else(|| bad_jwk("missing e"))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| bad_jwk(&format!("invalid RSA components: {e}")))
        }
        "EC" => {
            let x = key.x.as_deref().ok_or_else(|| bad_jwk("missing x"))?;
            let y = key.y.as_deref().ok_or_else(|| bad_jwk("missing y"))?;
            DecodingKey::from_ec_components(x, y)
                .map_err(|e| bad_jwk(&format!("invalid EC components: {e}")))
        }
        other => Err(bad_jwk(&format!("unsupported kty {other}"))),
    }
}

fn bad_jwk(detail: &str) -> AuthError {
    AuthError::PktBadSig(format!("unusable JWKS key: {detail}"))
}

/// Signature-only JWS verification with a known key. Claim checks (expiry,
/// audience, issuer) are the caller's, so they can map onto the precise
/// error kinds.
pub fn verify_jws_with_key(
    jws: &CompactJws,
    key: &DecodingKey,
    alg: Algorithm,
) -> Result<(), AuthError> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = Default::default();

    match jsonwebtoken::decode::<serde_json::Value>(jws.as_str(), key, &validation) {
        Ok(_) => Ok(()),
        Err(e) => Err(AuthError::PktBadSig(format!(
            "provider signature rejected: {e}"
        ))),
    }
}
