//! The login pipeline.
//!
//! Generates the ephemeral key, drives the chosen provider to an ID token
//! whose nonce commits to that key, binds the resulting PK token into a
//! self-signed SSH certificate, and drops both halves where ssh will find
//! them. With `--auto-refresh` it then stays resident, refreshing the
//! token a minute before each expiry until interrupted.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::client::{self, ClientConfig};
use crate::jose::{self, CompactJws, IdClaims};
use crate::keys::EphemeralKey;
use crate::pktoken::cic::Cic;
use crate::pktoken::PkToken;
use crate::providers::config::{
    providers_from_env, providers_map, ProviderConfig, DEFAULT_ALIAS_ENV, WEBCHOOSER_ALIAS,
};
use crate::providers::oidc::{OidcProvider, TokenResponse};
use crate::providers::Provider;
use crate::sshcert;

/// Marker comment identifying key files this tool owns and may overwrite.
const KEY_MARKER: &str = "openpubkey";

/// Refresh this long before the token actually expires.
const REFRESH_MARGIN_SECS: i64 = 60;

const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

pub struct LoginCmd {
    pub auto_refresh: bool,
    pub config_path: Option<PathBuf>,
    pub create_config: bool,
    pub disable_browser_open: bool,
    pub print_id_token: bool,
    pub output_key: Option<PathBuf>,
    pub provider_arg: Option<String>,
    pub provider_alias: Option<String>,
}

struct LoginArtifacts {
    key: EphemeralKey,
    pkt: PkToken,
    refresh_token: Option<String>,
    seckey_path: PathBuf,
    pubkey_path: PathBuf,
}

impl LoginCmd {
    pub async fn run(self) -> Result<()> {
        let config_path = match &self.config_path {
            Some(path) => path.clone(),
            None => client::default_config_path()?,
        };

        if self.create_config {
            if config_path.exists() {
                info!(
                    path = %config_path.display(),
                    "--create-config set but config file already exists"
                );
            } else {
                client::create_default_config(&config_path)?;
                return Ok(());
            }
        }

        let config = if config_path.exists() {
            client::load_config(&config_path)?
        } else {
            info!(
                path = %config_path.display(),
                "No client config file found; using built-in defaults \
                 (run `opkssh login --create-config` to write one)"
            );
            ClientConfig::builtin()
        };

        let (provider_config, provider) = self.determine_provider(&config)?;

        if self.auto_refresh {
            if !provider.supports_refresh() {
                anyhow::bail!(
                    "provider {} does not support auto-refresh",
                    provider.issuer()
                );
            }
            self.login_with_refresh(&provider_config, &provider).await
        } else {
            self.login_once(&provider_config, &provider).await.map(|_| ())
        }
    }

    /// Resolve the provider with the documented precedence:
    /// `--provider` > `--provider-alias` > environment > config default >
    /// WEBCHOOSER (which, without an interactive chooser, means the sole
    /// configured provider).
    fn determine_provider(&self, config: &ClientConfig) -> Result<(ProviderConfig, Provider)> {
        if let Some(arg) = &self.provider_arg {
            let cfg = ProviderConfig::from_string_form(arg)
                .context("parsing --provider argument")?;
            let provider = self.make_provider(&cfg)?;
            return Ok((cfg, provider));
        }

        let default_alias = self
            .provider_alias
            .clone()
            .or_else(|| std::env::var(DEFAULT_ALIAS_ENV).ok().filter(|s| !s.is_empty()))
            .or_else(|| config.default_provider.clone())
            .unwrap_or_else(|| WEBCHOOSER_ALIAS.to_string());

        let provider_configs = match providers_from_env()? {
            Some(configs) => configs,
            None => config.providers.clone(),
        };
        if provider_configs.is_empty() {
            anyhow::bail!("no providers configured");
        }

        let chosen = if default_alias.eq_ignore_ascii_case(WEBCHOOSER_ALIAS) {
            if provider_configs.len() == 1 {
                provider_configs.into_iter().next().unwrap()
            } else {
                let aliases: Vec<String> = provider_configs
                    .iter()
                    .map(|c| c.effective_alias())
                    .collect();
                anyhow::bail!(
                    "multiple providers configured; pick one with --provider-alias \
                     (available: {})",
                    aliases.join(", ")
                );
            }
        } else {
            let map = providers_map(&provider_configs)?;
            map.get(&default_alias)
                .cloned()
                .with_context(|| format!("no provider configured for alias {default_alias}"))?
        };

        let provider = self.make_provider(&chosen)?;
        Ok((chosen, provider))
    }

    fn make_provider(&self, cfg: &ProviderConfig) -> Result<Provider> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Provider::Oidc(OidcProvider::new(cfg.issuer.clone(), http)))
    }

    async fn login_once(
        &self,
        cfg: &ProviderConfig,
        provider: &Provider,
    ) -> Result<LoginArtifacts> {
        let key = EphemeralKey::generate()?;
        let cic = Cic::new(key.public_jwk());
        let nonce = cic.nonce();

        let tokens = match provider {
            Provider::Mock(mock) => mock.auth(&nonce),
            Provider::Oidc(oidc) => {
                browser_auth(oidc, cfg, &nonce, self.disable_browser_open).await?
            }
        };

        let op = CompactJws::new(tokens.id_token)?;
        let claims = IdClaims::from_payload(&op.decoded_payload()?)?;
        if claims.nonce.as_deref() != Some(nonce.as_str()) {
            anyhow::bail!("provider returned an ID token with the wrong nonce");
        }

        let pkt = PkToken::issue(&key, &cic, op)?;
        let cert = sshcert::issue(&pkt, &key, &[], Utc::now().timestamp() as u64)?;

        let (seckey_path, pubkey_path) = self.key_paths()?;
        write_keys(&seckey_path, &pubkey_path, &key, &cert)?;

        if self.print_id_token {
            let pretty = serde_json::to_string_pretty(&pkt.op.decoded_payload()?)?;
            println!("id_token:\n{pretty}");
        }
        println!("Keys generated for identity\n{}", identity_summary(&claims));

        Ok(LoginArtifacts {
            key,
            pkt,
            refresh_token: tokens.refresh_token,
            seckey_path,
            pubkey_path,
        })
    }

    /// Login, then keep the certificate fresh until cancelled. Transient
    /// provider failures back off and retry; a rejected token is fatal.
    async fn login_with_refresh(
        &self,
        cfg: &ProviderConfig,
        provider: &Provider,
    ) -> Result<()> {
        let mut artifacts = self.login_once(cfg, provider).await?;
        let mut refresh_token = artifacts
            .refresh_token
            .clone()
            .context("provider returned no refresh token")?;

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?;
        let mut backoff = BACKOFF_INITIAL;

        loop {
            let exp = artifacts.pkt.effective_exp()?;
            let until = (exp - REFRESH_MARGIN_SECS) - Utc::now().timestamp();
            let sleep = Duration::from_secs(until.max(0) as u64);
            info!(
                seconds = sleep.as_secs(),
                "Waiting before refreshing id token"
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted; stopping refresh loop");
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("Terminated; stopping refresh loop");
                    return Ok(());
                }
            }

            match provider.refresh(cfg, &refresh_token).await {
                Ok(tokens) => {
                    backoff = BACKOFF_INITIAL;
                    let refresh_jws = CompactJws::new(tokens.id_token)?;
                    if let Some(new_token) = tokens.refresh_token {
                        refresh_token = new_token;
                    }
                    artifacts.pkt = artifacts.pkt.clone().with_refresh(refresh_jws);

                    let cert = sshcert::issue(
                        &artifacts.pkt,
                        &artifacts.key,
                        &[],
                        Utc::now().timestamp() as u64,
                    )?;
                    write_keys(
                        &artifacts.seckey_path,
                        &artifacts.pubkey_path,
                        &artifacts.key,
                        &cert,
                    )?;
                    info!("Refreshed id token and rewrote SSH certificate");
                }
                Err(crate::errors::AuthError::ProviderNet(e)) => {
                    warn!(
                        error = %e,
                        retry_in = backoff.as_secs(),
                        "Refresh failed; will retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = tokio::signal::ctrl_c() => return Ok(()),
                        _ = sigterm.recv() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(e) => return Err(e).context("provider rejected the refresh"),
            }
        }
    }

    fn key_paths(&self) -> Result<(PathBuf, PathBuf)> {
        match &self.output_key {
            Some(seckey) => {
                let pubkey = PathBuf::from(format!("{}.pub", seckey.display()));
                Ok((seckey.clone(), pubkey))
            }
            None => {
                let home = std::env::var_os("HOME").context("HOME is not set")?;
                pick_default_key_paths(&PathBuf::from(home).join(".ssh"))
            }
        }
    }
}

/// Choose a default key slot the way ssh will search for it: the first of
/// `id_ecdsa`, `id_ed25519` that is either absent or was written by us
/// (marker comment on the public half). A foreign key is never touched.
fn pick_default_key_paths(ssh_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    for name in ["id_ecdsa", "id_ed25519"] {
        let seckey = ssh_dir.join(name);
        let pubkey = PathBuf::from(format!("{}.pub", seckey.display()));

        if !seckey.exists() {
            return Ok((seckey, pubkey));
        }
        if !pubkey.exists() {
            continue;
        }
        match std::fs::read_to_string(&pubkey) {
            Ok(content) => {
                let marker = content.split_whitespace().nth(2);
                if marker == Some(KEY_MARKER) {
                    return Ok((seckey, pubkey));
                }
            }
            Err(e) => {
                warn!(path = %pubkey.display(), error = %e, "Cannot inspect existing key");
            }
        }
    }
    anyhow::bail!(
        "no default ssh key slot free in {}; pass --output-key",
        ssh_dir.display()
    )
}

/// Write the secret key (0600) and the marked certificate line (0644).
fn write_keys(
    seckey_path: &Path,
    pubkey_path: &Path,
    key: &EphemeralKey,
    cert: &ssh_key::certificate::Certificate,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = seckey_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let seckey_pem = key
        .ssh_private()
        .to_openssh(ssh_key::LineEnding::LF)
        .context("encoding ephemeral secret key")?;
    std::fs::write(seckey_path, seckey_pem.as_bytes())
        .with_context(|| format!("writing {}", seckey_path.display()))?;
    std::fs::set_permissions(seckey_path, std::fs::Permissions::from_mode(0o600))?;

    let cert_line = format!(
        "{} {KEY_MARKER}\n",
        cert.to_openssh()
            .context("encoding certificate")?
            .trim_end()
    );
    std::fs::write(pubkey_path, cert_line)
        .with_context(|| format!("writing {}", pubkey_path.display()))?;
    std::fs::set_permissions(pubkey_path, std::fs::Permissions::from_mode(0o644))?;

    println!(
        "Writing opk ssh public key to {} and corresponding secret key to {}",
        pubkey_path.display(),
        seckey_path.display()
    );
    Ok(())
}

fn identity_summary(claims: &IdClaims) -> String {
    match &claims.email {
        Some(email) => format!(
            "Email, sub, issuer, audience:\n{email} {} {} {}",
            claims.sub, claims.iss, claims.aud
        ),
        None => format!(
            "Sub, issuer, audience:\n{} {} {}",
            claims.sub, claims.iss, claims.aud
        ),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<CallbackQuery>>>>;

async fn callback_handler(
    State(slot): State<CallbackSlot>,
    Query(query): Query<CallbackQuery>,
) -> Html<&'static str> {
    if let Some(tx) = slot.lock().expect("callback slot lock").take() {
        let _ = tx.send(query);
    }
    Html("<html><body><p>Login complete. You may close this tab and return to your terminal.</p></body></html>")
}

/// The authorization-code dance: bind one of the registered redirect
/// URIs locally, send the user to the provider with our nonce and PKCE
/// challenge, and trade the returned code at the token endpoint.
async fn browser_auth(
    oidc: &OidcProvider,
    cfg: &ProviderConfig,
    nonce: &str,
    disable_browser_open: bool,
) -> Result<TokenResponse, crate::errors::AuthError> {
    use crate::errors::AuthError;

    let discovery = oidc.discovery().await?;
    let auth_endpoint = discovery.authorization_endpoint.clone().ok_or_else(|| {
        AuthError::ProviderNet(format!(
            "issuer {} advertises no authorization endpoint",
            oidc.issuer()
        ))
    })?;

    let (listener, redirect_uri, callback_path) = bind_redirect(cfg).await?;

    let mut state_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut state_bytes);
    let state = jose::b64u_encode(state_bytes);

    let mut verifier_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut verifier_bytes);
    let code_verifier = jose::b64u_encode(verifier_bytes);
    let code_challenge = jose::b64u_encode(Sha256::digest(code_verifier.as_bytes()));

    let auth_url = url::Url::parse_with_params(
        &auth_endpoint,
        [
            ("response_type", "code"),
            ("client_id", cfg.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", cfg.scopes.join(" ").as_str()),
            ("nonce", nonce),
            ("state", state.as_str()),
            ("code_challenge", code_challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| AuthError::ProviderNet(format!("cannot build authorization URL: {e}")))?;

    let (tx, rx) = oneshot::channel();
    let slot: CallbackSlot = Arc::new(Mutex::new(Some(tx)));
    let app = Router::new()
        .route(&callback_path, get(callback_handler))
        .with_state(slot);
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    if disable_browser_open {
        println!("Open the following URL in your browser to log in:\n{auth_url}");
    } else {
        println!("Opening your browser to log in; URL in case it does not open:\n{auth_url}");
        open_browser(auth_url.as_str());
    }

    let callback = tokio::select! {
        result = rx => result.map_err(|_| {
            AuthError::ProviderNet("login callback channel closed".to_string())
        })?,
        _ = tokio::signal::ctrl_c() => {
            server.abort();
            return Err(AuthError::ProviderNet("login cancelled".to_string()));
        }
    };
    server.abort();

    if let Some(error) = callback.error {
        return Err(AuthError::ProviderNet(format!(
            "provider returned error: {error}"
        )));
    }
    if callback.state.as_deref() != Some(state.as_str()) {
        return Err(AuthError::ProviderNet(
            "login callback state mismatch".to_string(),
        ));
    }
    let code = callback.code.ok_or_else(|| {
        AuthError::ProviderNet("login callback carried no code".to_string())
    })?;

    oidc.exchange_code(cfg, &code, &redirect_uri, &code_verifier).await
}

/// Bind the first registered redirect URI whose port is free.
async fn bind_redirect(
    cfg: &ProviderConfig,
) -> Result<(tokio::net::TcpListener, String, String), crate::errors::AuthError> {
    use crate::errors::AuthError;

    let mut candidates = cfg.redirect_uris.clone();
    if candidates.is_empty() {
        candidates.push("http://localhost:3000/login-callback".to_string());
    }

    for candidate in &candidates {
        let parsed = url::Url::parse(candidate).map_err(|e| {
            AuthError::ProviderNet(format!("invalid redirect URI {candidate}: {e}"))
        })?;
        let port = parsed.port().unwrap_or(80);
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                return Ok((listener, candidate.clone(), parsed.path().to_string()));
            }
            Err(e) => {
                warn!(uri = %candidate, error = %e, "Redirect port unavailable; trying next");
            }
        }
    }
    Err(AuthError::ProviderNet(
        "no registered redirect URI port is free".to_string(),
    ))
}

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let launcher = "open";
    #[cfg(not(target_os = "macos"))]
    let launcher = "xdg-open";

    if let Err(e) = std::process::Command::new(launcher).arg(url).spawn() {
        warn!(error = %e, "Could not open a browser; use the printed URL");
    }
}
