//! Shared fixtures: a mock provider wired into a registry, PK tokens
//! bound to fresh ephemeral keys, and policy trees under a tempdir with
//! controlled modes.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use opkssh::keys::EphemeralKey;
use opkssh::pktoken::cic::Cic;
use opkssh::pktoken::PkToken;
use opkssh::policy::files::{current_owner, current_username};
use opkssh::policy::PolicyLoader;
use opkssh::providers::config::{ExpirationPolicy, ProviderConfig};
use opkssh::providers::mock::{MintOptions, MockProvider};
use opkssh::providers::{Provider, ProviderRegistry};
use opkssh::sshcert;

pub const MOCK_ISSUER: &str = "http://oidc.local:9998/";
pub const MOCK_CLIENT_ID: &str = "mock-client";
pub const MOCK_EMAIL: &str = "test-user@zitadel.ch";

pub fn mock_provider() -> MockProvider {
    MockProvider::new(
        MOCK_ISSUER,
        MOCK_CLIENT_ID,
        "subject-1",
        Some(MOCK_EMAIL.to_string()),
    )
}

pub fn mock_config(policy: ExpirationPolicy) -> ProviderConfig {
    ProviderConfig {
        alias: Some("mock".to_string()),
        issuer: MOCK_ISSUER.to_string(),
        client_id: MOCK_CLIENT_ID.to_string(),
        client_secret: None,
        redirect_uris: Vec::new(),
        scopes: vec!["openid".to_string(), "email".to_string()],
        expiration_policy: policy,
        extra_claims: Default::default(),
    }
}

pub fn mock_registry(policy: ExpirationPolicy, provider: MockProvider) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.insert(mock_config(policy), Provider::Mock(provider));
    registry
}

/// A PK token minted by `provider` and bound to a fresh ephemeral key.
pub fn issue_pkt(provider: &MockProvider, opts: MintOptions) -> (EphemeralKey, PkToken) {
    let key = EphemeralKey::generate().expect("keygen");
    let cic = Cic::new(key.public_jwk());
    let opts = MintOptions {
        nonce: Some(cic.nonce()),
        ..opts
    };
    let op = provider.mint(&opts);
    let pkt = PkToken::issue(&key, &cic, op).expect("pk token issue");
    (key, pkt)
}

/// Issue a certificate and return it as the `(type, b64)` argument pair
/// sshd passes to the verifier.
pub fn cert_args(key: &EphemeralKey, pkt: &PkToken) -> (String, String) {
    let now = chrono::Utc::now().timestamp() as u64;
    let cert = sshcert::issue(pkt, key, &[], now).expect("cert issue");
    let openssh = cert.to_openssh().expect("cert encode");
    let mut parts = openssh.split_whitespace();
    let type_arg = parts.next().expect("cert type").to_string();
    let cert_b64 = parts.next().expect("cert blob").to_string();
    (type_arg, cert_b64)
}

/// A policy loader rooted in a tempdir, with the current user standing in
/// for root:opksshuser.
pub fn policy_loader(root: &Path) -> PolicyLoader {
    PolicyLoader {
        system_path: root.join("auth_id"),
        home_root: root.join("home"),
        system_owner: current_owner(),
    }
}

pub fn write_with_mode(path: &Path, content: &str, mode: u32) {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).expect("mkdir");
    }
    std::fs::write(path, content).expect("write");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).expect("chmod");
}

/// Write a system policy file with the canonical mode.
pub fn write_system_policy(loader: &PolicyLoader, rows: &str) {
    write_with_mode(&loader.system_path, rows, 0o640);
}

/// Write the invoking user's own policy file with the canonical mode.
/// Returns the principal it is authoritative for.
pub fn write_own_user_policy(loader: &PolicyLoader, rows: &str) -> String {
    let me = current_username().expect("current user");
    let path = loader.user_policy_path(&me);
    write_with_mode(&path, rows, 0o600);
    me
}

pub fn tamper_b64_segment(segment: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let mut bytes = URL_SAFE_NO_PAD.decode(segment).expect("b64");
    bytes[0] ^= 0x01;
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn tmp_root() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("tempdir")
}
