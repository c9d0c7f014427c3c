//! SSH certificate binder.
//!
//! The issued certificate is self-signed: the ephemeral key is both the
//! certified key and the certificate authority. The PK token rides in the
//! `openpubkey-pkt` extension, so an unmodified sshd can carry it to the
//! verifier, and the verifier answers with a `cert-authority` line naming
//! the same ephemeral key.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::public::KeyData;
use ssh_key::HashAlg;

use crate::errors::AuthError;
use crate::keys::EphemeralKey;
use crate::pktoken::PkToken;

/// Certificate extension key carrying the compact PK token. Stable.
pub const PKT_EXTENSION: &str = "openpubkey-pkt";

/// The only certificate type the verifier accepts.
pub const CERT_TYPE: &str = "ecdsa-sha2-nistp256-cert-v01@openssh.com";

/// Certificates become valid a minute in the past to absorb clock skew.
const VALIDITY_BACKDATE_SECS: u64 = 60;

/// Recommended default lifetime; the PK token inside expires much sooner
/// under any policy but `never_expire`.
const VALIDITY_SECS: u64 = 7 * 24 * 60 * 60;

/// Standard OpenSSH permissions granted on issued certificates.
const DEFAULT_PERMITS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Build and self-sign a certificate embedding the PK token.
pub fn issue(
    pkt: &PkToken,
    key: &EphemeralKey,
    principals: &[String],
    now_unix: u64,
) -> Result<Certificate> {
    let valid_after = now_unix.saturating_sub(VALIDITY_BACKDATE_SECS);
    let valid_before = valid_after + VALIDITY_SECS;

    let public = key.ssh_private().public_key().key_data().clone();
    let mut builder = Builder::new_with_random_nonce(&mut OsRng, public, valid_after, valid_before)
        .context("creating certificate builder")?;

    builder
        .cert_type(CertType::User)
        .context("setting certificate type")?;
    builder
        .key_id(pkt.identity_string()?)
        .context("setting certificate key id")?;

    if principals.is_empty() {
        // The server side decides which principals this identity may
        // assume; the certificate itself stays unrestricted.
        builder
            .all_principals_valid()
            .context("marking certificate valid for all principals")?;
    } else {
        for principal in principals {
            builder
                .valid_principal(principal.clone())
                .with_context(|| format!("adding principal {principal}"))?;
        }
    }

    // Extensions must stay lexicographically ordered for OpenSSH;
    // openpubkey-pkt sorts before the permit-* family.
    builder
        .extension(PKT_EXTENSION, pkt.compact())
        .context("embedding PK token extension")?;
    for permit in DEFAULT_PERMITS {
        builder
            .extension(permit, "")
            .with_context(|| format!("adding extension {permit}"))?;
    }

    builder
        .sign(key.ssh_private())
        .context("self-signing certificate with ephemeral key")
}

/// Parse the certificate sshd handed us and pull out the PK token.
pub fn parse(type_arg: &str, cert_b64: &str) -> Result<(Certificate, PkToken), AuthError> {
    if type_arg != CERT_TYPE {
        return Err(AuthError::CertType(type_arg.to_string()));
    }

    let blob = STANDARD
        .decode(cert_b64.trim())
        .map_err(|e| AuthError::CertType(format!("certificate is not base64: {e}")))?;
    let cert = Certificate::from_bytes(&blob)
        .map_err(|e| AuthError::CertType(format!("certificate does not parse: {e}")))?;

    if cert.cert_type() != CertType::User {
        return Err(AuthError::CertType(format!(
            "{:?} certificate offered for user auth",
            cert.cert_type()
        )));
    }
    // The type argument comes from sshd, but the blob is what gets
    // verified; they must agree.
    if !is_p256(&cert) {
        return Err(AuthError::CertType(format!(
            "certificate key is {}, not ECDSA P-256",
            cert.algorithm()
        )));
    }

    let compact = cert
        .extensions()
        .iter()
        .find(|(name, _)| name.as_str() == PKT_EXTENSION)
        .map(|(_, value)| value.clone())
        .ok_or(AuthError::CertNoPkt)?;

    let pkt = PkToken::from_compact(&compact)?;
    Ok((cert, pkt))
}

/// Check the certificate's own signature: it must be signed by the key it
/// certifies, our self-issuance invariant.
pub fn verify_self_signed(cert: &Certificate, now_unix: u64) -> Result<(), AuthError> {
    let fingerprint = cert.public_key().fingerprint(HashAlg::Sha256);
    cert.validate_at(now_unix, [&fingerprint])
        .map_err(|e| AuthError::PktBadSig(format!("certificate self-signature invalid: {e}")))
}

/// The single line the verifier prints for sshd: trust the ephemeral key
/// as a certificate authority.
pub fn authority_line(cert: &Certificate) -> Result<String, AuthError> {
    let key = ssh_key::PublicKey::from(cert.public_key().clone());
    let openssh = key
        .to_openssh()
        .map_err(|e| AuthError::CertType(format!("cannot encode certificate public key: {e}")))?;
    Ok(format!("cert-authority {}", openssh.trim_end()))
}

/// True when the certified key is ECDSA P-256, matching [`CERT_TYPE`].
pub fn is_p256(cert: &Certificate) -> bool {
    matches!(
        cert.public_key(),
        KeyData::Ecdsa(ssh_key::public::EcdsaPublicKey::NistP256(_))
    )
}
