//! Minimal JOSE plumbing shared by the PK token and providers.
//!
//! A compact JWS is kept as the raw `protected.payload.signature` string so
//! that signatures stay verifiable byte-for-byte; nothing here re-encodes a
//! segment it did not produce.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::errors::AuthError;

pub fn b64u_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64u_decode(s: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| AuthError::PktBadSig(format!("invalid base64url segment: {e}")))
}

/// A compact JWS held in its raw wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactJws {
    raw: String,
}

impl CompactJws {
    /// Accept a `header.payload.signature` string. The segments are checked
    /// for shape only; nothing is verified.
    pub fn new(raw: impl Into<String>) -> Result<Self, AuthError> {
        let raw = raw.into();
        if raw.splitn(4, '.').count() != 3 {
            return Err(AuthError::PktBadSig(
                "compact JWS must have exactly three segments".to_string(),
            ));
        }
        Ok(Self { raw })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn segment(&self, idx: usize) -> &str {
        // new() guaranteed three segments
        self.raw.split('.').nth(idx).unwrap_or("")
    }

    /// Base64url-encoded protected header segment.
    pub fn protected(&self) -> &str {
        self.segment(0)
    }

    /// Base64url-encoded payload segment.
    pub fn payload(&self) -> &str {
        self.segment(1)
    }

    /// Base64url-encoded signature segment.
    pub fn signature(&self) -> &str {
        self.segment(2)
    }

    /// The signing input (`protected || '.' || payload`).
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.protected(), self.payload())
    }

    pub fn decoded_header(&self) -> Result<serde_json::Value, AuthError> {
        let bytes = b64u_decode(self.protected())?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::PktBadSig(format!("invalid JWS header JSON: {e}")))
    }

    pub fn decoded_payload(&self) -> Result<serde_json::Value, AuthError> {
        let bytes = b64u_decode(self.payload())?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::PktBadSig(format!("invalid JWS payload JSON: {e}")))
    }
}

impl std::fmt::Display for CompactJws {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Sign a JWS signing input with ES256, returning the base64url `r || s`
/// signature segment.
pub fn es256_sign(signing_input: &str, key: &SigningKey) -> String {
    let signature: Signature = key.sign(signing_input.as_bytes());
    b64u_encode(signature.to_bytes())
}

/// Verify an ES256 `r || s` signature segment against a signing input.
pub fn es256_verify(
    signing_input: &str,
    signature_b64: &str,
    key: &VerifyingKey,
) -> Result<(), AuthError> {
    let sig_bytes = b64u_decode(signature_b64)?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| AuthError::PktBadSig(format!("malformed ES256 signature: {e}")))?;
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| AuthError::PktBadSig("ES256 signature verification failed".to_string()))
}

/// An `aud` claim, which providers emit either as a string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, wanted: &str) -> bool {
        match self {
            Audience::One(a) => a == wanted,
            Audience::Many(list) => list.iter().any(|a| a == wanted),
        }
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Audience::One(a) => f.write_str(a),
            Audience::Many(list) => f.write_str(&list.join(",")),
        }
    }
}

/// The ID-token claims the pipeline consumes. Unknown claims are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl IdClaims {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, AuthError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| AuthError::PktBadSig(format!("ID token claims malformed: {e}")))
    }
}
