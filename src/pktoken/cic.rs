//! The client instance claim.
//!
//! The CIC is the hinge of the whole scheme: its canonical JSON is hashed
//! into the `nonce` the provider signs, and the same JSON is the protected
//! header of the JWS the ephemeral key signs. Canonical means sorted member
//! names and no whitespace; the structs below keep their fields in
//! alphabetical order so plain serde serialization produces exactly that.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::AuthError;
use crate::jose;
use crate::keys::Jwk;

pub const CIC_TYP: &str = "CIC";
pub const CIC_ALG: &str = "ES256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cic {
    pub alg: String,
    pub rz: String,
    pub typ: String,
    pub upk: Jwk,
}

impl Cic {
    /// Build a CIC for an ephemeral public key with a fresh random nonce
    /// component.
    pub fn new(upk: Jwk) -> Self {
        let mut rz = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut rz);
        Self {
            alg: CIC_ALG.to_string(),
            rz: jose::b64u_encode(rz),
            typ: CIC_TYP.to_string(),
            upk,
        }
    }

    /// Parse a CIC out of a JWS protected header, rejecting anything that
    /// is not exactly a CIC.
    pub fn from_header(header: &serde_json::Value) -> Result<Self, AuthError> {
        let cic: Cic = serde_json::from_value(header.clone())
            .map_err(|e| AuthError::PktBind(format!("protected header is not a CIC: {e}")))?;
        if cic.typ != CIC_TYP {
            return Err(AuthError::PktBind(format!(
                "expected typ {CIC_TYP}, got {}",
                cic.typ
            )));
        }
        if cic.alg != CIC_ALG {
            return Err(AuthError::PktBind(format!(
                "expected alg {CIC_ALG}, got {}",
                cic.alg
            )));
        }
        Ok(cic)
    }

    /// The canonical JSON text: sorted keys, no whitespace.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("CIC serialization cannot fail")
    }

    /// `nonce = b64u(SHA-256(canonical CIC JSON))`, the value the provider
    /// must echo back in the ID token.
    pub fn nonce(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        jose::b64u_encode(digest)
    }
}
