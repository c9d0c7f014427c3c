//! The per-login ephemeral key.
//!
//! One EC P-256 key plays both of its roles from a single source of truth:
//! it signs the client instance claim inside the PK token (ES256) and acts
//! as the certificate authority for the issued SSH certificate. Only the
//! public half ever leaves the client host.

use anyhow::{Context, Result};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use ssh_key::private::{EcdsaKeypair, KeypairData};
use ssh_key::{Algorithm, EcdsaCurve, PrivateKey};

use crate::errors::AuthError;
use crate::jose;

/// JWK form of the ephemeral public key, embedded in the CIC as `upk`.
///
/// Field order is alphabetical so that serializing the struct yields the
/// canonical member order the nonce hash depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub crv: String,
    pub kty: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        Self {
            crv: "P-256".to_string(),
            kty: "EC".to_string(),
            x: jose::b64u_encode(point.x().expect("uncompressed point has x")),
            y: jose::b64u_encode(point.y().expect("uncompressed point has y")),
        }
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, AuthError> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(AuthError::PktBadSig(format!(
                "unsupported upk key type {}/{}",
                self.kty, self.crv
            )));
        }
        let x = jose::b64u_decode(&self.x)?;
        let y = jose::b64u_decode(&self.y)?;
        if x.len() != 32 || y.len() != 32 {
            return Err(AuthError::PktBadSig(
                "upk coordinates must be 32 bytes".to_string(),
            ));
        }
        let point = p256::EncodedPoint::from_affine_coordinates(
            p256::FieldBytes::from_slice(&x),
            p256::FieldBytes::from_slice(&y),
            false,
        );
        VerifyingKey::from_encoded_point(&point)
            .map_err(|e| AuthError::PktBadSig(format!("upk is not a valid P-256 point: {e}")))
    }
}

/// The ephemeral key in both of its forms.
pub struct EphemeralKey {
    ssh: PrivateKey,
    signer: SigningKey,
}

impl EphemeralKey {
    /// Generate a fresh P-256 key.
    pub fn generate() -> Result<Self> {
        let ssh = PrivateKey::random(
            &mut OsRng,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        )
        .context("generating ephemeral P-256 key")?;
        Self::from_ssh(ssh)
    }

    /// Wrap an existing SSH private key, extracting the ES256 signer.
    pub fn from_ssh(ssh: PrivateKey) -> Result<Self> {
        let signer = match ssh.key_data() {
            KeypairData::Ecdsa(EcdsaKeypair::NistP256 { private, .. }) => {
                SigningKey::from_slice(private.as_slice())
                    .context("ephemeral key scalar is not a valid P-256 secret")?
            }
            other => anyhow::bail!(
                "ephemeral key must be ECDSA P-256, got {}",
                other.algorithm().map(|a| a.to_string()).unwrap_or_default()
            ),
        };
        Ok(Self { ssh, signer })
    }

    pub fn ssh_private(&self) -> &PrivateKey {
        &self.ssh
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signer.verifying_key()
    }

    pub fn public_jwk(&self) -> Jwk {
        Jwk::from_verifying_key(self.signer.verifying_key())
    }

    /// ES256-sign a JWS signing input, returning the signature segment.
    pub fn sign_jws(&self, signing_input: &str) -> String {
        jose::es256_sign(signing_input, &self.signer)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("algorithm", &self.ssh.algorithm().to_string())
            .finish()
    }
}
