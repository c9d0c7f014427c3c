//! The PK token: an OIDC ID token bound to an ephemeral public key.
//!
//! Three compact JWS members travel together: `op` is the provider-signed
//! ID token, `cic` is the ephemeral key's signature over its own client
//! instance claim and the provider payload, and `refresh` (optional) is a
//! provider-signed refreshed ID token. The wire form is a JSON object of
//! the three compact strings; member order is fixed so the encoding is
//! byte-stable through the SSH certificate.

pub mod cic;

use serde::{Deserialize, Serialize};

use crate::errors::AuthError;
use crate::jose::{CompactJws, IdClaims};
use crate::keys::EphemeralKey;
use cic::Cic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkToken {
    pub op: CompactJws,
    pub cic: CompactJws,
    pub refresh: Option<CompactJws>,
}

/// Wire representation. Fields are in alphabetical order so serialization
/// is deterministic.
#[derive(Serialize, Deserialize)]
struct Wire {
    cic: String,
    op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh: Option<String>,
}

impl PkToken {
    /// Assemble a PK token from a provider-signed ID token, signing the CIC
    /// with the ephemeral key. The caller must have used `cic.nonce()` as
    /// the OIDC nonce when obtaining `op`.
    pub fn issue(key: &EphemeralKey, cic: &Cic, op: CompactJws) -> Result<Self, AuthError> {
        let protected = crate::jose::b64u_encode(cic.canonical_json());
        let signing_input = format!("{}.{}", protected, op.payload());
        let signature = key.sign_jws(&signing_input);
        let cic_jws = CompactJws::new(format!("{signing_input}.{signature}"))?;
        Ok(Self {
            op,
            cic: cic_jws,
            refresh: None,
        })
    }

    pub fn with_refresh(mut self, refresh: CompactJws) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Compact wire encoding, the value stored in the certificate
    /// extension.
    pub fn compact(&self) -> String {
        let wire = Wire {
            cic: self.cic.as_str().to_string(),
            op: self.op.as_str().to_string(),
            refresh: self.refresh.as_ref().map(|r| r.as_str().to_string()),
        };
        serde_json::to_string(&wire).expect("PK token serialization cannot fail")
    }

    pub fn from_compact(s: &str) -> Result<Self, AuthError> {
        let wire: Wire = serde_json::from_str(s)
            .map_err(|e| AuthError::PktBadSig(format!("malformed PK token encoding: {e}")))?;
        Ok(Self {
            op: CompactJws::new(wire.op)?,
            cic: CompactJws::new(wire.cic)?,
            refresh: wire.refresh.map(CompactJws::new).transpose()?,
        })
    }

    /// Claims of the provider-signed ID token. Callers must not trust
    /// these before the op signature has been verified.
    pub fn op_claims(&self) -> Result<IdClaims, AuthError> {
        IdClaims::from_payload(&self.op.decoded_payload()?)
    }

    /// Claims of the refreshed ID token, if one is attached.
    pub fn refresh_claims(&self) -> Result<Option<IdClaims>, AuthError> {
        match &self.refresh {
            Some(jws) => Ok(Some(IdClaims::from_payload(&jws.decoded_payload()?)?)),
            None => Ok(None),
        }
    }

    /// Issuer claim read without any verification, used only to pick the
    /// provider that will do the verifying.
    pub fn unverified_issuer(&self) -> Result<String, AuthError> {
        Ok(self.op_claims()?.iss)
    }

    /// Expiration driving the refresh loop: the refreshed token's if
    /// present, else the original's.
    pub fn effective_exp(&self) -> Result<i64, AuthError> {
        match self.refresh_claims()? {
            Some(claims) => Ok(claims.exp),
            None => Ok(self.op_claims()?.exp),
        }
    }

    /// Human-readable identity: email when the provider supplies one,
    /// otherwise `sub@iss`. Used as the certificate KeyId.
    pub fn identity_string(&self) -> Result<String, AuthError> {
        let claims = self.op_claims()?;
        Ok(match claims.email {
            Some(email) => email,
            None => format!("{}@{}", claims.sub, claims.iss),
        })
    }

    /// Check that the token's members bind together:
    /// the cic payload is the op payload, the provider-signed nonce is the
    /// hash of the canonical CIC, and the cic signature verifies with the
    /// ephemeral key the CIC itself carries.
    ///
    /// This says nothing about the provider signature; that is the
    /// provider's job.
    pub fn verify_binding(&self) -> Result<Cic, AuthError> {
        if self.cic.payload() != self.op.payload() {
            return Err(AuthError::PktBind(
                "cic payload differs from ID token payload".to_string(),
            ));
        }

        let cic = Cic::from_header(&self.cic.decoded_header()?)?;

        let claims = self.op_claims()?;
        let nonce = claims.nonce.ok_or_else(|| {
            AuthError::PktBind("ID token has no nonce claim".to_string())
        })?;
        if nonce != cic.nonce() {
            return Err(AuthError::PktBind(
                "nonce does not commit to the client instance claim".to_string(),
            ));
        }

        let upk = cic.upk.verifying_key()?;
        crate::jose::es256_verify(&self.cic.signing_input(), self.cic.signature(), &upk)?;

        Ok(cic)
    }
}
