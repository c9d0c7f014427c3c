//! An in-memory provider that signs its own ID tokens.
//!
//! Used by the test suite and by local development against a stub issuer:
//! it mints ES256 tokens with whatever claims the caller asks for and
//! verifies them against its own key, no network anywhere.

use std::collections::HashMap;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use rand::rngs::OsRng;

use crate::errors::AuthError;
use crate::jose::{self, CompactJws};
use crate::providers::oidc::{verify_jws_with_key, TokenResponse};

const MOCK_KID: &str = "mock-key-1";
const MOCK_REFRESH_TOKEN: &str = "mock-refresh-token";

/// Claim knobs for a minted token. `Default` gives a plain, currently
/// valid token for the provider's configured identity.
#[derive(Debug, Clone, Default)]
pub struct MintOptions {
    pub nonce: Option<String>,
    /// Seconds from now until `exp`; negative mints an already expired
    /// token. Zero means the provider default of one hour.
    pub lifetime_secs: i64,
    /// Extra claims merged into the payload (groups, deployment pins...).
    pub extra: HashMap<String, serde_json::Value>,
}

pub struct MockProvider {
    issuer: String,
    client_id: String,
    sub: String,
    email: Option<String>,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl MockProvider {
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        sub: impl Into<String>,
        email: Option<String>,
    ) -> Self {
        let secret = p256::SecretKey::random(&mut OsRng);
        let pem = secret
            .to_pkcs8_pem(Default::default())
            .expect("P-256 key always encodes to PKCS#8");
        let encoding =
            EncodingKey::from_ec_pem(pem.as_bytes()).expect("PKCS#8 PEM is a valid EC key");

        let point = secret.public_key().to_encoded_point(false);
        let x = jose::b64u_encode(point.x().expect("uncompressed point has x"));
        let y = jose::b64u_encode(point.y().expect("uncompressed point has y"));
        let decoding =
            DecodingKey::from_ec_components(&x, &y).expect("own public key is usable");

        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            sub: sub.into(),
            email,
            encoding,
            decoding,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Mint a signed ID token.
    pub fn mint(&self, opts: &MintOptions) -> CompactJws {
        let now = Utc::now().timestamp();
        let lifetime = if opts.lifetime_secs == 0 {
            3600
        } else {
            opts.lifetime_secs
        };

        let mut payload = serde_json::json!({
            "iss": self.issuer,
            "sub": self.sub,
            "aud": self.client_id,
            "iat": now,
            "exp": now + lifetime,
        });
        let map = payload.as_object_mut().expect("payload is an object");
        if let Some(email) = &self.email {
            map.insert("email".to_string(), serde_json::json!(email));
        }
        if let Some(nonce) = &opts.nonce {
            map.insert("nonce".to_string(), serde_json::json!(nonce));
        }
        for (claim, value) in &opts.extra {
            map.insert(claim.clone(), value.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(MOCK_KID.to_string());
        let token = jsonwebtoken::encode(&header, &payload, &self.encoding)
            .expect("mock signing cannot fail");
        CompactJws::new(token).expect("encoder produced a compact JWS")
    }

    /// The login-side operation: an ID token carrying the given nonce plus
    /// a refresh handle.
    pub fn auth(&self, nonce: &str) -> TokenResponse {
        TokenResponse {
            id_token: self
                .mint(&MintOptions {
                    nonce: Some(nonce.to_string()),
                    ..Default::default()
                })
                .as_str()
                .to_string(),
            refresh_token: Some(MOCK_REFRESH_TOKEN.to_string()),
        }
    }

    /// The refresh operation: a fresh token for the same identity, no
    /// nonce.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        if refresh_token != MOCK_REFRESH_TOKEN {
            return Err(AuthError::ProviderNet(
                "mock provider does not recognize this refresh token".to_string(),
            ));
        }
        Ok(TokenResponse {
            id_token: self.mint(&MintOptions::default()).as_str().to_string(),
            refresh_token: Some(MOCK_REFRESH_TOKEN.to_string()),
        })
    }

    pub fn verify_jws(&self, jws: &CompactJws) -> Result<(), AuthError> {
        verify_jws_with_key(jws, &self.decoding, Algorithm::ES256)
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("issuer", &self.issuer)
            .field("sub", &self.sub)
            .finish()
    }
}
