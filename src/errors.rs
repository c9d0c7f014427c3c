use thiserror::Error;

/// Every way a verification or policy operation can fail.
///
/// The verifier maps each failure onto one of these kinds, logs the kind to
/// its file log, and exits nonzero with nothing on stdout. A deny is never
/// recovered into an allow.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A trusted file (policy, provider registry, server config) has the
    /// wrong owner, group, or mode. Fatal for that file.
    #[error("{0}")]
    ConfigPerms(String),

    /// Malformed YAML or policy row. Fatal for that file or row only.
    #[error("failed to parse {0}")]
    ConfigParse(String),

    /// The token's issuer is not registered under the providers directory.
    #[error("no provider registered for issuer {0}")]
    ProviderUnknown(String),

    /// Discovery, JWKS, or token-endpoint request failed.
    #[error("provider request failed: {0}")]
    ProviderNet(String),

    /// A signature in the PK token (provider or ephemeral key) does not
    /// verify, or a JWS segment is malformed.
    #[error("PK token signature invalid: {0}")]
    PktBadSig(String),

    /// The nonce does not bind the provider-signed payload to the
    /// ephemeral key.
    #[error("PK token binding invalid: {0}")]
    PktBind(String),

    /// The token is stale under the provider's expiration policy.
    #[error("PK token expired: {0}")]
    PktExpired(String),

    /// The `iss` claim does not match the resolved provider.
    #[error("PK token issuer mismatch: expected {expected}, got {got}")]
    PktIssuer { expected: String, got: String },

    /// The `aud` claim does not contain an allowed audience.
    #[error("PK token audience not allowed: {0}")]
    PktAudience(String),

    /// A provider-specific extended validation rule rejected the claims.
    #[error("PK token claim check failed: {0}")]
    PktClaims(String),

    /// The certificate does not carry a PK token extension.
    #[error("certificate has no PK token extension")]
    CertNoPkt,

    /// The offered key is not a certificate of the supported type.
    #[error("unsupported certificate type: {0}")]
    CertType(String),

    /// A policy file could not be trusted or read.
    #[error("policy file rejected: {0}")]
    PolicyFs(String),

    /// No policy row authorizes this identity for the requested principal.
    #[error("no policy row authorizes this identity")]
    PolicyDeny,

    /// The privileged helper was invoked without the required uid.
    #[error("privileged helper invoked without required uid")]
    HelperRefused,
}

impl AuthError {
    /// Stable error-kind label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::ConfigPerms(_) => "CONFIG_PERMS",
            AuthError::ConfigParse(_) => "CONFIG_PARSE",
            AuthError::ProviderUnknown(_) => "PROVIDER_UNKNOWN",
            AuthError::ProviderNet(_) => "PROVIDER_NET",
            AuthError::PktBadSig(_) => "PKT_BAD_SIG",
            AuthError::PktBind(_) => "PKT_BIND",
            AuthError::PktExpired(_) => "PKT_EXPIRED",
            AuthError::PktIssuer { .. } => "PKT_ISSUER",
            AuthError::PktAudience(_) => "PKT_AUDIENCE",
            AuthError::PktClaims(_) => "PKT_CLAIMS",
            AuthError::CertNoPkt => "CERT_NO_PKT",
            AuthError::CertType(_) => "CERT_TYPE",
            AuthError::PolicyFs(_) => "POLICY_FS",
            AuthError::PolicyDeny => "POLICY_DENY",
            AuthError::HelperRefused => "HELPER_REFUSED",
        }
    }
}
