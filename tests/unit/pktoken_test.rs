#[path = "../common/mod.rs"]
mod common;

use chrono::Utc;
use opkssh::errors::AuthError;
use opkssh::jose::CompactJws;
use opkssh::pktoken::PkToken;
use opkssh::providers::config::ExpirationPolicy;
use opkssh::providers::mock::MintOptions;
use opkssh::providers::{verify_pk_token, Provider};

use common::{issue_pkt, mock_config, mock_provider};

#[tokio::test]
async fn issued_token_verifies_under_matching_provider() {
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());

    let config = mock_config(ExpirationPolicy::NeverExpire);
    let provider = Provider::Mock(op);
    let identity = verify_pk_token(&provider, &config, &pkt, Utc::now().timestamp())
        .await
        .unwrap();

    assert_eq!(identity.issuer, common::MOCK_ISSUER);
    assert_eq!(identity.email.as_deref(), Some(common::MOCK_EMAIL));
    assert_eq!(identity.sub, "subject-1");
}

#[test]
fn nonce_commits_to_canonical_cic() {
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());

    let cic = pkt.verify_binding().unwrap();
    let claims = pkt.op_claims().unwrap();
    assert_eq!(claims.nonce.as_deref(), Some(cic.nonce().as_str()));
}

#[test]
fn compact_roundtrip_preserves_every_byte() {
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());

    let encoded = pkt.compact();
    let decoded = PkToken::from_compact(&encoded).unwrap();
    assert_eq!(decoded, pkt);
    assert_eq!(decoded.compact(), encoded);
}

/// Flipping one byte in any signed segment must surface as a signature or
/// binding failure, depending on which layer the byte belongs to.
#[tokio::test]
async fn single_byte_tamper_is_always_caught() {
    let config = mock_config(ExpirationPolicy::NeverExpire);
    let now = Utc::now().timestamp();

    // op signature byte -> provider signature check fails
    {
        let op = mock_provider();
        let (_key, pkt) = issue_pkt(&op, MintOptions::default());
        let tampered = CompactJws::new(format!(
            "{}.{}.{}",
            pkt.op.protected(),
            pkt.op.payload(),
            common::tamper_b64_segment(pkt.op.signature()),
        ))
        .unwrap();
        let pkt = PkToken { op: tampered, ..pkt };
        let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PktBadSig(_)), "got {err:?}");
    }

    // op payload byte -> provider signature no longer covers it
    {
        let op = mock_provider();
        let (_key, pkt) = issue_pkt(&op, MintOptions::default());
        let tampered = CompactJws::new(format!(
            "{}.{}.{}",
            pkt.op.protected(),
            common::tamper_b64_segment(pkt.op.payload()),
            pkt.op.signature(),
        ))
        .unwrap();
        let pkt = PkToken { op: tampered, ..pkt };
        let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PktBadSig(_)), "got {err:?}");
    }

    // cic signature byte -> ephemeral signature check fails
    {
        let op = mock_provider();
        let (_key, pkt) = issue_pkt(&op, MintOptions::default());
        let tampered = CompactJws::new(format!(
            "{}.{}.{}",
            pkt.cic.protected(),
            pkt.cic.payload(),
            common::tamper_b64_segment(pkt.cic.signature()),
        ))
        .unwrap();
        let pkt = PkToken { cic: tampered, ..pkt };
        let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PktBadSig(_)), "got {err:?}");
    }

    // cic protected byte -> binding (payload mismatch or nonce) fails
    {
        let op = mock_provider();
        let (_key, pkt) = issue_pkt(&op, MintOptions::default());
        let tampered = CompactJws::new(format!(
            "{}.{}.{}",
            common::tamper_b64_segment(pkt.cic.protected()),
            pkt.cic.payload(),
            pkt.cic.signature(),
        ))
        .unwrap();
        let pkt = PkToken { cic: tampered, ..pkt };
        let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
            .await
            .unwrap_err();
        assert!(
            matches!(err, AuthError::PktBind(_) | AuthError::PktBadSig(_)),
            "got {err:?}"
        );
    }
}

#[tokio::test]
async fn expired_token_rejected_under_oidc_policy() {
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(
        &op,
        MintOptions {
            lifetime_secs: -5,
            ..Default::default()
        },
    );

    let config = mock_config(ExpirationPolicy::Oidc);
    let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, Utc::now().timestamp())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PktExpired(_)));
}

#[tokio::test]
async fn expired_token_accepted_under_never_expire() {
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(
        &op,
        MintOptions {
            lifetime_secs: -5,
            ..Default::default()
        },
    );

    let config = mock_config(ExpirationPolicy::NeverExpire);
    verify_pk_token(&Provider::Mock(op), &config, &pkt, Utc::now().timestamp())
        .await
        .unwrap();
}

#[tokio::test]
async fn max_age_policy_bounds_token_age() {
    let op = mock_provider();
    let now = Utc::now().timestamp();

    // Fresh token within a generous max_age passes.
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let config = mock_config(ExpirationPolicy::MaxAge(std::time::Duration::from_secs(
        3600,
    )));
    verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap();

    // Backdated iat beyond max_age fails even though exp is fine.
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(
        &op,
        MintOptions {
            extra: [(
                "iat".to_string(),
                serde_json::json!(now - 7200),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        },
    );
    let config = mock_config(ExpirationPolicy::MaxAge(std::time::Duration::from_secs(
        3600,
    )));
    let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PktExpired(_)));
}

#[tokio::test]
async fn oidc_refreshed_policy_needs_valid_refresh_member() {
    let op = mock_provider();
    let now = Utc::now().timestamp();
    let config = mock_config(ExpirationPolicy::OidcRefreshed);

    // No refresh member: denied.
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PktExpired(_)));
}

#[tokio::test]
async fn oidc_refreshed_policy_accepts_refreshed_token() {
    let op = mock_provider();
    let now = Utc::now().timestamp();
    let config = mock_config(ExpirationPolicy::OidcRefreshed);

    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let refreshed = op.refresh("mock-refresh-token").unwrap();
    let pkt = pkt.with_refresh(CompactJws::new(refreshed.id_token).unwrap());

    let identity = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap();
    assert_eq!(identity.sub, "subject-1");
}

#[tokio::test]
async fn audience_and_issuer_mismatches_are_distinct_errors() {
    let now = Utc::now().timestamp();

    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let mut config = mock_config(ExpirationPolicy::NeverExpire);
    config.client_id = "someone-elses-client".to_string();
    let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PktAudience(_)));

    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let mut config = mock_config(ExpirationPolicy::NeverExpire);
    config.issuer = "https://other-issuer.example".to_string();
    let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PktIssuer { .. }));
}

#[tokio::test]
async fn extra_claim_pins_are_enforced() {
    let now = Utc::now().timestamp();

    let op = mock_provider();
    let (_key, pkt) = issue_pkt(
        &op,
        MintOptions {
            extra: [(
                "repository".to_string(),
                serde_json::json!("example/infra"),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        },
    );

    let mut config = mock_config(ExpirationPolicy::NeverExpire);
    config
        .extra_claims
        .insert("repository".to_string(), "example/infra".to_string());
    verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap();

    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let mut config = mock_config(ExpirationPolicy::NeverExpire);
    config
        .extra_claims
        .insert("repository".to_string(), "example/infra".to_string());
    let err = verify_pk_token(&Provider::Mock(op), &config, &pkt, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PktClaims(_)));
}
