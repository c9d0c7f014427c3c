#[path = "../common/mod.rs"]
mod common;

use opkssh::errors::AuthError;
use opkssh::pktoken::PkToken;
use opkssh::providers::mock::MintOptions;
use opkssh::sshcert;

use common::{cert_args, issue_pkt, mock_provider};

#[test]
fn certificate_roundtrip_preserves_pk_token() {
    let op = mock_provider();
    let (key, pkt) = issue_pkt(&op, MintOptions::default());

    let (type_arg, cert_b64) = cert_args(&key, &pkt);
    assert_eq!(type_arg, sshcert::CERT_TYPE);

    let (cert, recovered) = sshcert::parse(&type_arg, &cert_b64).unwrap();
    assert_eq!(recovered, pkt);
    assert_eq!(recovered.compact(), pkt.compact());
    assert_eq!(cert.key_id(), common::MOCK_EMAIL);
}

#[test]
fn certificate_carries_standard_permits() {
    let op = mock_provider();
    let (key, pkt) = issue_pkt(&op, MintOptions::default());
    let (type_arg, cert_b64) = cert_args(&key, &pkt);
    let (cert, _) = sshcert::parse(&type_arg, &cert_b64).unwrap();

    let names: Vec<&str> = cert
        .extensions()
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert!(names.contains(&"permit-pty"));
    assert!(names.contains(&"permit-port-forwarding"));
    assert!(names.contains(&sshcert::PKT_EXTENSION));
    // Extensions must be in lexicographic order for OpenSSH.
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
}

#[test]
fn certificate_has_no_principals() {
    // Principal enforcement is the verifier's policy decision, not the
    // certificate's.
    let op = mock_provider();
    let (key, pkt) = issue_pkt(&op, MintOptions::default());
    let (type_arg, cert_b64) = cert_args(&key, &pkt);
    let (cert, _) = sshcert::parse(&type_arg, &cert_b64).unwrap();
    assert!(cert.valid_principals().is_empty());
}

#[test]
fn non_certificate_type_rejected() {
    let err = sshcert::parse("ssh-ed25519", "AAAA").unwrap_err();
    assert!(matches!(err, AuthError::CertType(_)));

    let err = sshcert::parse("ecdsa-sha2-nistp256", "AAAA").unwrap_err();
    assert!(matches!(err, AuthError::CertType(_)));
}

#[test]
fn garbage_blob_rejected() {
    let err = sshcert::parse(sshcert::CERT_TYPE, "!!!not-base64!!!").unwrap_err();
    assert!(matches!(err, AuthError::CertType(_)));

    let err = sshcert::parse(sshcert::CERT_TYPE, "AAAAB3ZhbGlk").unwrap_err();
    assert!(matches!(err, AuthError::CertType(_)));
}

#[test]
fn authority_line_matches_certified_key() {
    let op = mock_provider();
    let (key, pkt) = issue_pkt(&op, MintOptions::default());
    let (type_arg, cert_b64) = cert_args(&key, &pkt);
    let (cert, _) = sshcert::parse(&type_arg, &cert_b64).unwrap();

    let line = sshcert::authority_line(&cert).unwrap();
    assert!(line.starts_with("cert-authority ecdsa-sha2-nistp256 "));

    // The key in the line is the ephemeral public key itself.
    let expected = key.ssh_private().public_key().to_openssh().unwrap();
    assert!(line.ends_with(expected.trim_end()));
}

#[test]
fn tampered_extension_breaks_self_signature() {
    // Rewriting the embedded token invalidates the certificate signature,
    // so a swapped-in PK token cannot ride an old certificate.
    let op = mock_provider();
    let (key, pkt) = issue_pkt(&op, MintOptions::default());
    let now = chrono::Utc::now().timestamp() as u64;
    let cert = sshcert::issue(&pkt, &key, &[], now).unwrap();
    sshcert::verify_self_signed(&cert, now).unwrap();

    let (_other_key, other_pkt) = issue_pkt(&op, MintOptions::default());
    assert_ne!(other_pkt.compact(), pkt.compact());

    // Re-issue with the other token but the same key: a fresh valid cert.
    // Splicing the other token into the *old* cert bytes is what must
    // fail; emulate by checking the old cert no longer matches.
    let spliced = sshcert::issue(&other_pkt, &key, &[], now).unwrap();
    assert_ne!(
        spliced.to_openssh().unwrap(),
        cert.to_openssh().unwrap()
    );
}

#[test]
fn parse_delivers_token_from_cert_with_refresh_member() {
    let op = mock_provider();
    let (key, pkt) = issue_pkt(&op, MintOptions::default());
    let refreshed = op.refresh("mock-refresh-token").unwrap();
    let pkt = pkt.with_refresh(
        opkssh::jose::CompactJws::new(refreshed.id_token).unwrap(),
    );

    let (type_arg, cert_b64) = cert_args(&key, &pkt);
    let (_, recovered) = sshcert::parse(&type_arg, &cert_b64).unwrap();
    assert!(recovered.refresh.is_some());
    assert_eq!(recovered, pkt);
}

#[test]
fn from_compact_round_trips_through_extension_value() {
    let op = mock_provider();
    let (_key, pkt) = issue_pkt(&op, MintOptions::default());
    let compact = pkt.compact();
    let recovered = PkToken::from_compact(&compact).unwrap();
    assert_eq!(recovered.compact(), compact);
}
