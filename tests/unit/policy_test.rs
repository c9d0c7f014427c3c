#[path = "../common/mod.rs"]
mod common;

use std::os::unix::fs::PermissionsExt;

use opkssh::errors::AuthError;
use opkssh::policy::files::current_owner;
use opkssh::policy::helper::append_row;
use opkssh::policy::{Identity, PolicyRow};

use common::{
    policy_loader, tmp_root, write_own_user_policy, write_system_policy, write_with_mode,
    MOCK_ISSUER,
};

fn identity(email: &str) -> Identity {
    Identity {
        issuer: MOCK_ISSUER.to_string(),
        sub: "subject-1".to_string(),
        email: Some(email.to_string()),
        groups: vec!["devs".to_string()],
    }
}

#[test]
fn system_policy_row_authorizes_matching_identity() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    write_system_policy(&loader, &format!("test test-user@zitadel.ch {MOCK_ISSUER}\n"));

    loader
        .authorized("test", &identity("test-user@zitadel.ch"))
        .unwrap();

    let err = loader
        .authorized("test2", &identity("test-user@zitadel.ch"))
        .unwrap_err();
    assert!(matches!(err, AuthError::PolicyDeny));

    let err = loader
        .authorized("test", &identity("someone-else@zitadel.ch"))
        .unwrap_err();
    assert!(matches!(err, AuthError::PolicyDeny));
}

#[test]
fn decision_is_independent_of_row_order() {
    let rows = [
        format!("alice alice@example.com {MOCK_ISSUER}"),
        format!("test test-user@zitadel.ch {MOCK_ISSUER}"),
        format!("bob subject-9 {MOCK_ISSUER}"),
    ];

    // Try every rotation of the rows; the decision must never change.
    for rotation in 0..rows.len() {
        let mut ordered: Vec<&String> = rows.iter().collect();
        ordered.rotate_left(rotation);
        let content = ordered
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let tmp = tmp_root();
        let loader = policy_loader(tmp.path());
        write_system_policy(&loader, &content);

        loader
            .authorized("test", &identity("test-user@zitadel.ch"))
            .unwrap();
        assert!(loader
            .authorized("mallory", &identity("test-user@zitadel.ch"))
            .is_err());
    }
}

#[test]
fn wrong_mode_rejects_file_regardless_of_contents() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    write_system_policy(&loader, &format!("test test-user@zitadel.ch {MOCK_ISSUER}\n"));
    std::fs::set_permissions(
        &loader.system_path,
        std::fs::Permissions::from_mode(0o677),
    )
    .unwrap();

    let err = loader
        .authorized("test", &identity("test-user@zitadel.ch"))
        .unwrap_err();
    assert!(matches!(err, AuthError::ConfigPerms(_)));
}

#[test]
fn world_readable_system_policy_rejected() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    write_system_policy(&loader, &format!("test test-user@zitadel.ch {MOCK_ISSUER}\n"));
    std::fs::set_permissions(
        &loader.system_path,
        std::fs::Permissions::from_mode(0o644),
    )
    .unwrap();

    assert!(loader
        .authorized("test", &identity("test-user@zitadel.ch"))
        .is_err());
}

#[test]
fn missing_system_policy_still_honors_user_tier() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    let me = opkssh::policy::files::current_username().unwrap();
    write_own_user_policy(
        &loader,
        &format!("{me} test-user@zitadel.ch {MOCK_ISSUER}\n"),
    );

    loader
        .authorized(&me, &identity("test-user@zitadel.ch"))
        .unwrap();
}

#[test]
fn user_policy_rows_for_foreign_principals_ignored() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    let me = write_own_user_policy(
        &loader,
        &format!("root test-user@zitadel.ch {MOCK_ISSUER}\n"),
    );

    if me != "root" {
        // The row claims "root" from a file that only speaks for `me`.
        assert!(loader
            .authorized("root", &identity("test-user@zitadel.ch"))
            .is_err());
        assert!(loader
            .authorized(&me, &identity("test-user@zitadel.ch"))
            .is_err());
    }
}

#[test]
fn user_policy_with_loose_mode_ignored() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    let me = opkssh::policy::files::current_username().unwrap();
    let path = loader.user_policy_path(&me);
    write_with_mode(
        &path,
        &format!("{me} test-user@zitadel.ch {MOCK_ISSUER}\n"),
        0o644,
    );

    assert!(loader
        .authorized(&me, &identity("test-user@zitadel.ch"))
        .is_err());
}

#[test]
fn group_rows_match_groups_claim() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    write_system_policy(&loader, &format!("deploy oidc-groups {MOCK_ISSUER} group=devs\n"));

    loader.authorized("deploy", &identity("any@example.com")).unwrap();

    let mut no_groups = identity("any@example.com");
    no_groups.groups.clear();
    assert!(loader.authorized("deploy", &no_groups).is_err());
}

#[test]
fn malformed_rows_do_not_poison_the_file() {
    let tmp = tmp_root();
    let loader = policy_loader(tmp.path());
    write_system_policy(
        &loader,
        &format!(
            "# comment\nbroken-row-without-columns\ntest test-user@zitadel.ch {MOCK_ISSUER}\n"
        ),
    );

    loader
        .authorized("test", &identity("test-user@zitadel.ch"))
        .unwrap();
}

#[test]
fn append_row_dedup_and_atomicity() {
    let tmp = tmp_root();
    let path = tmp.path().join("auth_id");
    let row = PolicyRow {
        principal: "test".to_string(),
        identity: "alice@example.com".to_string(),
        issuer: MOCK_ISSUER.to_string(),
        group: None,
    };

    assert!(append_row(&path, &row, 0o640, None).unwrap());
    // Identical append is a no-op.
    assert!(!append_row(&path, &row, 0o640, None).unwrap());
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.matches("alice@example.com").count(), 1);

    // A distinct identity still goes through.
    let other = PolicyRow {
        identity: "bob@example.com".to_string(),
        ..row.clone()
    };
    assert!(append_row(&path, &other, 0o640, None).unwrap());
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 2);

    // Appends are full rows; no partial lines ever land.
    for line in content.lines() {
        assert!(PolicyRow::parse(line).unwrap().is_some());
    }
}

#[test]
fn append_row_refuses_mis_owned_target() {
    let tmp = tmp_root();
    let path = tmp.path().join("auth_id");
    write_with_mode(&path, "", 0o666);

    let row = PolicyRow {
        principal: "test".to_string(),
        identity: "alice@example.com".to_string(),
        issuer: MOCK_ISSUER.to_string(),
        group: None,
    };
    let owner = current_owner();
    let err = append_row(&path, &row, 0o640, Some((&owner, &[0o640]))).unwrap_err();
    assert!(matches!(err, AuthError::ConfigPerms(_)));
}

#[test]
fn concurrent_appends_serialize_without_losing_rows() {
    let tmp = tmp_root();
    let path = tmp.path().join("auth_id");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            std::thread::spawn(move || {
                let row = PolicyRow {
                    principal: "test".to_string(),
                    identity: format!("user{i}@example.com"),
                    issuer: MOCK_ISSUER.to_string(),
                    group: None,
                };
                append_row(&path, &row, 0o640, None).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 8);
    for i in 0..8 {
        assert!(content.contains(&format!("user{i}@example.com")));
    }
}
