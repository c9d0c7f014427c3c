//! The privileged side of policy writes.
//!
//! Unprivileged sessions cannot touch `/etc/opk/auth_id` or read another
//! user's 0600 policy file, so `add` and `readhome` re-invoke this same
//! binary under `sudo -n` (a sudoers drop-in permits exactly that). The
//! helper trusts nothing from the pre-exec process: it re-validates every
//! argument and re-checks file ownership before acting.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::Uid;
use tracing::{info, warn};

use crate::errors::AuthError;
use crate::policy::files::{self, DirLock, OwnerSpec};
use crate::policy::{parse_policy, valid_principal, PolicyLoader, PolicyRow};

/// `opkssh add <principal> <identity> <issuer>`.
#[derive(Debug)]
pub struct AddCmd {
    pub principal: String,
    pub identity: String,
    pub issuer: String,
    pub loader: PolicyLoader,
}

impl AddCmd {
    /// Append one policy row, choosing the target tier:
    /// the invoker's own user policy when the principal is the invoker,
    /// the system policy when running as root, and a `sudo -n` re-exec of
    /// ourselves otherwise. Returns the file that gained the row.
    pub fn run(&self) -> Result<PathBuf, AuthError> {
        let row = self.validated_row()?;
        let me = files::current_username()?;

        if row.principal == me {
            let path = self.loader.user_policy_path(&me);
            self.append_user_row(&path, &row)?;
            return Ok(path);
        }

        if Uid::effective().is_root() {
            let path = self.loader.system_path.clone();
            append_row(
                &path,
                &row,
                0o640,
                Some((&self.loader.system_owner, &[0o640])),
            )?;
            return Ok(path);
        }

        // Not our file and not root: hand the request to the helper.
        sudo_reexec_add(&row)?;
        Ok(self.loader.system_path.clone())
    }

    /// Re-validate the arguments. Runs on both sides of the sudo
    /// boundary; the helper never trusts the pre-exec state.
    fn validated_row(&self) -> Result<PolicyRow, AuthError> {
        if !valid_principal(&self.principal) {
            return Err(AuthError::ConfigParse(format!(
                "principal '{}'",
                self.principal
            )));
        }
        for (label, value) in [("identity", &self.identity), ("issuer", &self.issuer)] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(AuthError::ConfigParse(format!(
                    "{label} '{value}' must be a single non-empty token"
                )));
            }
        }
        let line = format!("{} {} {}", self.principal, self.identity, self.issuer);
        match PolicyRow::parse(&line) {
            Ok(Some(row)) => Ok(row),
            _ => Err(AuthError::ConfigParse(format!("policy row '{line}'"))),
        }
    }

    fn append_user_row(&self, path: &Path, row: &PolicyRow) -> Result<bool, AuthError> {
        let opk_dir = path.parent().ok_or_else(|| {
            AuthError::PolicyFs(format!("{} has no parent directory", path.display()))
        })?;
        if !opk_dir.exists() {
            std::fs::create_dir_all(opk_dir).map_err(|e| {
                AuthError::PolicyFs(format!("cannot create {}: {e}", opk_dir.display()))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    opk_dir,
                    std::fs::Permissions::from_mode(0o700),
                );
            }
        }
        append_row(path, row, 0o600, Some((&files::current_owner(), &[0o600])))
    }
}

/// Append a row under the directory lock, verifying ownership of an
/// existing target first and refusing duplicates. Returns whether a row
/// was actually written.
pub fn append_row(
    path: &Path,
    row: &PolicyRow,
    mode: u32,
    owner_check: Option<(&OwnerSpec, &[u32])>,
) -> Result<bool, AuthError> {
    let dir = path.parent().ok_or_else(|| {
        AuthError::PolicyFs(format!("{} has no parent directory", path.display()))
    })?;
    let _lock = DirLock::acquire(dir).map_err(|e| {
        AuthError::PolicyFs(format!("cannot lock {}: {e}", dir.display()))
    })?;

    let existing = files::read_if_exists(path)
        .map_err(|e| AuthError::PolicyFs(format!("cannot read {}: {e}", path.display())))?;

    if existing.is_some() {
        if let Some((owner, modes)) = owner_check {
            files::check_perms(path, owner, modes)?;
        }
    }

    let existing = existing.unwrap_or_default();
    let already = parse_policy(&existing, path).into_iter().any(|r| r == *row);
    if already {
        info!(path = %path.display(), row = %row.to_line(), "Policy row already present");
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&row.to_line());
    content.push('\n');

    files::atomic_write(path, &content, mode)
        .map_err(|e| AuthError::PolicyFs(format!("cannot write {}: {e}", path.display())))?;
    info!(path = %path.display(), row = %row.to_line(), "Added policy row");
    Ok(true)
}

/// Re-invoke ourselves as `sudo -n opkssh add ...`.
fn sudo_reexec_add(row: &PolicyRow) -> Result<(), AuthError> {
    let exe = std::env::current_exe().map_err(|e| {
        AuthError::PolicyFs(format!("cannot locate own executable: {e}"))
    })?;
    let status = Command::new("sudo")
        .arg("-n")
        .arg(exe)
        .arg("add")
        .arg(&row.principal)
        .arg(&row.identity)
        .arg(&row.issuer)
        .status()
        .map_err(|e| AuthError::PolicyFs(format!("cannot invoke sudo: {e}")))?;
    if !status.success() {
        return Err(AuthError::PolicyFs(format!(
            "sudo re-exec of add failed with {status}; \
             is the opkssh sudoers drop-in installed?"
        )));
    }
    Ok(())
}

/// `opkssh readhome <user>`: print a user's policy file for the verifier.
/// Only root may ask; the file's ownership and mode are vetted here so the
/// caller can trust what it reads from our stdout.
pub fn read_home(user: &str, home_root: &Path) -> Result<String, AuthError> {
    if !Uid::effective().is_root() {
        return Err(AuthError::HelperRefused);
    }
    if !valid_principal(user) {
        return Err(AuthError::ConfigParse(format!("user name '{user}'")));
    }

    let path = home_root.join(user).join(".opk").join("auth_id");
    match std::fs::metadata(&path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => {
            return Err(AuthError::PolicyFs(format!(
                "cannot stat {}: {e}",
                path.display()
            )))
        }
        Ok(_) => {}
    }

    let owner = OwnerSpec::for_user(user)?;
    files::check_perms(&path, &owner, &[0o600])?;
    std::fs::read_to_string(&path)
        .map_err(|e| AuthError::PolicyFs(format!("cannot read {}: {e}", path.display())))
}

/// Client side of `readhome`: ask the root helper for a user policy file
/// we cannot read ourselves.
pub fn read_home_via_sudo(user: &str) -> Result<String, AuthError> {
    if !valid_principal(user) {
        return Err(AuthError::ConfigParse(format!("user name '{user}'")));
    }
    let exe = std::env::current_exe().map_err(|e| {
        AuthError::PolicyFs(format!("cannot locate own executable: {e}"))
    })?;
    let output = Command::new("sudo")
        .arg("-n")
        .arg(exe)
        .arg("readhome")
        .arg(user)
        .output()
        .map_err(|e| AuthError::PolicyFs(format!("cannot invoke sudo: {e}")))?;
    if !output.status.success() {
        warn!(user, status = %output.status, "readhome helper refused or failed");
        return Err(AuthError::PolicyFs(format!(
            "readhome helper exited with {}",
            output.status
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|_| AuthError::PolicyFs("readhome output is not UTF-8".to_string()))
}
