//! The policy engine.
//!
//! Two row files decide who may assume which local account: the system
//! policy under `/etc/opk` and, per principal, that user's own
//! `~/.opk/auth_id`. Files are re-read on every evaluation; rows from a
//! file are only honored when the file's ownership and mode are exactly
//! right; and the user file only speaks for its own principal.

pub mod files;
pub mod helper;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::AuthError;
use crate::jose::IdClaims;
use files::OwnerSpec;

/// The identity a verified PK token attests to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub issuer: String,
    pub sub: String,
    pub email: Option<String>,
    pub groups: Vec<String>,
}

impl Identity {
    pub fn from_claims(claims: &IdClaims) -> Self {
        Self {
            issuer: claims.iss.clone(),
            sub: claims.sub.clone(),
            email: claims.email.clone(),
            groups: claims.groups.clone(),
        }
    }
}

/// One authorization grant: `<principal> <email_or_sub> <issuer> [group=<g>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRow {
    pub principal: String,
    pub identity: String,
    pub issuer: String,
    pub group: Option<String>,
}

impl PolicyRow {
    /// Parse one line. `Ok(None)` for comments and blank lines; `Err` for a
    /// malformed row (which skips that row only).
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.as_slice() {
            [principal, identity, issuer] => Ok(Some(Self {
                principal: principal.to_string(),
                identity: identity.to_string(),
                issuer: issuer.to_string(),
                group: None,
            })),
            [principal, identity, issuer, option] => match option.strip_prefix("group=") {
                Some(group) if !group.is_empty() => Ok(Some(Self {
                    principal: principal.to_string(),
                    identity: identity.to_string(),
                    issuer: issuer.to_string(),
                    group: Some(group.to_string()),
                })),
                _ => Err(format!("unrecognized option column '{option}'")),
            },
            _ => Err(format!(
                "expected 3 or 4 columns, got {}",
                columns.len()
            )),
        }
    }

    pub fn to_line(&self) -> String {
        match &self.group {
            Some(group) => format!(
                "{} {} {} group={group}",
                self.principal, self.identity, self.issuer
            ),
            None => format!("{} {} {}", self.principal, self.identity, self.issuer),
        }
    }

    /// Does this row authorize `identity` to act as `principal`?
    ///
    /// The identity column is matched against the email claim first, then
    /// `sub`. A `group=` row instead requires membership in the token's
    /// `groups` claim. Any single matching row allows; ordering never
    /// matters.
    pub fn matches(&self, principal: &str, identity: &Identity) -> bool {
        if self.principal != principal || self.issuer != identity.issuer {
            return false;
        }
        match &self.group {
            Some(group) => identity.groups.iter().any(|g| g == group),
            None => {
                identity.email.as_deref() == Some(self.identity.as_str())
                    || identity.sub == self.identity
            }
        }
    }
}

/// Parse a whole policy file, skipping malformed rows with a logged error.
pub fn parse_policy(content: &str, source: &Path) -> Vec<PolicyRow> {
    let mut rows = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        match PolicyRow::parse(line) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => {}
            Err(e) => warn!(
                path = %source.display(),
                line = lineno + 1,
                error = %e,
                "Skipping malformed policy row"
            ),
        }
    }
    rows
}

/// A principal name we are willing to look up on the filesystem.
pub fn valid_principal(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Loads and merges the two policy tiers for an evaluation.
#[derive(Debug, Clone)]
pub struct PolicyLoader {
    pub system_path: PathBuf,
    pub home_root: PathBuf,
    pub system_owner: OwnerSpec,
}

impl PolicyLoader {
    /// Loader over the real system paths, requiring `root:opksshuser`.
    pub fn system_defaults() -> Result<Self, AuthError> {
        Ok(Self {
            system_path: PathBuf::from(crate::paths::SYSTEM_POLICY),
            home_root: PathBuf::from(crate::paths::HOME_ROOT),
            system_owner: OwnerSpec::system(crate::paths::SYSTEM_GROUP)?,
        })
    }

    pub fn user_policy_path(&self, user: &str) -> PathBuf {
        self.home_root.join(user).join(".opk").join("auth_id")
    }

    /// Evaluate the request. Any matching merged row allows; a broken
    /// system policy file denies everything.
    pub fn authorized(&self, principal: &str, identity: &Identity) -> Result<(), AuthError> {
        if !valid_principal(principal) {
            warn!(principal, "Refusing principal with unsafe name");
            return Err(AuthError::PolicyDeny);
        }

        let mut rows = self.load_system()?;
        rows.extend(self.load_user(principal));

        if rows.iter().any(|row| row.matches(principal, identity)) {
            Ok(())
        } else {
            warn!(
                principal,
                issuer = %identity.issuer,
                sub = %identity.sub,
                email = identity.email.as_deref().unwrap_or(""),
                "No policy row authorizes this identity"
            );
            Err(AuthError::PolicyDeny)
        }
    }

    /// System tier. Missing file means no rows; a present file must pass
    /// the ownership and mode check or the whole evaluation fails.
    fn load_system(&self) -> Result<Vec<PolicyRow>, AuthError> {
        match std::fs::metadata(&self.system_path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.system_path.display(), "No system policy file");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(AuthError::PolicyFs(format!(
                    "cannot stat {}: {e}",
                    self.system_path.display()
                )))
            }
            Ok(_) => {}
        }
        files::check_perms(&self.system_path, &self.system_owner, &[0o640])?;
        let content = std::fs::read_to_string(&self.system_path).map_err(|e| {
            AuthError::PolicyFs(format!("cannot read {}: {e}", self.system_path.display()))
        })?;
        Ok(parse_policy(&content, &self.system_path))
    }

    /// User tier: best effort. A missing, unreadable, mis-owned, or
    /// foreign-principal file contributes nothing; it never blocks rows
    /// from the system tier.
    fn load_user(&self, user: &str) -> Vec<PolicyRow> {
        let path = self.user_policy_path(user);

        match std::fs::metadata(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                // Running unprivileged; ask the root helper to read and
                // vet the file for us.
                return match helper::read_home_via_sudo(user) {
                    Ok(content) => self.user_rows(&content, user, &path),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Cannot read user policy");
                        Vec::new()
                    }
                };
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat user policy");
                return Vec::new();
            }
            Ok(_) => {}
        }

        let owner = match OwnerSpec::for_user(user) {
            Ok(owner) => owner,
            Err(e) => {
                warn!(user, error = %e, "Cannot resolve user for policy ownership check");
                return Vec::new();
            }
        };
        if let Err(e) = files::check_perms(&path, &owner, &[0o600]) {
            warn!(path = %path.display(), error = %e, "Ignoring user policy file");
            return Vec::new();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => self.user_rows(&content, user, &path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read user policy");
                Vec::new()
            }
        }
    }

    /// Rows from a user file, dropping anything that speaks for another
    /// principal.
    fn user_rows(&self, content: &str, user: &str, path: &Path) -> Vec<PolicyRow> {
        parse_policy(content, path)
            .into_iter()
            .filter(|row| {
                if row.principal == user {
                    true
                } else {
                    warn!(
                        path = %path.display(),
                        row_principal = %row.principal,
                        "User policy row for a foreign principal ignored"
                    );
                    false
                }
            })
            .collect()
    }
}
