//! Trusted-file discipline.
//!
//! Policy and configuration files are only honored when their ownership and
//! mode match exactly what the installer sets. Writes go through a temp
//! file plus rename in the same directory so readers never observe a
//! partial row, and writers serialize on a directory-scoped advisory lock.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Group, Uid, User};

use crate::errors::AuthError;

/// Expected owner of a trusted file. `gid: None` skips the group check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerSpec {
    pub uid: u32,
    pub gid: Option<u32>,
}

impl OwnerSpec {
    /// The expected owner of system files: `root:opksshuser`.
    pub fn system(group_name: &str) -> Result<Self, AuthError> {
        let group = Group::from_name(group_name)
            .map_err(|e| AuthError::ConfigPerms(format!("cannot look up group {group_name}: {e}")))?
            .ok_or_else(|| {
                AuthError::ConfigPerms(format!(
                    "group {group_name} does not exist; is opkssh installed?"
                ))
            })?;
        Ok(Self {
            uid: 0,
            gid: Some(group.gid.as_raw()),
        })
    }

    /// The expected owner of a user's own files: `<user>:<user>`.
    pub fn for_user(name: &str) -> Result<Self, AuthError> {
        let user = User::from_name(name)
            .map_err(|e| AuthError::PolicyFs(format!("cannot look up user {name}: {e}")))?
            .ok_or_else(|| AuthError::PolicyFs(format!("no such user: {name}")))?;
        Ok(Self {
            uid: user.uid.as_raw(),
            gid: Some(user.gid.as_raw()),
        })
    }
}

/// Enforce ownership and mode on a trusted file. Any deviation rejects the
/// file outright; contents are never partially trusted.
pub fn check_perms(
    path: &Path,
    owner: &OwnerSpec,
    allowed_modes: &[u32],
) -> Result<(), AuthError> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path).map_err(|e| {
        AuthError::PolicyFs(format!("cannot stat {}: {e}", path.display()))
    })?;

    let mode = meta.mode() & 0o777;
    if !allowed_modes.contains(&mode) {
        let expected: Vec<String> = allowed_modes.iter().map(|m| format!("{m:o}")).collect();
        return Err(AuthError::ConfigPerms(format!(
            "{}: expected one of the following permissions [{}], got ({mode:o})",
            path.display(),
            expected.join(", "),
        )));
    }

    if meta.uid() != owner.uid {
        return Err(AuthError::ConfigPerms(format!(
            "{}: expected owner uid {}, got {}",
            path.display(),
            owner.uid,
            meta.uid()
        )));
    }
    if let Some(gid) = owner.gid {
        if meta.gid() != gid {
            return Err(AuthError::ConfigPerms(format!(
                "{}: expected group gid {gid}, got {}",
                path.display(),
                meta.gid()
            )));
        }
    }
    Ok(())
}

/// Name of the user running this process.
pub fn current_username() -> Result<String, AuthError> {
    let user = User::from_uid(Uid::current())
        .map_err(|e| AuthError::PolicyFs(format!("cannot resolve current user: {e}")))?
        .ok_or_else(|| AuthError::PolicyFs("current uid has no passwd entry".to_string()))?;
    Ok(user.name)
}

/// The current process's real uid/gid, the expected owner of files this
/// process creates.
pub fn current_owner() -> OwnerSpec {
    OwnerSpec {
        uid: Uid::current().as_raw(),
        gid: Some(Gid::current().as_raw()),
    }
}

/// Exclusive advisory lock scoped to a directory. Held for as long as the
/// value lives; blocks until any concurrent writer finishes.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> std::io::Result<Self> {
        let lock_path = dir.join(".opkssh.lock");
        let file = File::create(&lock_path)?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    const LOCK_EX: i32 = 2;

    // SAFETY: flock is a standard POSIX syscall, fd is valid (owned by File).
    let ret = unsafe { flock_syscall(file.as_raw_fd(), LOCK_EX) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
unsafe fn flock_syscall(fd: i32, operation: i32) -> i32 {
    // Link to libc's flock without depending on the libc crate.
    unsafe {
        extern "C" {
            fn flock(fd: i32, operation: i32) -> i32;
        }
        flock(fd, operation)
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// Write a file atomically: temp file in the same directory, fsync, chmod,
/// rename over the target.
pub fn atomic_write(path: &Path, content: &str, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = tmp_sibling(path);
    let mut file = File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode))?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "policy".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

pub fn read_if_exists(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
