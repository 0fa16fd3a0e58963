//! Lock state directory bootstrap.
//!
//! The protocol tree is `lock_root/` with `lock/` and `free/` beneath it.
//! The subdirectories are world-writable so unrelated users can contend for
//! the same boxes; the root itself is constrained to 0755.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use thiserror::Error;

/// The lock tree could not be brought into existence.
#[derive(Debug, Error)]
#[error("Lock directory {path} could not be created.")]
pub struct LockDirError {
    /// Directory the failure was on.
    pub path: String,
    /// Underlying I/O error.
    #[source]
    pub source: io::Error,
}

/// Ensures `lock_root`, `lock_root/lock` and `lock_root/free` exist with the
/// protocol modes. Directories created by earlier brokers are left as they
/// are; chmod only follows our own creation, so a second user sharing the
/// tree does not trip over ownership.
pub fn ensure_lock_dirs(lock_root: &Path) -> Result<(), LockDirError> {
    ensure_dir(lock_root, 0o755)?;
    ensure_dir(&lock_root.join("lock"), 0o777)?;
    ensure_dir(&lock_root.join("free"), 0o777)?;
    Ok(())
}

fn ensure_dir(path: &Path, mode: u32) -> Result<(), LockDirError> {
    let fail = |source| LockDirError {
        path: path.display().to_string(),
        source,
    };

    // create_dir honours the umask; the protocol mode is set explicitly,
    // but only on directories this invocation created itself.
    match fs::create_dir(path) {
        Ok(()) => fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(fail),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(fail)?;
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(fail)
        }
        Err(error) => Err(fail(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_the_full_tree_with_protocol_modes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("lr");

        ensure_lock_dirs(&root).expect("ensure dirs");

        assert!(root.join("lock").is_dir());
        assert!(root.join("free").is_dir());

        let mode = |p: &Path| fs::metadata(p).expect("stat").permissions().mode() & 0o777;
        assert_eq!(mode(&root), 0o755);
        assert_eq!(mode(&root.join("lock")), 0o777);
        assert_eq!(mode(&root.join("free")), 0o777);
    }

    #[test]
    fn is_idempotent_over_an_existing_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("lr");

        ensure_lock_dirs(&root).expect("first ensure");
        ensure_lock_dirs(&root).expect("second ensure");
    }

    #[test]
    fn fails_when_the_root_is_a_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("lr");
        fs::write(&root, b"not a directory").expect("write file");

        let result = ensure_lock_dirs(&root);
        assert!(result.is_err());
    }
}
