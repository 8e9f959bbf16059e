//! Parent-directory verification and creation.
//!
//! Both the atomic engine and the streaming engine need a real, writable
//! directory to hold the temp file before anything else happens — the
//! same-directory invariant that makes the final rename atomic depends on
//! it. This module is the single place that walks a path's ancestry,
//! decides whether intermediate directories should be created, and turns
//! raw OS errors into a taxonomy the rest of the crate can match on.

use crate::metadata::{lstat, FileKind, StatError};
use crate::path::Path;

/// Whether missing intermediate directories should be created, and with
/// what permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryCreation {
    /// Fail if the immediate parent doesn't already exist.
    None,
    /// Create the immediate parent only, with the given mode; its own
    /// parent must already exist.
    Immediate(u32),
    /// Create every missing ancestor directory, like `mkdir -p`, applying
    /// the given mode to each one created.
    Recursive(u32),
}

/// Errors verifying or creating a destination's parent directory.
#[derive(thiserror::Error, Debug)]
pub enum ParentError {
    #[error("parent directory not found: {0}")]
    Missing(std::path::PathBuf),
    #[error("parent path is not a directory: {0}")]
    NotDirectory(std::path::PathBuf),
    #[error("access denied: {0}")]
    AccessDenied(std::path::PathBuf),
    #[error("invalid path: {0}")]
    InvalidPath(std::path::PathBuf),
    #[error("network path not found: {0}")]
    NetworkPathNotFound(std::path::PathBuf),
    #[error("failed to stat parent directory: {0}")]
    StatFailed(#[source] StatError),
    #[error("failed to create parent directory {path}: {source}")]
    CreationFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Verifies that `path`'s parent exists and is a directory, creating
/// intermediate directories per `creation` if it doesn't.
///
/// Returns the verified parent. Directories created by this function get
/// the mode carried in `creation` applied explicitly via `chmod`, rather
/// than being left at whatever the process umask produces.
pub fn ensure_parent(path: &Path, creation: DirectoryCreation) -> Result<Path, ParentError> {
    let parent = path.parent_or_self();

    match lstat(&parent) {
        Ok(meta) if meta.kind == FileKind::Directory => return Ok(parent),
        Ok(_) => return Err(ParentError::NotDirectory(parent.as_std_path().to_path_buf())),
        Err(StatError::PathNotFound(_)) => {}
        Err(StatError::PermissionDenied(p)) => return Err(ParentError::AccessDenied(p)),
        Err(other) => return Err(ParentError::StatFailed(other)),
    }

    match creation {
        DirectoryCreation::None => Err(ParentError::Missing(parent.as_std_path().to_path_buf())),
        DirectoryCreation::Immediate(mode) => {
            create_one(&parent, mode)?;
            Ok(parent)
        }
        DirectoryCreation::Recursive(mode) => {
            create_recursive(&parent, mode)?;
            Ok(parent)
        }
    }
}

fn create_one(dir: &Path, mode: u32) -> Result<(), ParentError> {
    match std::fs::create_dir(dir.as_std_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(map_create_err(dir, err)),
    }
    crate::sys::chmod(dir, mode).map_err(|err| ParentError::CreationFailed {
        path: dir.as_std_path().to_path_buf(),
        source: err,
    })
}

/// Creates every missing ancestor of `dir`, deepest-first, applying `mode`
/// to each one created. Walks upward from `dir` collecting non-existent
/// ancestors until it finds one that already exists (or the root), mirroring
/// what `mkdir -p` does internally.
fn create_recursive(dir: &Path, mode: u32) -> Result<(), ParentError> {
    let mut missing = Vec::new();
    let mut current = dir.clone();
    loop {
        match lstat(&current) {
            Ok(meta) if meta.kind == FileKind::Directory => break,
            Ok(_) => return Err(ParentError::NotDirectory(current.as_std_path().to_path_buf())),
            Err(StatError::PathNotFound(_)) => {
                missing.push(current.clone());
                match current.parent() {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            Err(StatError::PermissionDenied(p)) => return Err(ParentError::AccessDenied(p)),
            Err(other) => return Err(ParentError::StatFailed(other)),
        }
    }
    for ancestor in missing.into_iter().rev() {
        create_one(&ancestor, mode)?;
    }
    Ok(())
}

#[cfg(windows)]
fn map_create_err(dir: &Path, err: std::io::Error) -> ParentError {
    const ERROR_INVALID_NAME: i32 = 123;
    const ERROR_BAD_NETPATH: i32 = 53;
    const ERROR_BAD_NET_NAME: i32 = 67;

    match err.raw_os_error() {
        Some(ERROR_INVALID_NAME) => return ParentError::InvalidPath(dir.as_std_path().to_path_buf()),
        Some(ERROR_BAD_NETPATH) | Some(ERROR_BAD_NET_NAME) => {
            return ParentError::NetworkPathNotFound(dir.as_std_path().to_path_buf())
        }
        _ => {}
    }
    map_create_err_generic(dir, err)
}

#[cfg(unix)]
fn map_create_err(dir: &Path, err: std::io::Error) -> ParentError {
    map_create_err_generic(dir, err)
}

fn map_create_err_generic(dir: &Path, err: std::io::Error) -> ParentError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ParentError::AccessDenied(dir.as_std_path().to_path_buf())
        }
        std::io::ErrorKind::NotFound => {
            ParentError::Missing(dir.as_std_path().to_path_buf())
        }
        _ => ParentError::CreationFailed {
            path: dir.as_std_path().to_path_buf(),
            source: err,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_parent_accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        let path = Path::try_from(file).unwrap();

        let parent = ensure_parent(&path, DirectoryCreation::None).unwrap();
        assert_eq!(parent.as_std_path(), dir.path());
    }

    #[test]
    fn ensure_parent_none_fails_on_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing").join("f.txt");
        let path = Path::try_from(file).unwrap();

        let err = ensure_parent(&path, DirectoryCreation::None).unwrap_err();
        assert!(matches!(err, ParentError::Missing(_)));
    }

    #[test]
    fn ensure_parent_immediate_creates_one_level() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("child").join("f.txt");
        let path = Path::try_from(file).unwrap();

        let parent = ensure_parent(&path, DirectoryCreation::Immediate(0o755)).unwrap();
        assert!(parent.as_std_path().is_dir());
    }

    #[test]
    fn ensure_parent_immediate_fails_if_grandparent_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("f.txt");
        let path = Path::try_from(file).unwrap();

        let err = ensure_parent(&path, DirectoryCreation::Immediate(0o755)).unwrap_err();
        assert!(matches!(err, ParentError::Missing(_) | ParentError::CreationFailed { .. }));
    }

    #[test]
    fn ensure_parent_recursive_creates_every_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("c").join("f.txt");
        let path = Path::try_from(file).unwrap();

        let parent = ensure_parent(&path, DirectoryCreation::Recursive(0o755)).unwrap();
        assert!(parent.as_std_path().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn ensure_parent_recursive_applies_mode_to_every_created_ancestor() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("c").join("f.txt");
        let path = Path::try_from(file).unwrap();

        ensure_parent(&path, DirectoryCreation::Recursive(0o700)).unwrap();

        for sub in ["a", "a/b", "a/b/c"] {
            let meta = std::fs::metadata(dir.path().join(sub)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        }
    }

    #[test]
    fn ensure_parent_rejects_file_as_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let file = blocker.join("f.txt");
        let path = Path::try_from(file).unwrap();

        let err = ensure_parent(&path, DirectoryCreation::None).unwrap_err();
        assert!(matches!(err, ParentError::NotDirectory(_)));
    }
}
