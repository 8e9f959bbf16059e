//! Error taxonomy.
//!
//! Every filesystem operation family in this crate returns its own narrow
//! error enum (see [`crate::parent`], [`crate::atomic`], [`crate::streaming`],
//! [`crate::metadata`], [`crate::copy`]) rather than one grab-bag type, so a
//! caller who only ever calls [`crate::atomic::write_atomic`] is never forced
//! to match on a `DirectorySyncFailed` variant it can't produce. [`Error`]
//! aggregates them for callers who want a single type to propagate with `?`.
//!
//! Every variant that can be traced back to a raw OS error carries a [`Code`]
//! so the original `errno`/`GetLastError` value is never lost, even once it
//! has been mapped to a named variant.

use std::fmt;
use std::io;

/// A platform-neutral wrapper around the raw OS error code underlying a
/// filesystem failure.
///
/// `Code` never judges whether a failure is "retryable" or "fatal" — that
/// policy lives in the call sites that inspect `errno`/`GetLastError` before
/// the code is wrapped. Once wrapped, `Code` exists purely for diagnostics:
/// logging, `Display`, and bug reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// A POSIX `errno` value.
    Posix(i32),
    /// A Windows `GetLastError` value.
    Windows(u32),
}

impl Code {
    /// Build a `Code` from the last OS error observed on the current thread.
    pub fn last_os_error() -> Self {
        Self::from_io(&io::Error::last_os_error())
    }

    /// Extract a `Code` from an [`io::Error`], falling back to `Posix(0)` /
    /// `Windows(0)` for errors that have no raw OS code (e.g. ones
    /// constructed directly from an [`io::ErrorKind`]).
    pub fn from_io(err: &io::Error) -> Self {
        let raw = err.raw_os_error().unwrap_or(0);
        if cfg!(windows) {
            Code::Windows(raw as u32)
        } else {
            Code::Posix(raw)
        }
    }

    /// The raw numeric value, regardless of platform.
    pub fn raw(self) -> i64 {
        match self {
            Code::Posix(v) => v as i64,
            Code::Windows(v) => v as i64,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Posix(v) => write!(f, "errno {v}"),
            Code::Windows(v) => write!(f, "GetLastError {v}"),
        }
    }
}

/// Errors from opening or creating a file, shared by the temp-file creation
/// step of the atomic and streaming engines and by direct (non-atomic)
/// streaming mode.
#[derive(thiserror::Error, Debug)]
pub enum OpenError {
    #[error("path not found: {0}")]
    PathNotFound(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(std::path::PathBuf),
    #[error("is a directory: {0}")]
    IsDirectory(std::path::PathBuf),
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("open failed ({code}): {message}")]
    OpenFailed {
        code: Code,
        message: String,
        #[source]
        source: io::Error,
    },
}

impl OpenError {
    /// Map a raw [`io::Error`] from an `open`/`CreateFileW` call at `path`
    /// into the named taxonomy. Unmapped codes land in the generic
    /// `OpenFailed` tail with the original code preserved.
    pub fn from_io(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => OpenError::PathNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => OpenError::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::AlreadyExists => OpenError::AlreadyExists(path.to_path_buf()),
            io::ErrorKind::IsADirectory => OpenError::IsDirectory(path.to_path_buf()),
            _ => {
                let code = Code::from_io(&err);
                #[cfg(unix)]
                if matches!(code, Code::Posix(libc::EMFILE) | Code::Posix(libc::ENFILE)) {
                    return OpenError::TooManyOpenFiles;
                }
                let message = err.to_string();
                OpenError::OpenFailed {
                    code,
                    message,
                    source: err,
                }
            }
        }
    }
}

/// Raised by the lower-level temp-file descriptor wrapper when a caller
/// attempts to close it a second time. The streaming `Context` prevents this
/// at compile time by consuming `self`, but the single-descriptor wrapper
/// used internally by the atomic engine is reused across pipeline steps and
/// needs a runtime guard.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("handle already closed")]
pub struct AlreadyClosed;

/// Umbrella error aggregating every per-family error this crate produces.
///
/// Prefer the family-specific error types in application code that only
/// performs one kind of operation; reach for `Error` at boundaries that want
/// to propagate any failure from this crate with a single `?`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Path(#[from] crate::path::PathError),
    #[error(transparent)]
    Parent(#[from] crate::parent::ParentError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    AtomicWrite(#[from] crate::atomic::AtomicWriteError),
    #[error(transparent)]
    Streaming(#[from] crate::streaming::StreamingError),
    #[error(transparent)]
    Stat(#[from] crate::metadata::StatError),
    #[error(transparent)]
    Permissions(#[from] crate::metadata::PermissionsError),
    #[error(transparent)]
    Ownership(#[from] crate::metadata::OwnershipError),
    #[error(transparent)]
    Timestamps(#[from] crate::metadata::TimestampsError),
    #[error(transparent)]
    Copy(#[from] crate::copy::CopyError),
    #[error(transparent)]
    AlreadyClosed(#[from] AlreadyClosed),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_display_posix() {
        let code = Code::Posix(2);
        assert_eq!(code.to_string(), "errno 2");
        assert_eq!(code.raw(), 2);
    }

    #[test]
    fn code_display_windows() {
        let code = Code::Windows(5);
        assert_eq!(code.to_string(), "GetLastError 5");
        assert_eq!(code.raw(), 5);
    }

    #[test]
    fn open_error_maps_not_found() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "nope");
        let err = OpenError::from_io(std::path::Path::new("/tmp/x"), io_err);
        assert!(matches!(err, OpenError::PathNotFound(_)));
    }

    #[test]
    fn open_error_maps_permission_denied() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let err = OpenError::from_io(std::path::Path::new("/tmp/x"), io_err);
        assert!(matches!(err, OpenError::PermissionDenied(_)));
    }

    #[test]
    fn open_error_falls_back_to_open_failed() {
        let io_err = io::Error::new(io::ErrorKind::Other, "weird");
        let err = OpenError::from_io(std::path::Path::new("/tmp/x"), io_err);
        assert!(matches!(err, OpenError::OpenFailed { .. }));
    }

    #[test]
    fn open_error_maps_is_a_directory() {
        let io_err = io::Error::new(io::ErrorKind::IsADirectory, "is a dir");
        let err = OpenError::from_io(std::path::Path::new("/tmp/x"), io_err);
        assert!(matches!(err, OpenError::IsDirectory(_)));
    }

    #[cfg(unix)]
    #[test]
    fn open_error_maps_too_many_open_files() {
        let io_err = io::Error::from_raw_os_error(libc::EMFILE);
        let err = OpenError::from_io(std::path::Path::new("/tmp/x"), io_err);
        assert!(matches!(err, OpenError::TooManyOpenFiles));
    }

    #[test]
    fn already_closed_display() {
        assert_eq!(AlreadyClosed.to_string(), "handle already closed");
    }
}
