//! The atomic-write commit engine: the ten-step pipeline that turns a byte
//! span into a durably-published file.
//!
//! Every step advances a [`Phase`] value before or after the underlying
//! syscall runs, and cleanup reads that value back to decide whether the
//! temp file is still safe to unlink. See [`crate::phase`] for the ordering
//! rules this module depends on.

use tracing::{debug, trace};

use crate::error::Code;
use crate::metadata::{lstat, Metadata, StatError};
use crate::parent::{ensure_parent, DirectoryCreation, ParentError};
use crate::path::Path;
use crate::phase::Phase;
use crate::sys::{self, Durability};

/// Publish semantics for the final rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStrategy {
    /// Overwrite an existing destination.
    ReplaceExisting,
    /// Fail with [`AtomicWriteError::DestinationExists`] if the destination
    /// already exists.
    NoClobber,
}

/// Configuration for [`write_atomic`].
#[derive(Debug, Clone)]
pub struct AtomicWriteOptions {
    pub strategy: PublishStrategy,
    pub durability: Durability,
    pub directory_creation: DirectoryCreation,
    pub preserve_permissions: bool,
    pub preserve_ownership: bool,
    pub preserve_timestamps: bool,
    pub preserve_extended_attributes: bool,
    pub preserve_acls: bool,
    /// If `false`, a failed ownership change (common for unprivileged
    /// callers) is silently ignored rather than failing the write.
    pub strict_ownership: bool,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        AtomicWriteOptions {
            strategy: PublishStrategy::ReplaceExisting,
            durability: Durability::Full,
            directory_creation: DirectoryCreation::None,
            preserve_permissions: false,
            preserve_ownership: false,
            preserve_timestamps: false,
            preserve_extended_attributes: false,
            preserve_acls: false,
            strict_ownership: false,
        }
    }
}

/// Errors from [`write_atomic`], named after the pipeline step that failed.
///
/// Variants marked "after commit" in their doc comment indicate the
/// destination is already published; the caller should treat the write as
/// having succeeded with uncertain durability, not as a failed write.
#[derive(thiserror::Error, Debug)]
pub enum AtomicWriteError {
    #[error("parent not found: {0}")]
    ParentNotFound(std::path::PathBuf),
    #[error("parent is not a directory: {0}")]
    ParentNotDirectory(std::path::PathBuf),
    #[error("access denied on parent: {0}")]
    ParentAccessDenied(std::path::PathBuf),
    #[error("failed to create intermediate directories for {path}")]
    DirectoryCreationFailed {
        path: std::path::PathBuf,
        #[source]
        source: ParentError,
    },
    #[error("failed to stat destination {path} ({code})")]
    DestinationStatFailed {
        path: std::path::PathBuf,
        code: Code,
        #[source]
        source: StatError,
    },
    #[error("failed to create temp file in {directory} ({code}): {message}")]
    TempFileCreationFailed {
        directory: std::path::PathBuf,
        code: Code,
        message: String,
    },
    #[error("random name generation failed ({code}): {message}")]
    RandomGenerationFailed { code: Code, message: String },
    #[error("write failed after {bytes_written} of {bytes_expected} bytes ({code}): {message}")]
    WriteFailed {
        bytes_written: u64,
        bytes_expected: u64,
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sync failed ({code}): {message}")]
    SyncFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("close failed ({code}): {message}")]
    CloseFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata preservation failed during {operation} ({code}): {message}")]
    MetadataPreservationFailed {
        operation: &'static str,
        code: Code,
        message: String,
    },
    #[error("rename from {from} to {to} failed ({code}): {message}")]
    RenameFailed {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("destination already exists: {0}")]
    DestinationExists(std::path::PathBuf),
    /// Raised before publish; the destination is unchanged.
    #[error("directory sync failed ({code}): {message}")]
    DirectorySyncFailed {
        path: std::path::PathBuf,
        code: Code,
        message: String,
    },
    /// Raised after commit: the destination is already visible with the new
    /// contents, but directory durability could not be confirmed.
    #[error("directory sync failed after commit ({code}): {message}")]
    DirectorySyncFailedAfterCommit {
        path: std::path::PathBuf,
        code: Code,
        message: String,
    },
}

impl AtomicWriteError {
    /// `true` for variants raised after the destination is already visible
    /// with the new contents.
    pub fn after_commit(&self) -> bool {
        matches!(self, AtomicWriteError::DirectorySyncFailedAfterCommit { .. })
    }
}

const MAX_TEMP_NAME_ATTEMPTS: u32 = 64;
const RANDOM_SUFFIX_BYTES: usize = 12;

struct TempFile {
    path: Path,
    /// `None` once [`write_atomic`] has closed the descriptor itself (step
    /// 8); `Drop` only closes it here for the early-failure paths.
    fd: Option<sys::RawDescriptor>,
    phase: Phase,
}

impl TempFile {
    fn raw(&self) -> sys::RawDescriptor {
        self.fd.expect("temp file descriptor used after close")
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = sys::close_once(fd);
        }
        if self.phase.temp_file_removable() {
            let _ = std::fs::remove_file(self.path.as_std_path());
        }
    }
}

fn create_temp_file(parent: &Path, basename: &str) -> Result<TempFile, AtomicWriteError> {
    let pid = std::process::id();
    for _ in 0..MAX_TEMP_NAME_ATTEMPTS {
        let suffix = sys::random_suffix(RANDOM_SUFFIX_BYTES).map_err(|e| {
            AtomicWriteError::RandomGenerationFailed {
                code: Code::last_os_error(),
                message: e.to_string(),
            }
        })?;
        let name = format!(".{basename}.atomic.{pid}.{suffix}.tmp");
        let candidate = parent.append_str(&name).map_err(|_| AtomicWriteError::TempFileCreationFailed {
            directory: parent.as_std_path().to_path_buf(),
            code: Code::Posix(0),
            message: "invalid temp file name".to_string(),
        })?;

        match sys::create_exclusive(&candidate, 0o600) {
            Ok(fd) => {
                return Ok(TempFile {
                    path: candidate,
                    fd: Some(fd),
                    phase: Phase::Pending,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                trace!(attempt = "collision", "temp file name collision, regenerating");
                continue;
            }
            Err(err) => {
                return Err(AtomicWriteError::TempFileCreationFailed {
                    directory: parent.as_std_path().to_path_buf(),
                    code: Code::from_io(&err),
                    message: err.to_string(),
                });
            }
        }
    }
    Err(AtomicWriteError::TempFileCreationFailed {
        directory: parent.as_std_path().to_path_buf(),
        code: Code::Posix(0),
        message: format!("exhausted {MAX_TEMP_NAME_ATTEMPTS} random name attempts"),
    })
}

fn preserve_metadata(
    fd: sys::RawDescriptor,
    path: &Path,
    source: &Path,
    prior: Option<&Metadata>,
    options: &AtomicWriteOptions,
) -> Result<(), AtomicWriteError> {
    let Some(prior) = prior else { return Ok(()) };

    if options.preserve_permissions {
        sys::chmod(path, prior.permissions).map_err(|e| AtomicWriteError::MetadataPreservationFailed {
            operation: "chmod",
            code: Code::from_io(&e),
            message: e.to_string(),
        })?;
    }

    if options.preserve_ownership {
        if let Err(e) = sys::chown(path, prior.uid, prior.gid) {
            if options.strict_ownership {
                return Err(AtomicWriteError::MetadataPreservationFailed {
                    operation: "chown",
                    code: Code::from_io(&e),
                    message: e.to_string(),
                });
            }
            debug!(error = %e, "ignoring chown failure under non-strict ownership");
        }
    }

    if options.preserve_timestamps {
        sys::set_times(path, prior.accessed, prior.modified).map_err(|e| {
            AtomicWriteError::MetadataPreservationFailed {
                operation: "utimens",
                code: Code::from_io(&e),
                message: e.to_string(),
            }
        })?;
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    if options.preserve_extended_attributes {
        preserve_xattrs(fd, source)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = fd;
        let _ = source;
    }

    // ACL preservation is an optional platform shim; no shim is wired up
    // for any supported target yet, so this is a silent no-op rather than
    // a hard failure.
    let _ = options.preserve_acls;

    Ok(())
}

/// Copies every extended attribute from `source` (the file about to be
/// replaced) onto the open temp-file descriptor `fd`, so the published file
/// carries the same xattrs as the one it's overwriting.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn preserve_xattrs(fd: sys::RawDescriptor, source: &Path) -> Result<(), AtomicWriteError> {
    let source_fd = match sys::open_read_only(source) {
        Ok(fd) => fd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(AtomicWriteError::MetadataPreservationFailed {
                operation: "xattr-open-source",
                code: Code::from_io(&e),
                message: e.to_string(),
            })
        }
    };

    let result = (|| -> std::io::Result<()> {
        for name in sys::flist_xattrs(source_fd)? {
            let value = sys::fget_xattr(source_fd, &name)?;
            sys::fset_xattr(fd, &name, &value)?;
        }
        Ok(())
    })();

    let _ = sys::close_once(source_fd);

    result.map_err(|e| AtomicWriteError::MetadataPreservationFailed {
        operation: "xattr",
        code: Code::from_io(&e),
        message: e.to_string(),
    })
}

fn map_parent_error(err: ParentError) -> AtomicWriteError {
    match err {
        ParentError::Missing(p) => AtomicWriteError::ParentNotFound(p),
        ParentError::NotDirectory(p) => AtomicWriteError::ParentNotDirectory(p),
        ParentError::AccessDenied(p) => AtomicWriteError::ParentAccessDenied(p),
        ParentError::InvalidPath(p) => AtomicWriteError::ParentNotFound(p),
        ParentError::NetworkPathNotFound(p) => AtomicWriteError::ParentNotFound(p),
        ParentError::CreationFailed { ref path, .. } => {
            let path = path.clone();
            AtomicWriteError::DirectoryCreationFailed { path, source: err }
        }
        ParentError::StatFailed(_) => AtomicWriteError::DirectoryCreationFailed {
            path: std::path::PathBuf::new(),
            source: err,
        },
    }
}

/// Writes `data` to `path` with crash-safe atomic semantics: the pipeline
/// documented at the module level. Returns the final [`Phase`] reached on
/// success (`syncedDirectory` under `durability = full`, `syncedFile`'s
/// successor phases otherwise).
pub fn write_atomic(path: &Path, data: &[u8], options: &AtomicWriteOptions) -> Result<Phase, AtomicWriteError> {
    // Step 1: resolve. Callers hand us an already-validated `Path`; nothing
    // further to do here beyond taking the parent.
    // Step 2: ensure parent.
    let parent = ensure_parent(path, options.directory_creation).map_err(map_parent_error)?;

    // Step 3: stat destination via lstat.
    let prior = match lstat(path) {
        Ok(meta) => Some(meta),
        Err(StatError::PathNotFound(_)) => None,
        Err(other) => {
            return Err(AtomicWriteError::DestinationStatFailed {
                path: path.as_std_path().to_path_buf(),
                code: Code::last_os_error(),
                source: other,
            })
        }
    };

    if options.strategy == PublishStrategy::NoClobber && prior.is_some() {
        return Err(AtomicWriteError::DestinationExists(path.as_std_path().to_path_buf()));
    }

    let basename = path
        .last_component()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "file".to_string());

    // Step 4: create temp file.
    let mut temp = create_temp_file(&parent, &basename)?;

    // Step 5: write all bytes.
    sys::write_all(temp.raw(), data).map_err(|e| AtomicWriteError::WriteFailed {
        bytes_written: 0,
        bytes_expected: data.len() as u64,
        code: Code::from_io(&e),
        message: e.to_string(),
        source: e,
    })?;
    temp.phase = Phase::Writing;

    // Step 6: sync file data.
    sys::sync_file(temp.raw(), options.durability).map_err(|e| AtomicWriteError::SyncFailed {
        code: Code::from_io(&e),
        message: e.to_string(),
        source: e,
    })?;
    temp.phase = Phase::SyncedFile;

    // Step 7: apply preserved metadata.
    preserve_metadata(temp.raw(), &temp.path, path, prior.as_ref(), options)?;

    // Step 8: close exactly once. `fd.take()` hands Drop a `None`, so a
    // later failure path can never double-close this descriptor.
    let raw_fd = temp.fd.take().expect("temp file descriptor already closed");
    sys::close_once(raw_fd).map_err(|e| AtomicWriteError::CloseFailed {
        code: Code::from_io(&e),
        message: e.to_string(),
        source: e,
    })?;
    temp.phase = Phase::Closed;

    // Step 9: atomic publish.
    let no_clobber = options.strategy == PublishStrategy::NoClobber;
    match sys::publish(&temp.path, path, no_clobber) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(AtomicWriteError::DestinationExists(path.as_std_path().to_path_buf()));
        }
        Err(e) => {
            return Err(AtomicWriteError::RenameFailed {
                from: temp.path.as_std_path().to_path_buf(),
                to: path.as_std_path().to_path_buf(),
                code: Code::from_io(&e),
                message: e.to_string(),
                source: e,
            });
        }
    }
    temp.phase = Phase::RenamedPublished;

    // Step 10: directory sync, only under full durability.
    if options.durability == Durability::Full {
        temp.phase = Phase::DirectorySyncAttempted;
        match sys::sync_directory(&parent) {
            Ok(()) => {
                temp.phase = Phase::SyncedDirectory;
            }
            Err(e) => {
                return Err(AtomicWriteError::DirectorySyncFailedAfterCommit {
                    path: parent.as_std_path().to_path_buf(),
                    code: Code::from_io(&e),
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(temp.phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &std::path::Path, data: &[u8], options: &AtomicWriteOptions) -> Result<Phase, AtomicWriteError> {
        let p = Path::try_from(path.to_path_buf()).unwrap();
        write_atomic(&p, data, options)
    }

    #[test]
    fn empty_payload_creates_new_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("e.dat");
        let options = AtomicWriteOptions::default();

        let phase = write(&dest, b"", &options).unwrap();
        assert_eq!(phase, Phase::SyncedDirectory);
        assert_eq!(std::fs::read(&dest).unwrap(), b"");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn overwrite_replaces_contents_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.dat");
        std::fs::write(&dest, b"old").unwrap();
        let options = AtomicWriteOptions::default();

        write(&dest, b"newer", &options).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"newer");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn no_clobber_against_existing_file_fails_and_leaves_contents_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.dat");
        std::fs::write(&dest, b"keep").unwrap();
        let options = AtomicWriteOptions {
            strategy: PublishStrategy::NoClobber,
            ..AtomicWriteOptions::default()
        };

        let err = write(&dest, b"X", &options).unwrap_err();
        assert!(matches!(err, AtomicWriteError::DestinationExists(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"keep");
    }

    #[test]
    fn missing_parent_without_creation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing").join("f.dat");
        let options = AtomicWriteOptions::default();

        let err = write(&dest, b"x", &options).unwrap_err();
        assert!(matches!(err, AtomicWriteError::ParentNotFound(_)));
    }

    #[test]
    fn create_intermediate_directories_builds_full_chain() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("new").join("sub").join("file.bin");
        let options = AtomicWriteOptions {
            directory_creation: DirectoryCreation::Recursive(0o755),
            ..AtomicWriteOptions::default()
        };

        write(&dest, b"x", &options).unwrap();
        assert!(dest.exists());
    }

    #[test]
    fn data_only_durability_skips_directory_sync_phase() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.dat");
        let options = AtomicWriteOptions {
            durability: Durability::DataOnly,
            ..AtomicWriteOptions::default()
        };

        let phase = write(&dest, b"x", &options).unwrap();
        assert_eq!(phase, Phase::RenamedPublished);
    }

    #[test]
    fn preserves_permissions_when_requested() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.dat");
        std::fs::write(&dest, b"old").unwrap();
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o640)).unwrap();
        let options = AtomicWriteOptions {
            preserve_permissions: true,
            ..AtomicWriteOptions::default()
        };

        write(&dest, b"new", &options).unwrap();
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }
}

#[cfg(all(test, feature = "test-overrides"))]
mod fault_injection_tests {
    use super::*;
    use crate::overrides::{self, Injected};

    #[test]
    fn short_writes_still_deliver_the_full_payload() {
        overrides::clear_all();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.dat");
        let path = Path::try_from(dest.clone()).unwrap();
        let payload = vec![0xABu8; 4096];

        overrides::set_write_override(Injected::ShortWrite(1));
        let result = write_atomic(&path, &payload, &AtomicWriteOptions::default());
        overrides::clear_all();

        result.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn round_trip_write_then_read(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("f.dat");
            let path = Path::try_from(dest.clone()).unwrap();

            write_atomic(&path, &data, &AtomicWriteOptions::default()).unwrap();
            prop_assert_eq!(std::fs::read(&dest).unwrap(), data);
        }

        #[test]
        fn no_clobber_failure_leaves_destination_untouched(
            original in proptest::collection::vec(any::<u8>(), 0..256),
            attempted in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("f.dat");
            std::fs::write(&dest, &original).unwrap();
            let path = Path::try_from(dest.clone()).unwrap();
            let options = AtomicWriteOptions {
                strategy: PublishStrategy::NoClobber,
                ..AtomicWriteOptions::default()
            };

            let result = write_atomic(&path, &attempted, &options);
            prop_assert!(result.is_err());
            prop_assert_eq!(std::fs::read(&dest).unwrap(), original);
        }
    }
}
