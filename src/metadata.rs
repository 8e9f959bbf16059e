//! Metadata, directory iteration, and the stat/lstat readers the atomic
//! engine's metadata-preservation step and the parent verifier build on.

use std::time::SystemTime;

use crate::error::Code;
use crate::path::Path;

/// The kind of filesystem entry a [`Metadata`] or [`DirEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    SymbolicLink,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Socket,
    /// Reported by some directory-iteration APIs that don't resolve kind
    /// inline; callers that need the real kind should `stat` the entry.
    Unknown,
}

/// Device + inode (POSIX) or volume + file index (Windows) pair used for
/// symlink/hard-link cycle detection and "is this the same file" checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

/// A point-in-time snapshot of a file's metadata, as returned by [`stat`]
/// and [`lstat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub changed: SystemTime,
    pub created: Option<SystemTime>,
    pub kind: FileKind,
    pub identity: FileIdentity,
    pub link_count: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::SymbolicLink
    }
}

/// A single entry yielded by [`read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: crate::path::Component,
    pub path: Path,
    pub kind: FileKind,
}

/// Errors from `stat`/`lstat`.
#[derive(thiserror::Error, Debug)]
pub enum StatError {
    #[error("path not found: {0}")]
    PathNotFound(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("stat failed ({code}): {message}")]
    OperationFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors applying permission bits (`chmod`/`fchmod`).
#[derive(thiserror::Error, Debug)]
pub enum PermissionsError {
    #[error("path not found: {0}")]
    PathNotFound(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("chmod failed ({code}): {message}")]
    OperationFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors applying ownership (`chown`/`fchown`).
#[derive(thiserror::Error, Debug)]
pub enum OwnershipError {
    #[error("path not found: {0}")]
    PathNotFound(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("chown failed ({code}): {message}")]
    OperationFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors applying timestamps (`utimensat`/`futimens`).
#[derive(thiserror::Error, Debug)]
pub enum TimestampsError {
    #[error("path not found: {0}")]
    PathNotFound(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("utimens failed ({code}): {message}")]
    OperationFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors iterating a directory.
#[derive(thiserror::Error, Debug)]
pub enum ReadDirError {
    #[error("directory not found: {0}")]
    Missing(std::path::PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(std::path::PathBuf),
    #[error("read_dir failed ({code}): {message}")]
    OperationFailed {
        code: Code,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

fn map_std_metadata_err<E>(
    path: &Path,
    err: std::io::Error,
    not_found: impl Fn(std::path::PathBuf) -> E,
    denied: impl Fn(std::path::PathBuf) -> E,
    fallback: impl Fn(Code, String, std::io::Error) -> E,
) -> E {
    match err.kind() {
        std::io::ErrorKind::NotFound => not_found(path.as_std_path().to_path_buf()),
        std::io::ErrorKind::PermissionDenied => denied(path.as_std_path().to_path_buf()),
        _ => {
            let code = Code::from_io(&err);
            let message = err.to_string();
            fallback(code, message, err)
        }
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn to_metadata(meta: &std::fs::Metadata) -> Metadata {
        use std::os::unix::fs::FileTypeExt;
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::SymbolicLink
        } else if meta.file_type().is_block_device() {
            FileKind::BlockDevice
        } else if meta.file_type().is_char_device() {
            FileKind::CharacterDevice
        } else if meta.file_type().is_fifo() {
            FileKind::Fifo
        } else if meta.file_type().is_socket() {
            FileKind::Socket
        } else {
            FileKind::Regular
        };

        let secs_to_time = |secs: i64, nanos: i64| {
            if secs >= 0 {
                SystemTime::UNIX_EPOCH + std::time::Duration::new(secs as u64, nanos as u32)
            } else {
                SystemTime::UNIX_EPOCH - std::time::Duration::new((-secs) as u64, 0)
            }
        };

        Metadata {
            size: meta.size(),
            permissions: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            accessed: secs_to_time(meta.atime(), meta.atime_nsec()),
            modified: secs_to_time(meta.mtime(), meta.mtime_nsec()),
            changed: secs_to_time(meta.ctime(), meta.ctime_nsec()),
            created: meta.created().ok(),
            kind,
            identity: FileIdentity {
                device: meta.dev(),
                inode: meta.ino(),
            },
            link_count: meta.nlink(),
        }
    }

    pub(super) fn stat(path: &Path) -> Result<Metadata, StatError> {
        std::fs::metadata(path.as_std_path())
            .map(|m| to_metadata(&m))
            .map_err(|e| {
                map_std_metadata_err(
                    path,
                    e,
                    StatError::PathNotFound,
                    StatError::PermissionDenied,
                    |code, message, source| StatError::OperationFailed { code, message, source },
                )
            })
    }

    pub(super) fn lstat(path: &Path) -> Result<Metadata, StatError> {
        std::fs::symlink_metadata(path.as_std_path())
            .map(|m| to_metadata(&m))
            .map_err(|e| {
                map_std_metadata_err(
                    path,
                    e,
                    StatError::PathNotFound,
                    StatError::PermissionDenied,
                    |code, message, source| StatError::OperationFailed { code, message, source },
                )
            })
    }

    pub(super) fn read_dir(path: &Path) -> Result<Vec<DirEntry>, ReadDirError> {
        use std::os::unix::fs::FileTypeExt;
        let iter = std::fs::read_dir(path.as_std_path()).map_err(|e| {
            map_std_metadata_err(
                path,
                e,
                ReadDirError::Missing,
                ReadDirError::PermissionDenied,
                |code, message, source| ReadDirError::OperationFailed { code, message, source },
            )
        })?;

        let mut entries = Vec::new();
        for entry in iter {
            let entry = entry.map_err(|e| ReadDirError::OperationFailed {
                code: Code::from_io(&e),
                message: e.to_string(),
                source: e,
            })?;
            let name = crate::path::Component::from_os_str(&entry.file_name())
                .map_err(|_| ReadDirError::OperationFailed {
                    code: Code::Posix(0),
                    message: "invalid directory entry name".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad name"),
                })?;
            let child_path = path.append_component(&name);
            let kind = entry
                .file_type()
                .map(|ft| {
                    if ft.is_dir() {
                        FileKind::Directory
                    } else if ft.is_symlink() {
                        FileKind::SymbolicLink
                    } else if ft.is_block_device() {
                        FileKind::BlockDevice
                    } else if ft.is_char_device() {
                        FileKind::CharacterDevice
                    } else if ft.is_fifo() {
                        FileKind::Fifo
                    } else if ft.is_socket() {
                        FileKind::Socket
                    } else {
                        FileKind::Regular
                    }
                })
                .unwrap_or(FileKind::Unknown);
            entries.push(DirEntry {
                name,
                path: child_path,
                kind,
            });
        }
        Ok(entries)
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;

    fn to_metadata(meta: &std::fs::Metadata) -> Metadata {
        use std::os::windows::fs::MetadataExt;
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::SymbolicLink
        } else {
            FileKind::Regular
        };
        Metadata {
            size: meta.len(),
            permissions: if meta.permissions().readonly() { 0o444 } else { 0o666 },
            uid: 0,
            gid: 0,
            accessed: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            changed: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            created: meta.created().ok(),
            kind,
            identity: FileIdentity {
                device: meta.volume_serial_number().unwrap_or(0) as u64,
                inode: meta.file_index().unwrap_or(0),
            },
            link_count: meta.number_of_links().unwrap_or(1) as u64,
        }
    }

    pub(super) fn stat(path: &Path) -> Result<Metadata, StatError> {
        std::fs::metadata(path.as_std_path()).map(|m| to_metadata(&m)).map_err(|e| {
            map_std_metadata_err(
                path,
                e,
                StatError::PathNotFound,
                StatError::PermissionDenied,
                |code, message, source| StatError::OperationFailed { code, message, source },
            )
        })
    }

    pub(super) fn lstat(path: &Path) -> Result<Metadata, StatError> {
        std::fs::symlink_metadata(path.as_std_path()).map(|m| to_metadata(&m)).map_err(|e| {
            map_std_metadata_err(
                path,
                e,
                StatError::PathNotFound,
                StatError::PermissionDenied,
                |code, message, source| StatError::OperationFailed { code, message, source },
            )
        })
    }

    pub(super) fn read_dir(path: &Path) -> Result<Vec<DirEntry>, ReadDirError> {
        let iter = std::fs::read_dir(path.as_std_path()).map_err(|e| {
            map_std_metadata_err(
                path,
                e,
                ReadDirError::Missing,
                ReadDirError::PermissionDenied,
                |code, message, source| ReadDirError::OperationFailed { code, message, source },
            )
        })?;
        let mut entries = Vec::new();
        for entry in iter {
            let entry = entry.map_err(|e| ReadDirError::OperationFailed {
                code: Code::from_io(&e),
                message: e.to_string(),
                source: e,
            })?;
            let name = crate::path::Component::from_os_str(&entry.file_name())
                .map_err(|_| ReadDirError::OperationFailed {
                    code: Code::Windows(0),
                    message: "invalid directory entry name".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad name"),
                })?;
            let child_path = path.append_component(&name);
            let kind = entry.file_type().map(|ft| if ft.is_dir() { FileKind::Directory } else { FileKind::Regular }).unwrap_or(FileKind::Unknown);
            entries.push(DirEntry { name, path: child_path, kind });
        }
        Ok(entries)
    }
}

#[cfg(unix)]
use unix_impl as platform;
#[cfg(windows)]
use windows_impl as platform;

/// Follows symlinks.
pub fn stat(path: &Path) -> Result<Metadata, StatError> {
    platform::stat(path)
}

/// Does not follow a terminal symlink, matching `lstat(2)` semantics. The
/// atomic engine uses this in step 3 of its pipeline so the pre-publish
/// existence check is not fooled by a dangling or redirecting symlink.
pub fn lstat(path: &Path) -> Result<Metadata, StatError> {
    platform::lstat(path)
}

/// Lists the entries of a directory.
pub fn read_dir(path: &Path) -> Result<Vec<DirEntry>, ReadDirError> {
    platform::read_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_missing_path_maps_to_path_not_found() {
        let path = Path::new("/definitely/does/not/exist/xyz").unwrap();
        let err = stat(&path).unwrap_err();
        assert!(matches!(err, StatError::PathNotFound(_)));
    }

    #[test]
    fn stat_and_lstat_agree_on_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"hi").unwrap();
        let path = Path::try_from(file).unwrap();

        let meta = stat(&path).unwrap();
        let lmeta = lstat(&path).unwrap();
        assert_eq!(meta.kind, FileKind::Regular);
        assert_eq!(lmeta.kind, FileKind::Regular);
        assert_eq!(meta.size, 2);
    }

    #[test]
    fn read_dir_lists_children() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let path = Path::try_from(dir.path().to_path_buf()).unwrap();
        let mut names: Vec<String> = read_dir(&path)
            .unwrap()
            .into_iter()
            .filter_map(|e| e.name.as_str().map(String::from))
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn read_dir_missing_maps_to_missing() {
        let path = Path::new("/definitely/does/not/exist/dir").unwrap();
        let err = read_dir(&path).unwrap_err();
        assert!(matches!(err, ReadDirError::Missing(_)));
    }

    #[cfg(unix)]
    #[test]
    fn lstat_reports_symlink_kind_without_following() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let link_path = Path::try_from(link).unwrap();
        let meta = lstat(&link_path).unwrap();
        assert_eq!(meta.kind, FileKind::SymbolicLink);

        let followed = stat(&link_path).unwrap();
        assert_eq!(followed.kind, FileKind::Regular);
    }
}
