//! Validated path and path-component values.
//!
//! [`Path`] wraps [`std::path::PathBuf`] rather than re-deriving a byte
//! buffer from scratch: the standard library already stores platform-native
//! path bytes (arbitrary bytes on Unix, WTF-8-encoded UTF-16 on Windows) and
//! gives us `Display`/hashing/comparison for free. What this module adds on
//! top is the validation and resolution behavior that matters for crash-safe
//! writes — non-empty, no embedded NUL, no control characters, tilde/CWD
//! resolution, Windows separator normalization and root detection — none of
//! which `std::path::Path` enforces on its own.

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod windows;

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// Errors constructing or resolving a [`Path`].
#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains an embedded NUL byte")]
    ContainsNul,
    #[error("path contains an ASCII control character")]
    ContainsControlChar,
    #[error("HOME is not set; cannot expand '~'")]
    HomeNotSet,
    #[error("current directory is unavailable: {0}")]
    CurrentDirUnavailable(#[source] std::io::Error),
    #[error("path is not valid UTF-16")]
    InvalidUtf16,
}

impl Clone for PathError {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::ContainsNul => Self::ContainsNul,
            Self::ContainsControlChar => Self::ContainsControlChar,
            Self::HomeNotSet => Self::HomeNotSet,
            Self::CurrentDirUnavailable(e) => {
                Self::CurrentDirUnavailable(std::io::Error::from(e.kind()))
            }
            Self::InvalidUtf16 => Self::InvalidUtf16,
        }
    }
}

impl PartialEq for PathError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => true,
            (Self::ContainsNul, Self::ContainsNul) => true,
            (Self::ContainsControlChar, Self::ContainsControlChar) => true,
            (Self::HomeNotSet, Self::HomeNotSet) => true,
            (Self::CurrentDirUnavailable(a), Self::CurrentDirUnavailable(b)) => {
                a.kind() == b.kind()
            }
            (Self::InvalidUtf16, Self::InvalidUtf16) => true,
            _ => false,
        }
    }
}

impl Eq for PathError {}

/// Errors constructing a [`Component`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("component is empty")]
    Empty,
    #[error("component contains a path separator")]
    ContainsSeparator,
    #[error("component contains an embedded NUL byte")]
    ContainsNul,
    #[error("component contains an ASCII control character")]
    ContainsControlChar,
}

/// An immutable, validated filesystem path.
///
/// Construction always validates: non-empty, no embedded NUL, no ASCII
/// control characters (except via the POSIX byte-level escape hatch
/// `Path::from_bytes_unchecked`, which only forbids `/` and NUL, mirroring
/// how Unix itself treats path bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path(PathBuf);

impl Path {
    /// Validates the invariants shared by every constructor: non-empty, no
    /// NUL, no ASCII control characters.
    fn validate(s: &str) -> Result<(), PathError> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        if s.as_bytes().contains(&0) {
            return Err(PathError::ContainsNul);
        }
        if s.chars().any(|c| c.is_ascii_control()) {
            return Err(PathError::ContainsControlChar);
        }
        Ok(())
    }

    /// Constructs a `Path` from a UTF-8 string, validating per the rules
    /// above. On Windows this also normalizes separators to `\` and strips
    /// trailing separators (root excepted).
    pub fn new(s: &str) -> Result<Self, PathError> {
        Self::validate(s)?;
        #[cfg(windows)]
        {
            let normalized = windows::normalize(s);
            Ok(Path(PathBuf::from(normalized)))
        }
        #[cfg(not(windows))]
        {
            Ok(Path(PathBuf::from(s)))
        }
    }

    /// Constructs a `Path` from a platform [`OsString`]. Only checked for
    /// non-emptiness, since an `OsString` sourced from the OS itself may
    /// already contain bytes that wouldn't survive UTF-8 round-tripping.
    pub fn from_os_string(s: OsString) -> Result<Self, PathError> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Path(PathBuf::from(s)))
    }

    /// Constructs a `Path` from a trusted, already-validated C string
    /// without re-validating it. Intended for wrapping paths returned by
    /// syscalls such as `readlink`, which the kernel already guarantees are
    /// well-formed.
    #[cfg(unix)]
    pub fn from_c_str_unchecked(s: &std::ffi::CStr) -> Self {
        use std::os::unix::ffi::OsStrExt;
        Path(PathBuf::from(OsStr::from_bytes(s.to_bytes())))
    }

    /// POSIX byte-level constructor: raw bytes are accepted as-is except for
    /// `/` and an embedded NUL, matching how the kernel itself treats a
    /// path. Ignores the ASCII-control-character rule that the string-level
    /// constructors enforce.
    #[cfg(unix)]
    pub fn from_bytes_unchecked(bytes: &[u8]) -> Result<Self, PathError> {
        use std::os::unix::ffi::OsStrExt;
        if bytes.is_empty() {
            return Err(PathError::Empty);
        }
        if bytes.contains(&0) {
            return Err(PathError::ContainsNul);
        }
        Ok(Path(PathBuf::from(OsStr::from_bytes(bytes))))
    }

    /// Constructs a `Path` from UTF-16 code units, normalizing separators
    /// and validating the result.
    #[cfg(windows)]
    pub fn from_utf16(units: &[u16]) -> Result<Self, PathError> {
        let normalized = windows::from_utf16(units)?;
        Ok(Path(PathBuf::from(normalized)))
    }

    /// The "resolving" constructor (POSIX only): expands a leading `~` via
    /// `HOME`, prefixes CWD for relative paths, and strips trailing
    /// slashes.
    #[cfg(unix)]
    pub fn resolve(s: &str) -> Result<Self, PathError> {
        let buf = posix::resolve(s)?;
        Ok(Path(buf))
    }

    /// The parent directory of this path, or `None` at the root.
    pub fn parent(&self) -> Option<Path> {
        self.0.parent().filter(|p| !p.as_os_str().is_empty()).map(|p| Path(p.to_path_buf()))
    }

    /// Returns `self`'s parent, or a clone of `self` if it is already the
    /// root. Used internally by the write engines so "write to `/x`" still
    /// has a directory to `fsync`.
    pub(crate) fn parent_or_self(&self) -> Path {
        self.parent().unwrap_or_else(|| self.clone())
    }

    /// The last path component (the file or directory name), if any.
    pub fn last_component(&self) -> Option<Component> {
        self.0.file_name().and_then(|name| Component::from_os_str(name).ok())
    }

    /// The file extension, without the leading dot.
    pub fn extension(&self) -> Option<&str> {
        self.0.extension().and_then(OsStr::to_str)
    }

    /// The file stem (name without its extension).
    pub fn stem(&self) -> Option<&str> {
        self.0.file_stem().and_then(OsStr::to_str)
    }

    /// Returns a new path with `component` appended.
    pub fn append_component(&self, component: &Component) -> Path {
        let mut buf = self.0.clone();
        buf.push(component.as_os_str());
        Path(buf)
    }

    /// Returns a new path with `other`'s components appended.
    pub fn append_path(&self, other: &Path) -> Path {
        let mut buf = self.0.clone();
        buf.push(&other.0);
        Path(buf)
    }

    /// Returns a new path with a raw string segment appended, validated the
    /// same way [`Path::new`] validates a whole path.
    pub fn append_str(&self, segment: &str) -> Result<Path, PathError> {
        Self::validate(segment)?;
        let mut buf = self.0.clone();
        buf.push(segment);
        Ok(Path(buf))
    }

    /// Borrows the path as a standard library [`std::path::Path`], for
    /// interop with APIs (like `libc`/`windows-sys` wrappers) that expect
    /// one.
    pub fn as_std_path(&self) -> &std::path::Path {
        &self.0
    }

    /// Serializes the path to UTF-8 bytes, if it is valid UTF-8. Paths
    /// constructed from [`Path::from_bytes_unchecked`] on a filesystem with
    /// non-UTF-8 names may return `None`.
    pub fn to_utf8_bytes(&self) -> Option<Vec<u8>> {
        self.0.to_str().map(|s| s.as_bytes().to_vec())
    }

    /// Borrows this path as a NUL-terminated C string for raw syscalls.
    #[cfg(unix)]
    pub fn to_c_string(&self) -> Result<std::ffi::CString, PathError> {
        posix::to_c_string(&self.0)
    }

    /// `true` if this path is one of the five Windows root classes (drive
    /// root, UNC root, extended drive, extended UNC, device path). Always
    /// `false` on POSIX, where the filesystem root `/` is just an ordinary
    /// directory for these purposes.
    pub fn is_windows_root(&self) -> bool {
        #[cfg(windows)]
        {
            self.0.to_str().map(windows::is_root).unwrap_or(false)
        }
        #[cfg(not(windows))]
        {
            false
        }
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<std::path::Path> for Path {
    fn as_ref(&self) -> &std::path::Path {
        &self.0
    }
}

impl TryFrom<&str> for Path {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Path::new(value)
    }
}

impl TryFrom<PathBuf> for Path {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        Path::from_os_string(value.into_os_string())
    }
}

/// A single, validated path segment (one component between separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component(OsString);

impl Component {
    /// Validates a string-level component: non-empty, excludes `/` (and
    /// `\` on Windows) and NUL, excludes ASCII control characters.
    pub fn new(s: &str) -> Result<Self, ComponentError> {
        if s.is_empty() {
            return Err(ComponentError::Empty);
        }
        if s.contains('/') {
            return Err(ComponentError::ContainsSeparator);
        }
        #[cfg(windows)]
        if s.contains('\\') {
            return Err(ComponentError::ContainsSeparator);
        }
        if s.as_bytes().contains(&0) {
            return Err(ComponentError::ContainsNul);
        }
        if s.chars().any(|c| c.is_ascii_control()) {
            return Err(ComponentError::ContainsControlChar);
        }
        Ok(Component(OsString::from(s)))
    }

    /// Validates an [`OsStr`]-level component, falling back to lossy UTF-8
    /// conversion for the control-character check (a non-UTF-8 byte sequence
    /// cannot contain an ASCII control character it doesn't encode).
    pub fn from_os_str(s: &OsStr) -> Result<Self, ComponentError> {
        match s.to_str() {
            Some(valid) => Component::new(valid),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::ffi::OsStrExt;
                    Component::from_bytes_posix(s.as_bytes())
                }
                #[cfg(not(unix))]
                {
                    Err(ComponentError::ContainsControlChar)
                }
            }
        }
    }

    /// POSIX byte-level constructor: raw bytes are accepted as-is except
    /// for `/` and NUL, matching kernel semantics (Unix allows arbitrary
    /// bytes, including control bytes, in a filename).
    #[cfg(unix)]
    pub fn from_bytes_posix(bytes: &[u8]) -> Result<Self, ComponentError> {
        use std::os::unix::ffi::OsStrExt;
        if bytes.is_empty() {
            return Err(ComponentError::Empty);
        }
        if bytes.contains(&b'/') {
            return Err(ComponentError::ContainsSeparator);
        }
        if bytes.contains(&0) {
            return Err(ComponentError::ContainsNul);
        }
        Ok(Component(OsString::from(OsStr::from_bytes(bytes))))
    }

    /// Borrows the component as an [`OsStr`].
    pub fn as_os_str(&self) -> &OsStr {
        &self.0
    }

    /// Borrows the component as `&str`, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.0.to_str()
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl TryFrom<&str> for Component {
    type Error = ComponentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Component::new(value)
    }
}

/// A single-segment path value used at API boundaries that only ever accept
/// one component — e.g. the basename the atomic engine uses to build a
/// temp-file name. Implemented as a thin wrapper around [`Component`] so the
/// two types share validation and never diverge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(Component);

impl Name {
    pub fn new(s: &str) -> Result<Self, ComponentError> {
        Component::new(s).map(Name)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl std::ops::Deref for Name {
    type Target = Component;

    fn deref(&self) -> &Component {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(matches!(Path::new(""), Err(PathError::Empty)));
    }

    #[test]
    fn rejects_embedded_nul() {
        assert!(matches!(Path::new("foo\0bar"), Err(PathError::ContainsNul)));
    }

    #[test]
    fn rejects_control_character() {
        assert!(matches!(Path::new("foo\nbar"), Err(PathError::ContainsControlChar)));
    }

    #[test]
    fn parent_is_none_at_root() {
        let root = Path::new("/").unwrap();
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn parent_or_self_returns_self_at_root() {
        let root = Path::new("/").unwrap();
        assert_eq!(root.parent_or_self(), root);
    }

    #[test]
    fn parent_returns_directory() {
        let path = Path::new("/tmp/foo/bar.txt").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.to_string(), "/tmp/foo");
    }

    #[test]
    fn last_component_and_extension_and_stem() {
        let path = Path::new("/tmp/foo/bar.txt").unwrap();
        assert_eq!(path.last_component().unwrap().as_str(), Some("bar.txt"));
        assert_eq!(path.extension(), Some("txt"));
        assert_eq!(path.stem(), Some("bar"));
    }

    #[test]
    fn append_component_builds_new_path() {
        let dir = Path::new("/tmp/foo").unwrap();
        let name = Component::new("bar.txt").unwrap();
        let full = dir.append_component(&name);
        assert_eq!(full.to_string(), "/tmp/foo/bar.txt");
    }

    #[test]
    fn append_path_and_append_str() {
        let dir = Path::new("/tmp/foo").unwrap();
        let sub = Path::new("bar/baz.txt").unwrap();
        assert_eq!(dir.append_path(&sub).to_string(), "/tmp/foo/bar/baz.txt");
        assert_eq!(dir.append_str("bar.txt").unwrap().to_string(), "/tmp/foo/bar.txt");
    }

    #[test]
    fn component_rejects_separator_and_empty() {
        assert!(matches!(Component::new(""), Err(ComponentError::Empty)));
        assert!(matches!(Component::new("a/b"), Err(ComponentError::ContainsSeparator)));
    }

    #[test]
    fn name_derefs_to_component() {
        let name = Name::new("file.txt").unwrap();
        assert_eq!(name.as_str(), Some("file.txt"));
        assert_eq!(name.as_os_str(), std::ffi::OsStr::new("file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn posix_byte_constructor_allows_control_bytes() {
        let path = Path::from_bytes_unchecked(b"weird\x01name").unwrap();
        assert!(path.to_utf8_bytes().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn posix_byte_constructor_rejects_slash() {
        // Slash is a separator, not a legal byte inside a single segment,
        // but `Path::from_bytes_unchecked` builds a whole path, so `/` is
        // fine there; `Component::from_bytes_posix` is where it is
        // rejected.
        assert!(matches!(
            Component::from_bytes_posix(b"a/b"),
            Err(ComponentError::ContainsSeparator)
        ));
    }

    #[test]
    fn try_from_str_and_pathbuf() {
        let from_str: Path = "/tmp/a".try_into().unwrap();
        assert_eq!(from_str.to_string(), "/tmp/a");

        let from_buf: Path = PathBuf::from("/tmp/b").try_into().unwrap();
        assert_eq!(from_buf.to_string(), "/tmp/b");
    }
}
