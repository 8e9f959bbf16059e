//! POSIX-specific path resolution and C-string interop.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path as StdPath, PathBuf};

use super::PathError;

/// Expands a leading `~` via `HOME`, prefixes CWD for relative paths, then
/// strips trailing slashes (root excepted).
pub(super) fn resolve(input: &str) -> Result<PathBuf, PathError> {
    if input.is_empty() {
        return Err(PathError::Empty);
    }

    let expanded = if let Some(rest) = input.strip_prefix("~/") {
        let home = std::env::var("HOME").map_err(|_| PathError::HomeNotSet)?;
        format!("{home}/{rest}")
    } else if input == "~" {
        std::env::var("HOME").map_err(|_| PathError::HomeNotSet)?
    } else {
        input.to_string()
    };

    let mut buf = PathBuf::from(&expanded);
    if !buf.is_absolute() {
        let cwd = std::env::current_dir().map_err(PathError::CurrentDirUnavailable)?;
        buf = if expanded == "." {
            cwd
        } else if let Some(rest) = expanded.strip_prefix("./") {
            cwd.join(rest)
        } else {
            cwd.join(&expanded)
        };
    }

    Ok(strip_trailing_slashes(buf))
}

/// Strips trailing `/` characters from `buf`, leaving the root (`/`) alone.
fn strip_trailing_slashes(buf: PathBuf) -> PathBuf {
    let bytes = buf.as_os_str().as_bytes();
    if bytes.len() <= 1 {
        return buf;
    }
    let mut end = bytes.len();
    while end > 1 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    if end == bytes.len() {
        buf
    } else {
        PathBuf::from(OsStr::from_bytes(&bytes[..end]))
    }
}

/// Borrows `path` as a NUL-terminated C string for passing to raw `libc`
/// calls. Fails only if the path somehow already contains an interior NUL,
/// which [`super::Path::new`] should have rejected at construction time.
pub(super) fn to_c_string(path: &StdPath) -> Result<CString, PathError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| PathError::ContainsNul)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_expands_home_prefix() {
        std::env::set_var("HOME", "/home/tester");
        let resolved = resolve("~/project/file.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/home/tester/project/file.txt"));
    }

    #[test]
    fn resolve_expands_bare_tilde() {
        std::env::set_var("HOME", "/home/tester");
        let resolved = resolve("~").unwrap();
        assert_eq!(resolved, PathBuf::from("/home/tester"));
    }

    #[test]
    fn resolve_strips_trailing_slashes_but_keeps_root() {
        let resolved = resolve("/tmp/foo///").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/foo"));

        let resolved_root = resolve("/").unwrap();
        assert_eq!(resolved_root, PathBuf::from("/"));
    }

    #[test]
    fn resolve_prefixes_relative_with_cwd() {
        let cwd = std::env::current_dir().unwrap();
        let resolved = resolve("relative/file").unwrap();
        assert_eq!(resolved, cwd.join("relative/file"));
    }

    #[test]
    fn to_c_string_round_trips() {
        let path = StdPath::new("/tmp/foo.txt");
        let c = to_c_string(path).unwrap();
        assert_eq!(c.to_str().unwrap(), "/tmp/foo.txt");
    }
}
