//! Orphan temp-file reaper.
//!
//! Best-effort operator tooling: lists a directory, matches the naming
//! conventions the atomic and streaming engines use for their temp files,
//! and removes entries older than a caller-supplied age threshold. Never
//! runs implicitly — nothing in [`crate::atomic`] or [`crate::streaming`]
//! calls this.

use std::time::{Duration, SystemTime};

use crate::metadata::{read_dir, ReadDirError};
use crate::path::Path;

/// An orphaned temp file identified by naming convention, along with the
/// age derived from its modification time.
#[derive(Debug, Clone)]
pub struct OrphanCandidate {
    pub path: Path,
    pub age: Duration,
}

fn matches_atomic_pattern(name: &str) -> bool {
    name.starts_with('.') && name.contains(".atomic.") && name.ends_with(".tmp")
}

fn matches_streaming_pattern(name: &str) -> bool {
    name.starts_with('.') && name.contains(".streaming.") && name.ends_with(".tmp")
}

/// Lists `dir` for entries matching `.<name>.atomic.<pid>.<hex>.tmp` or
/// `.<name>.streaming.<hex>.tmp` and returns those older than `min_age`.
/// Does not remove anything; pair with [`reap`] to act on the result.
pub fn find_orphans(dir: &Path, min_age: Duration, now: SystemTime) -> Result<Vec<OrphanCandidate>, ReadDirError> {
    let entries = read_dir(dir)?;
    let mut candidates = Vec::new();

    for entry in entries {
        let Some(name) = entry.name.as_str() else { continue };
        if !matches_atomic_pattern(name) && !matches_streaming_pattern(name) {
            continue;
        }
        let Ok(meta) = crate::metadata::lstat(&entry.path) else { continue };
        let age = now.duration_since(meta.modified).unwrap_or(Duration::ZERO);
        if age >= min_age {
            candidates.push(OrphanCandidate { path: entry.path, age });
        }
    }

    Ok(candidates)
}

/// Removes every candidate, ignoring individual removal failures (the file
/// may have been cleaned up by its owning write already). Returns the
/// number actually removed.
pub fn reap(candidates: &[OrphanCandidate]) -> usize {
    candidates
        .iter()
        .filter(|c| std::fs::remove_file(c.path.as_std_path()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_atomic_and_streaming_names() {
        assert!(matches_atomic_pattern(".file.txt.atomic.123.abcdef.tmp"));
        assert!(matches_streaming_pattern(".file.txt.streaming.abcdef.tmp"));
        assert!(!matches_atomic_pattern("file.txt"));
        assert!(!matches_streaming_pattern(".file.txt.tmp"));
    }

    #[test]
    fn find_orphans_respects_age_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join(".dest.atomic.1.deadbeef.tmp");
        std::fs::write(&orphan, b"x").unwrap();
        let fresh = dir.path().join(".dest.atomic.1.cafebabe.tmp");
        std::fs::write(&fresh, b"x").unwrap();

        let path = Path::try_from(dir.path().to_path_buf()).unwrap();
        let now = SystemTime::now() + Duration::from_secs(3600);
        let candidates = find_orphans(&path, Duration::from_secs(1800), now).unwrap();

        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn find_orphans_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("normal.txt"), b"x").unwrap();

        let path = Path::try_from(dir.path().to_path_buf()).unwrap();
        let candidates = find_orphans(&path, Duration::ZERO, SystemTime::now()).unwrap();

        assert!(candidates.is_empty());
    }

    #[test]
    fn reap_removes_candidates_and_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join(".dest.atomic.1.deadbeef.tmp");
        std::fs::write(&orphan, b"x").unwrap();

        let path = Path::try_from(dir.path().to_path_buf()).unwrap();
        let candidates = find_orphans(&path, Duration::ZERO, SystemTime::now()).unwrap();
        let removed = reap(&candidates);

        assert_eq!(removed, 1);
        assert!(!orphan.exists());
    }
}
