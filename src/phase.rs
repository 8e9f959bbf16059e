//! Commit phase tracker.
//!
//! Both the atomic engine ([`crate::atomic`]) and the streaming engine
//! ([`crate::streaming`]) thread an explicit [`Phase`] value through their
//! pipeline rather than inferring progress from which steps already ran.
//! The cleanup code and the `after_commit` error decisions depend on this
//! value: a regression that advances `Phase::RenamedPublished` only after
//! the directory sync runs would silently delete freshly-published files on
//! any post-publish failure.

use std::fmt;

/// Ordered progress marker for a single atomic or streaming write.
///
/// Ordering is total (`pending < writing < ... < syncedDirectory`) and is
/// the whole point of the type: cleanup logic compares `phase` against
/// [`Phase::RenamedPublished`] to decide whether unlinking the temp path is
/// still safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Nothing has happened yet beyond resolving the destination path.
    Pending = 0,
    /// The temp file is open and bytes are being written to it.
    Writing = 1,
    /// All bytes have been written and the requested data sync has
    /// completed.
    SyncedFile = 2,
    /// The temp file descriptor has been closed exactly once.
    Closed = 3,
    /// The atomic publish (rename or link+unlink) has succeeded. From this
    /// point on the destination is visible with the new contents and
    /// cleanup must never unlink the temp path.
    RenamedPublished = 4,
    /// A directory-sync attempt has started (set *before* the syscall runs,
    /// so a crash or error during the syscall still distinguishes "tried"
    /// from "never tried").
    DirectorySyncAttempted = 5,
    /// The directory sync succeeded; the publish is now fully durable.
    SyncedDirectory = 6,
}

impl Phase {
    /// `true` once the destination path refers to the new file contents.
    pub fn published(self) -> bool {
        self >= Phase::RenamedPublished
    }

    /// `true` once a directory-durability attempt has been made, whether or
    /// not it succeeded. Lets post-mortem error handling distinguish "never
    /// tried" from "tried and failed."
    pub fn durability_attempted(self) -> bool {
        self >= Phase::DirectorySyncAttempted
    }

    /// `true` if the temp file may still be safely unlinked during cleanup.
    /// Once publish has happened the temp name may be a second hard link to
    /// the destination's inode (link+unlink fallback) or may simply no
    /// longer exist (rename fallback), and unlinking it is never correct
    /// either way.
    pub fn temp_file_removable(self) -> bool {
        self < Phase::RenamedPublished
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "pending",
            Phase::Writing => "writing",
            Phase::SyncedFile => "syncedFile",
            Phase::Closed => "closed",
            Phase::RenamedPublished => "renamedPublished",
            Phase::DirectorySyncAttempted => "directorySyncAttempted",
            Phase::SyncedDirectory => "syncedDirectory",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_and_monotonic() {
        let phases = [
            Phase::Pending,
            Phase::Writing,
            Phase::SyncedFile,
            Phase::Closed,
            Phase::RenamedPublished,
            Phase::DirectorySyncAttempted,
            Phase::SyncedDirectory,
        ];
        for window in phases.windows(2) {
            assert!(window[0] < window[1], "{:?} should precede {:?}", window[0], window[1]);
        }
    }

    #[test]
    fn published_is_false_before_rename_and_true_after() {
        assert!(!Phase::Closed.published());
        assert!(Phase::RenamedPublished.published());
        assert!(Phase::SyncedDirectory.published());
    }

    #[test]
    fn durability_attempted_tracks_directory_sync_start() {
        assert!(!Phase::RenamedPublished.durability_attempted());
        assert!(Phase::DirectorySyncAttempted.durability_attempted());
        assert!(Phase::SyncedDirectory.durability_attempted());
    }

    #[test]
    fn temp_file_removable_is_exactly_before_publish() {
        assert!(Phase::Pending.temp_file_removable());
        assert!(Phase::Closed.temp_file_removable());
        assert!(!Phase::RenamedPublished.temp_file_removable());
        assert!(!Phase::SyncedDirectory.temp_file_removable());
    }

    #[test]
    fn display_matches_spec_names() {
        assert_eq!(Phase::RenamedPublished.to_string(), "renamedPublished");
        assert_eq!(Phase::SyncedDirectory.to_string(), "syncedDirectory");
    }
}
