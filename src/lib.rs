//! durable-fs: crash-safe atomic and streaming file writes.
//!
//! The two subsystems that matter are [`atomic::write_atomic`] (span-in,
//! path-out, ten-step commit pipeline) and the [`streaming`] engine
//! (open/write/commit/cleanup, sharing the same commit semantics for
//! unbounded or buffer-pull writes). Everything else in this crate —
//! [`path`], [`parent`], [`metadata`], [`copy`], [`reaper`] — exists to
//! support those two engines and to give callers a complete, coherent
//! filesystem primitives surface rather than a bare commit function.

pub mod atomic;
pub mod copy;
pub mod error;
pub mod metadata;
#[cfg(feature = "test-overrides")]
pub mod overrides;
pub mod parent;
pub mod path;
pub mod phase;
pub mod reaper;
pub mod streaming;
mod sys;

pub use atomic::{write_atomic, AtomicWriteError, AtomicWriteOptions, PublishStrategy};
pub use error::{Code, Error, OpenError};
pub use metadata::{
    lstat, read_dir, stat, DirEntry, FileIdentity, FileKind, Metadata, OwnershipError, PermissionsError,
    ReadDirError, StatError, TimestampsError,
};
pub use parent::{ensure_parent, DirectoryCreation, ParentError};
pub use path::{Component, ComponentError, Name, Path, PathError};
pub use phase::Phase;
pub use reaper::{find_orphans, reap, OrphanCandidate};
pub use streaming::{
    cleanup, commit, open, write, write_all_chunks, write_at, write_with_fill, CommitMode, Context, DirectStrategy,
    StreamingError, StreamingOptions,
};
pub use sys::Durability;
