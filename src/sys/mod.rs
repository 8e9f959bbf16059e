//! Platform dispatch layer.
//!
//! Everything in this module talks directly to the OS: raw file
//! descriptors/handles, `fsync`-family calls, atomic rename primitives, and
//! the CSPRNG used to make temp-file names unguessable. Higher-level
//! modules ([`crate::atomic`], [`crate::streaming`]) never call `libc` or
//! `windows-sys` directly; they go through the functions re-exported here.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::*;
#[cfg(windows)]
pub(crate) use windows::*;

use std::sync::OnceLock;

/// Durability level requested for a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Sync file data and metadata, then sync the containing directory.
    Full,
    /// Sync file data only; skip the directory sync.
    DataOnly,
    /// Perform no explicit sync at all, relying on the OS to flush
    /// eventually. Fast, and not crash-safe.
    None,
}

/// Caches the result of a one-time kernel feature probe so every subsequent
/// write doesn't pay for a syscall whose answer cannot change for the
/// lifetime of the process.
pub(crate) struct FeatureCache {
    renameat2_no_replace: OnceLock<bool>,
    full_fsync: OnceLock<bool>,
}

impl FeatureCache {
    const fn new() -> Self {
        FeatureCache {
            renameat2_no_replace: OnceLock::new(),
            full_fsync: OnceLock::new(),
        }
    }

    pub(crate) fn renameat2_no_replace_supported(&self) -> bool {
        *self.renameat2_no_replace.get_or_init(probe_renameat2_no_replace)
    }

    pub(crate) fn full_fsync_supported(&self) -> bool {
        *self.full_fsync.get_or_init(probe_full_fsync)
    }
}

static FEATURE_CACHE: FeatureCache = FeatureCache::new();

pub(crate) fn feature_cache() -> &'static FeatureCache {
    &FEATURE_CACHE
}

#[cfg(target_os = "linux")]
fn probe_renameat2_no_replace() -> bool {
    unix::probe_renameat2_no_replace()
}

#[cfg(not(target_os = "linux"))]
fn probe_renameat2_no_replace() -> bool {
    tracing::debug!("renameat2(RENAME_NOREPLACE) not applicable on this platform");
    false
}

#[cfg(target_os = "macos")]
fn probe_full_fsync() -> bool {
    tracing::debug!("F_FULLFSYNC assumed supported on Darwin");
    true
}

#[cfg(not(target_os = "macos"))]
fn probe_full_fsync() -> bool {
    false
}

/// Generates `len` cryptographically random bytes for use in a temp-file
/// name suffix. A guessable suffix would let a concurrent attacker predict
/// and pre-create the temp path, turning the atomic rename into a symlink
/// race.
pub(crate) fn random_suffix(len: usize) -> Result<String, getrandom::Error> {
    #[cfg(feature = "test-overrides")]
    if let Some(crate::overrides::Injected::Fail(errno)) = crate::overrides::getrandom_override() {
        let code = std::num::NonZeroU32::new(errno as u32)
            .unwrap_or_else(|| std::num::NonZeroU32::new(1).unwrap());
        return Err(getrandom::Error::from(code));
    }
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes)?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_has_expected_hex_length() {
        let suffix = random_suffix(8).unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_suffix_is_not_trivially_repeated() {
        let a = random_suffix(16).unwrap();
        let b = random_suffix(16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn feature_cache_is_stable_across_calls() {
        let cache = feature_cache();
        let first = cache.full_fsync_supported();
        let second = cache.full_fsync_supported();
        assert_eq!(first, second);
    }
}
