//! Debug-only syscall-override harness for fault-injection tests.
//!
//! Compiled in only under the `test-overrides` Cargo feature, which is
//! default-off and must never be enabled in a published build: these are
//! process-global hooks, and letting production code depend on global
//! mutable state here would undermine every concurrency guarantee the rest
//! of the crate makes.

use std::sync::OnceLock;
use std::sync::RwLock;

/// Forces the next matching syscall site to fail with the given `errno`
/// instead of performing the real call, or to succeed with a specific
/// result, depending on the hook.
#[derive(Debug, Clone, Copy)]
pub enum Injected {
    /// Fail with this `errno`/`GetLastError` value.
    Fail(i32),
    /// Succeed, but report a short write of this many bytes.
    ShortWrite(usize),
}

#[derive(Default)]
struct HookTable {
    open: RwLock<Option<Injected>>,
    fsync: RwLock<Option<Injected>>,
    fdatasync: RwLock<Option<Injected>>,
    getrandom: RwLock<Option<Injected>>,
    rename: RwLock<Option<Injected>>,
    renameat2: RwLock<Option<Injected>>,
    write: RwLock<Option<Injected>>,
}

fn table() -> &'static HookTable {
    static TABLE: OnceLock<HookTable> = OnceLock::new();
    TABLE.get_or_init(HookTable::default)
}

macro_rules! hook_accessors {
    ($field:ident, $set:ident, $get:ident, $clear:ident) => {
        pub fn $set(value: Injected) {
            *table().$field.write().unwrap() = Some(value);
        }

        pub fn $get() -> Option<Injected> {
            *table().$field.read().unwrap()
        }

        pub fn $clear() {
            *table().$field.write().unwrap() = None;
        }
    };
}

hook_accessors!(open, set_open_override, open_override, clear_open_override);
hook_accessors!(fsync, set_fsync_override, fsync_override, clear_fsync_override);
hook_accessors!(fdatasync, set_fdatasync_override, fdatasync_override, clear_fdatasync_override);
hook_accessors!(getrandom, set_getrandom_override, getrandom_override, clear_getrandom_override);
hook_accessors!(rename, set_rename_override, rename_override, clear_rename_override);
hook_accessors!(renameat2, set_renameat2_override, renameat2_override, clear_renameat2_override);
hook_accessors!(write, set_write_override, write_override, clear_write_override);

/// Clears every hook. Tests should call this in a `Drop` guard or at the
/// top of each case, since the hooks are process-global and otherwise leak
/// between tests run in the same process.
pub fn clear_all() {
    clear_open_override();
    clear_fsync_override();
    clear_fdatasync_override();
    clear_getrandom_override();
    clear_rename_override();
    clear_renameat2_override();
    clear_write_override();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_round_trip() {
        clear_all();
        assert!(fsync_override().is_none());
        set_fsync_override(Injected::Fail(5));
        assert!(matches!(fsync_override(), Some(Injected::Fail(5))));
        clear_fsync_override();
        assert!(fsync_override().is_none());
    }

    #[test]
    fn clear_all_resets_every_hook() {
        set_open_override(Injected::Fail(1));
        set_write_override(Injected::ShortWrite(1));
        clear_all();
        assert!(open_override().is_none());
        assert!(write_override().is_none());
    }
}
