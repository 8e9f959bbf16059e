//! POSIX syscall wrappers: open/write/close, durability syncs, atomic
//! rename, and metadata preservation.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};

use crate::path::Path;
use crate::sys::Durability;

#[cfg(feature = "test-overrides")]
fn check_open_override() -> io::Result<()> {
    if let Some(crate::overrides::Injected::Fail(errno)) = crate::overrides::open_override() {
        return Err(io::Error::from_raw_os_error(errno));
    }
    Ok(())
}

pub(crate) type RawDescriptor = RawFd;

fn cstr(path: &Path) -> io::Result<CString> {
    path.to_c_string().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn retry_eintr<F: FnMut() -> libc::c_int>(mut f: F) -> io::Result<()> {
    loop {
        if f() == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Creates a new file exclusively (`O_CREAT | O_EXCL`), failing if it
/// already exists. Used for the temp file in both write engines so a
/// colliding random suffix is detected rather than silently overwritten.
pub(crate) fn create_exclusive(path: &Path, mode: u32) -> io::Result<RawFd> {
    #[cfg(feature = "test-overrides")]
    check_open_override()?;
    let c = cstr(path)?;
    let fd = unsafe {
        libc::open(c.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, mode as libc::c_uint)
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Opens an existing file for writing, optionally truncating or appending.
pub(crate) fn open_direct(path: &Path, truncate: bool, append: bool, create: bool) -> io::Result<RawFd> {
    #[cfg(feature = "test-overrides")]
    check_open_override()?;
    let c = cstr(path)?;
    let mut flags = libc::O_WRONLY;
    if create {
        flags |= libc::O_CREAT;
    }
    if truncate {
        flags |= libc::O_TRUNC;
    }
    if append {
        flags |= libc::O_APPEND;
    }
    let fd = unsafe { libc::open(c.as_ptr(), flags, 0o666) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Opens `path` read-only, used to read back extended attributes from a
/// file about to be replaced.
pub(crate) fn open_read_only(path: &Path) -> io::Result<RawFd> {
    #[cfg(feature = "test-overrides")]
    check_open_override()?;
    let c = cstr(path)?;
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Writes the entirety of `buf` to `fd`, retrying on `EINTR`/`EAGAIN` and
/// resuming at the correct offset after a short write.
pub(crate) fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut offset = 0usize;
    while offset < buf.len() {
        #[cfg(feature = "test-overrides")]
        if let Some(injected) = crate::overrides::write_override() {
            match injected {
                crate::overrides::Injected::Fail(errno) => {
                    return Err(io::Error::from_raw_os_error(errno));
                }
                crate::overrides::Injected::ShortWrite(n) => {
                    let n = n.min(buf.len() - offset);
                    offset += n;
                    continue;
                }
            }
        }
        let n = unsafe {
            libc::write(
                fd,
                buf[offset..].as_ptr() as *const libc::c_void,
                buf.len() - offset,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0 bytes"));
        }
        offset += n as usize;
    }
    Ok(())
}

/// Writes at a specific offset without disturbing the file's shared cursor,
/// used by the positional-I/O API.
pub(crate) fn pwrite_all(fd: RawFd, buf: &[u8], mut offset: u64) -> io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let n = unsafe {
            libc::pwrite(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                offset as libc::off_t,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite returned 0 bytes"));
        }
        written += n as usize;
        offset += n as u64;
    }
    Ok(())
}

pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as libc::off_t)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

/// Syncs file data (and, on `Full`, metadata) per `durability`.
#[cfg(target_os = "macos")]
pub(crate) fn sync_file(fd: RawFd, durability: Durability) -> io::Result<()> {
    match durability {
        Durability::None => Ok(()),
        Durability::DataOnly | Durability::Full => {
            if crate::sys::feature_cache().full_fsync_supported() {
                let rc = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
                if rc == 0 {
                    return Ok(());
                }
                tracing::debug!(errno = io::Error::last_os_error().raw_os_error(), "F_FULLFSYNC failed, falling back to fsync");
            }
            retry_eintr(|| unsafe { libc::fsync(fd) })
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
pub(crate) fn sync_file(fd: RawFd, durability: Durability) -> io::Result<()> {
    #[cfg(feature = "test-overrides")]
    match durability {
        Durability::DataOnly => {
            if let Some(crate::overrides::Injected::Fail(errno)) = crate::overrides::fdatasync_override() {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        Durability::Full => {
            if let Some(crate::overrides::Injected::Fail(errno)) = crate::overrides::fsync_override() {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        Durability::None => {}
    }
    match durability {
        Durability::None => Ok(()),
        Durability::DataOnly => retry_eintr(|| unsafe { libc::fdatasync(fd) }),
        Durability::Full => retry_eintr(|| unsafe { libc::fsync(fd) }),
    }
}

/// Closes `fd` without retrying on `EINTR`: per POSIX, a second `close`
/// after an interrupted one may close an unrelated fd reused by another
/// thread in between.
pub(crate) fn close_once(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub(crate) fn probe_renameat2_no_replace() -> bool {
    use std::io::Write;
    let dir = std::env::temp_dir();
    let probe_dir = dir.join(format!(".durable-fs-probe-{}", std::process::id()));
    if std::fs::create_dir_all(&probe_dir).is_err() {
        return false;
    }
    let src = probe_dir.join("a");
    let dst = probe_dir.join("b");
    let _ = std::fs::File::create(&src).and_then(|mut f| f.write_all(b"x"));
    let src_c = CString::new(src.to_string_lossy().as_bytes()).unwrap();
    let dst_c = CString::new(dst.to_string_lossy().as_bytes()).unwrap();
    let rc = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            src_c.as_ptr(),
            libc::AT_FDCWD,
            dst_c.as_ptr(),
            1u32, // RENAME_NOREPLACE
        )
    };
    let supported = rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINVAL);
    let _ = std::fs::remove_dir_all(&probe_dir);
    tracing::debug!(supported, "probed renameat2(RENAME_NOREPLACE) support");
    supported
}

#[cfg(target_os = "linux")]
fn try_renameat2_no_replace(temp_c: &CString, dest_c: &CString) -> io::Result<()> {
    #[cfg(feature = "test-overrides")]
    if let Some(crate::overrides::Injected::Fail(errno)) = crate::overrides::renameat2_override() {
        return Err(io::Error::from_raw_os_error(errno));
    }
    let rc = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            temp_c.as_ptr(),
            libc::AT_FDCWD,
            dest_c.as_ptr(),
            1u32,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn try_rename(temp_c: &CString, dest_c: &CString) -> io::Result<()> {
    #[cfg(feature = "test-overrides")]
    if let Some(crate::overrides::Injected::Fail(errno)) = crate::overrides::rename_override() {
        return Err(io::Error::from_raw_os_error(errno));
    }
    let rc = unsafe { libc::rename(temp_c.as_ptr(), dest_c.as_ptr()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Atomically publishes `temp` as `dest`.
///
/// When `no_clobber` is requested and the kernel supports an atomic
/// no-replace rename (`renameat2(RENAME_NOREPLACE)` on Linux,
/// `renamex_np(RENAME_EXCL)` on Darwin), uses it directly. Otherwise falls
/// back to `link` then `unlink`, which is atomic with respect to
/// concurrent readers but leaves a window where `temp` and `dest` are both
/// linked to the same inode.
///
/// On Linux, `renameat2` reporting `ENOSYS`/`EINVAL` (flag unsupported by
/// the kernel or filesystem) or `EPERM` (flag refused outright, seen on a
/// handful of network filesystems) also falls back to `link`+`unlink`. If
/// the fallback was triggered by `EPERM` and then also fails, the original
/// `EPERM` is surfaced instead of the fallback's own error, since it carries
/// more useful context about why the atomic path was unavailable.
pub(crate) fn publish(temp: &Path, dest: &Path, no_clobber: bool) -> io::Result<()> {
    let temp_c = cstr(temp)?;
    let dest_c = cstr(dest)?;

    if !no_clobber {
        return try_rename(&temp_c, &dest_c);
    }

    let mut preserved_error: Option<io::Error> = None;

    #[cfg(target_os = "linux")]
    {
        if crate::sys::feature_cache().renameat2_no_replace_supported() {
            match try_renameat2_no_replace(&temp_c, &dest_c) {
                Ok(()) => return Ok(()),
                Err(err) => match err.raw_os_error() {
                    Some(libc::ENOSYS) | Some(libc::EINVAL) => {
                        tracing::debug!(
                            errno = err.raw_os_error(),
                            "renameat2(RENAME_NOREPLACE) unsupported, falling back to link+unlink"
                        );
                    }
                    Some(libc::EPERM) => {
                        tracing::debug!(
                            "renameat2(RENAME_NOREPLACE) refused with EPERM, falling back to link+unlink"
                        );
                        preserved_error = Some(err);
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        // RENAME_EXCL = 0x4, matches <sys/fcntl.h> renamex_np flags.
        extern "C" {
            fn renamex_np(
                from: *const libc::c_char,
                to: *const libc::c_char,
                flags: libc::c_uint,
            ) -> libc::c_int;
        }
        let rc = unsafe { renamex_np(temp_c.as_ptr(), dest_c.as_ptr(), 0x4) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOTSUP) {
            return Err(err);
        }
        tracing::debug!("renamex_np(RENAME_EXCL) unsupported, falling back to link+unlink");
    }

    let rc = unsafe { libc::link(temp_c.as_ptr(), dest_c.as_ptr()) };
    if rc != 0 {
        return Err(preserved_error.unwrap_or_else(io::Error::last_os_error));
    }
    let unlink_rc = unsafe { libc::unlink(temp_c.as_ptr()) };
    if unlink_rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Opens `dir` and `fsync`s it, flushing the directory-entry change made by
/// [`publish`] to stable storage.
pub(crate) fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(feature = "test-overrides")]
    check_open_override()?;
    let c = cstr(dir)?;
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = retry_eintr(|| unsafe { libc::fsync(fd) });
    let _ = unsafe { libc::close(fd) };
    result
}

pub(crate) fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    let c = cstr(path)?;
    let rc = unsafe { libc::chmod(c.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c = cstr(path)?;
    let rc = unsafe { libc::chown(c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_times(path: &Path, accessed: std::time::SystemTime, modified: std::time::SystemTime) -> io::Result<()> {
    let c = cstr(path)?;
    let to_timespec = |t: std::time::SystemTime| -> libc::timespec {
        match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => libc::timespec { tv_sec: d.as_secs() as libc::time_t, tv_nsec: d.subsec_nanos() as libc::c_long },
            Err(e) => {
                let d = e.duration();
                libc::timespec { tv_sec: -(d.as_secs() as libc::time_t), tv_nsec: 0 }
            }
        }
    };
    let times = [to_timespec(accessed), to_timespec(modified)];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wraps a raw fd so it closes on drop during best-effort cleanup paths
/// (e.g. an error partway through the atomic pipeline).
pub(crate) struct OwnedFd(RawFd);

impl OwnedFd {
    pub(crate) fn new(fd: RawFd) -> Self {
        OwnedFd(fd)
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.0
    }

    pub(crate) fn into_raw(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

impl FromRawFd for OwnedFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        OwnedFd(fd)
    }
}

#[cfg(target_os = "macos")]
pub(crate) fn preallocate(fd: RawFd, len: u64) -> io::Result<()> {
    let mut store = libc::fstore_t {
        fst_flags: libc::F_ALLOCATECONTIG,
        fst_posmode: libc::F_PEOFPOSMODE,
        fst_offset: 0,
        fst_length: len as libc::off_t,
        fst_bytesalloc: 0,
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store) };
    if rc == -1 {
        store.fst_flags = libc::F_ALLOCATEALL;
        let rc2 = unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store) };
        if rc2 == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
pub(crate) fn preallocate(_fd: RawFd, _len: u64) -> io::Result<()> {
    Ok(())
}

/// Lists extended attribute names on an open fd, ignoring `ENOTSUP`/`ERANGE`
/// from filesystems that don't support them by returning an empty list.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) fn flist_xattrs(fd: RawFd) -> io::Result<Vec<CString>> {
    let size = unsafe { flistxattr_raw(fd, std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOTSUP) | Some(libc::EOPNOTSUPP) => Ok(Vec::new()),
            _ => Err(err),
        };
    }
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; size as usize];
    let written = unsafe { flistxattr_raw(fd, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(written as usize);
    Ok(buf
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| CString::new(chunk).unwrap())
        .collect())
}

#[cfg(target_os = "linux")]
unsafe fn flistxattr_raw(fd: RawFd, buf: *mut libc::c_char, size: usize) -> libc::ssize_t {
    libc::flistxattr(fd, buf, size)
}

#[cfg(target_os = "macos")]
unsafe fn flistxattr_raw(fd: RawFd, buf: *mut libc::c_char, size: usize) -> libc::ssize_t {
    libc::flistxattr(fd, buf, size, 0)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) fn fget_xattr(fd: RawFd, name: &CString) -> io::Result<Vec<u8>> {
    let size = unsafe { fgetxattr_raw(fd, name.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut buf = vec![0u8; size as usize];
    if size > 0 {
        let got = unsafe { fgetxattr_raw(fd, name.as_ptr(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if got < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(got as usize);
    }
    Ok(buf)
}

#[cfg(target_os = "linux")]
unsafe fn fgetxattr_raw(fd: RawFd, name: *const libc::c_char, buf: *mut libc::c_void, size: usize) -> libc::ssize_t {
    libc::fgetxattr(fd, name, buf, size)
}

#[cfg(target_os = "macos")]
unsafe fn fgetxattr_raw(fd: RawFd, name: *const libc::c_char, buf: *mut libc::c_void, size: usize) -> libc::ssize_t {
    libc::fgetxattr(fd, name, buf, size, 0, 0)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) fn fset_xattr(fd: RawFd, name: &CString, value: &[u8]) -> io::Result<()> {
    let rc = unsafe { fsetxattr_raw(fd, name.as_ptr(), value.as_ptr() as *const libc::c_void, value.len()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOTSUP) | Some(libc::EOPNOTSUPP) => Ok(()),
            _ => Err(err),
        };
    }
    Ok(())
}

#[cfg(target_os = "linux")]
unsafe fn fsetxattr_raw(fd: RawFd, name: *const libc::c_char, value: *const libc::c_void, size: usize) -> libc::c_int {
    libc::fsetxattr(fd, name, value, size, 0)
}

#[cfg(target_os = "macos")]
unsafe fn fsetxattr_raw(fd: RawFd, name: *const libc::c_char, value: *const libc::c_void, size: usize) -> libc::c_int {
    libc::fsetxattr(fd, name, value, size, 0, 0)
}
