//! Windows syscall wrappers: file creation/IO, `FlushFileBuffers`-based
//! durability, and `MoveFileExW`-based atomic publish.

use std::io;
use std::os::windows::ffi::OsStrExt;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, MoveFileExW, ReadFile, SetFilePointerEx, WriteFile,
    FILE_ATTRIBUTE_NORMAL, FILE_BEGIN, FILE_SHARE_READ, FILE_SHARE_WRITE, MOVEFILE_REPLACE_EXISTING,
    MOVEFILE_WRITE_THROUGH, OPEN_ALWAYS, CREATE_NEW, OPEN_EXISTING, TRUNCATE_EXISTING, GENERIC_WRITE, GENERIC_READ,
};

use crate::path::Path;
use crate::sys::Durability;

pub(crate) type RawDescriptor = HANDLE;

fn wide(path: &Path) -> Vec<u16> {
    path.as_std_path().as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

fn last_err() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

pub(crate) fn create_exclusive(path: &Path, _mode: u32) -> io::Result<RawDescriptor> {
    let w = wide(path);
    let handle = unsafe {
        CreateFileW(
            w.as_ptr(),
            GENERIC_WRITE,
            0,
            std::ptr::null(),
            CREATE_NEW,
            FILE_ATTRIBUTE_NORMAL,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(last_err());
    }
    Ok(handle)
}

pub(crate) fn open_direct(path: &Path, truncate: bool, append: bool, create: bool) -> io::Result<RawDescriptor> {
    let w = wide(path);
    let disposition = if create && truncate {
        OPEN_ALWAYS
    } else if truncate {
        TRUNCATE_EXISTING
    } else if create {
        OPEN_ALWAYS
    } else {
        OPEN_EXISTING
    };
    let handle = unsafe {
        CreateFileW(
            w.as_ptr(),
            GENERIC_WRITE | GENERIC_READ,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            disposition,
            FILE_ATTRIBUTE_NORMAL,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(last_err());
    }
    if append {
        let mut new_pos = 0i64;
        let ok = unsafe { SetFilePointerEx(handle, 0, &mut new_pos, 2 /* FILE_END */) };
        if ok == 0 {
            let err = last_err();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }
    }
    Ok(handle)
}

pub(crate) fn write_all(handle: RawDescriptor, buf: &[u8]) -> io::Result<()> {
    let mut offset = 0usize;
    while offset < buf.len() {
        let mut written = 0u32;
        let ok = unsafe {
            WriteFile(
                handle,
                buf[offset..].as_ptr(),
                (buf.len() - offset) as u32,
                &mut written,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_err());
        }
        offset += written as usize;
    }
    Ok(())
}

pub(crate) fn pwrite_all(handle: RawDescriptor, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut pos = offset as i64;
    let ok = unsafe { SetFilePointerEx(handle, pos, std::ptr::null_mut(), FILE_BEGIN) };
    if ok == 0 {
        return Err(last_err());
    }
    let mut written_total = 0usize;
    while written_total < buf.len() {
        let mut written = 0u32;
        let ok = unsafe {
            WriteFile(
                handle,
                buf[written_total..].as_ptr(),
                (buf.len() - written_total) as u32,
                &mut written,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_err());
        }
        written_total += written as usize;
        pos += written as i64;
    }
    Ok(())
}

pub(crate) fn pread(handle: RawDescriptor, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let pos = offset as i64;
    let ok = unsafe { SetFilePointerEx(handle, pos, std::ptr::null_mut(), FILE_BEGIN) };
    if ok == 0 {
        return Err(last_err());
    }
    let mut read = 0u32;
    let ok = unsafe { ReadFile(handle, buf.as_mut_ptr(), buf.len() as u32, &mut read, std::ptr::null_mut()) };
    if ok == 0 {
        return Err(last_err());
    }
    Ok(read as usize)
}

pub(crate) fn sync_file(handle: RawDescriptor, durability: Durability) -> io::Result<()> {
    match durability {
        Durability::None => Ok(()),
        Durability::DataOnly | Durability::Full => {
            let ok = unsafe { FlushFileBuffers(handle) };
            if ok == 0 {
                return Err(last_err());
            }
            Ok(())
        }
    }
}

pub(crate) fn close_once(handle: RawDescriptor) -> io::Result<()> {
    let ok = unsafe { CloseHandle(handle) };
    if ok == 0 {
        return Err(last_err());
    }
    Ok(())
}

/// Publishes `temp` as `dest` via `MoveFileExW`. Windows has no atomic
/// no-replace rename primitive analogous to `renameat2`/`renamex_np`; when
/// `no_clobber` is requested this checks existence first, which leaves a
/// narrow TOCTOU window versus the POSIX implementations.
pub(crate) fn publish(temp: &Path, dest: &Path, no_clobber: bool) -> io::Result<()> {
    if no_clobber && dest.as_std_path().exists() {
        return Err(io::Error::from(io::ErrorKind::AlreadyExists));
    }
    let temp_w = wide(temp);
    let dest_w = wide(dest);
    let flags = MOVEFILE_REPLACE_EXISTING | MOVEFILE_WRITE_THROUGH;
    let flags = if no_clobber { MOVEFILE_WRITE_THROUGH } else { flags };
    let ok = unsafe { MoveFileExW(temp_w.as_ptr(), dest_w.as_ptr(), flags) };
    if ok == 0 {
        return Err(last_err());
    }
    Ok(())
}

/// No-op: NTFS has no directory-entry durability primitive equivalent to
/// `fsync` on a directory fd. `MOVEFILE_WRITE_THROUGH` on [`publish`] is the
/// closest available durability guarantee for the rename itself.
pub(crate) fn sync_directory(_dir: &Path) -> io::Result<()> {
    Ok(())
}

pub(crate) fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use windows_sys::Win32::Storage::FileSystem::{SetFileAttributesW, FILE_ATTRIBUTE_READONLY};
    let w = wide(path);
    let attrs = if mode & 0o200 == 0 { FILE_ATTRIBUTE_READONLY } else { FILE_ATTRIBUTE_NORMAL };
    let ok = unsafe { SetFileAttributesW(w.as_ptr(), attrs) };
    if ok == 0 {
        return Err(last_err());
    }
    Ok(())
}

/// There is no Windows analogue of POSIX ownership transfer via a single
/// syscall; ownership lives in the security descriptor's owner SID. Ignored
/// rather than faked, matching how streaming/atomic preservation downgrades
/// unsupported metadata on this platform.
pub(crate) fn chown(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Ok(())
}

pub(crate) fn set_times(path: &Path, accessed: std::time::SystemTime, modified: std::time::SystemTime) -> io::Result<()> {
    use windows_sys::Win32::Foundation::FILETIME;
    use windows_sys::Win32::Storage::FileSystem::SetFileTime;

    fn to_filetime(t: std::time::SystemTime) -> FILETIME {
        const EPOCH_DIFF_100NS: u64 = 116_444_736_000_000_000;
        let duration = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
        let ticks = EPOCH_DIFF_100NS + duration.as_secs() * 10_000_000 + (duration.subsec_nanos() as u64) / 100;
        FILETIME {
            dwLowDateTime: (ticks & 0xFFFF_FFFF) as u32,
            dwHighDateTime: (ticks >> 32) as u32,
        }
    }

    let w = wide(path);
    let handle = unsafe {
        CreateFileW(
            w.as_ptr(),
            windows_sys::Win32::Storage::FileSystem::FILE_WRITE_ATTRIBUTES,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(last_err());
    }
    let atime = to_filetime(accessed);
    let mtime = to_filetime(modified);
    let ok = unsafe { SetFileTime(handle, std::ptr::null(), &atime, &mtime) };
    let result = if ok == 0 { Err(last_err()) } else { Ok(()) };
    unsafe { CloseHandle(handle) };
    result
}

pub(crate) struct OwnedFd(RawDescriptor);

impl OwnedFd {
    pub(crate) fn new(handle: RawDescriptor) -> Self {
        OwnedFd(handle)
    }

    pub(crate) fn raw(&self) -> RawDescriptor {
        self.0
    }

    pub(crate) fn into_raw(self) -> RawDescriptor {
        let handle = self.0;
        std::mem::forget(self);
        handle
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub(crate) fn preallocate(_handle: RawDescriptor, _len: u64) -> io::Result<()> {
    Ok(())
}
