#![allow(unsafe_code)]

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::types::{Result, SombraError};
use parking_lot::Mutex;

const OWNER_SLOT_START: u64 = 0;
const OWNER_SLOT_LEN: u64 = 1;

// OS record locks are per process, so a second owner inside the same process
// has to be rejected here.
fn held_locks() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive ownership of a store directory, released on drop.
///
/// Normal open and migration both take this lock, so a store being upgraded can
/// never be opened by another process or by another database context in this one.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Attempts to take the lock file at `path` without blocking.
    ///
    /// Returns [`SombraError::Locked`] when another owner holds it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // Closing any descriptor of a file drops this process's fcntl lock on it,
        // so a contended path must be turned away before it is opened.
        let key = lock_key(path)?;
        if !held_locks().lock().insert(key.clone()) {
            return Err(SombraError::Locked(path.to_path_buf()));
        }
        match open_and_lock(&key) {
            Ok(Some(file)) => Ok(Self { file, path: key }),
            Ok(None) => {
                held_locks().lock().remove(&key);
                Err(SombraError::Locked(path.to_path_buf()))
            }
            Err(err) => {
                held_locks().lock().remove(&key);
                Err(err)
            }
        }
    }

    /// Canonical path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock_region(&self.file, OWNER_SLOT_START, OWNER_SLOT_LEN) {
            #[cfg(debug_assertions)]
            eprintln!("failed to unlock {}: {:?}", self.path.display(), _err);
        }
        held_locks().lock().remove(&self.path);
    }
}

/// Canonical parent directory joined with the file name; the file itself may not exist yet.
fn lock_key(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or(SombraError::Invalid("lock path has no file name"))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.canonicalize()?,
        _ => std::env::current_dir()?,
    };
    Ok(parent.join(name))
}

fn open_and_lock(path: &Path) -> Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() < OWNER_SLOT_LEN {
        file.set_len(OWNER_SLOT_LEN)?;
    }
    if lock_region(&file, OWNER_SLOT_START, OWNER_SLOT_LEN)? {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}

fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Err(io::Error::new(
            io::ErrorKind::Other,
            "file locking unsupported on this platform",
        ))
    }
}

fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::fs::File;
    use std::io;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Offset = start as u32;
            overlapped.OffsetHigh = (start >> 32) as u32;
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(
                handle as isize,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Offset = start as u32;
            overlapped.OffsetHigh = (start >> 32) as u32;
            let res = UnlockFileEx(
                handle as isize,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
