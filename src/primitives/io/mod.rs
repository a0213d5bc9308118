#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use crate::types::{Result, SombraError};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    /// Opens an existing file without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }

    /// Creates (or truncates) a file for writing a fresh image.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = positioned::read_some(self.file(), dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = positioned::write_some(self.file(), src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(SombraError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(SombraError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(SombraError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(SombraError::from)
    }
}

/// Flushes directory metadata so that renames and unlinks inside `dir` are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Returns true if `err` is an unexpected-EOF I/O error.
pub fn is_eof(err: &SombraError) -> bool {
    matches!(err, SombraError::Io(inner) if inner.kind() == ErrorKind::UnexpectedEof)
}

/// Removes a directory tree, treating "already gone" as success.
pub fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Removes a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
