//! Narrow positioned-I/O abstraction the block cache sits on top of.
//!
//! The engine talks to three raw devices (metadata, snapshot/exception
//! store, origin) purely through positioned reads and writes — there is no
//! notion of a cursor to keep straight between interleaved requests. We use
//! `libc::pread`/`pwrite` directly rather than `Seek`+`Read`/`Write` so that
//! concurrent handlers (even though the dispatcher itself is single
//! threaded, tests and tools exercise devices independently) never race on a
//! shared file cursor.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::errors::*;

/// A raw block device: metadata store, snapshot/exception store, or origin.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// A `BlockDevice` backed by a regular file or block special file.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(FileDevice { file })
    }

    pub fn create_sized(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(FileDevice { file })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if (n as usize) < buf.len() {
            return Err(ErrorKind::Corrupt(format!(
                "short read at offset {}: got {} of {} bytes",
                offset,
                n,
                buf.len()
            ))
            .into());
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let n = unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if (n as usize) < buf.len() {
            return Err(ErrorKind::Corrupt(format!(
                "short write at offset {}: wrote {} of {} bytes",
                offset,
                n,
                buf.len()
            ))
            .into());
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// An in-memory `BlockDevice`, used by tests and by `recovery` scenarios
/// that want to simulate a torn write without touching the filesystem.
pub struct MemDevice {
    data: parking_lot::Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new(len: usize) -> Self {
        MemDevice {
            data: parking_lot::Mutex::new(vec![0u8; len]),
        }
    }

    /// Deliberately corrupts `len` bytes at `offset`, to simulate a torn
    /// write for journal recovery tests.
    pub fn scribble(&self, offset: u64, len: usize) {
        let mut data = self.data.lock();
        let start = offset as usize;
        for b in &mut data[start..start + len] {
            *b = 0;
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(ErrorKind::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            ))
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(ErrorKind::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of device",
            ))
            .into());
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
