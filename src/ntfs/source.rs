//! Byte sources
//!
//! Positioned access to the raw volume: an in-memory image, a file (or raw
//! device) behind a mutex, or a read-only memory map.

use crate::error::{MftError, Result};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Random-access storage underneath a volume
pub trait ByteSource: Send + Sync {
    /// Fill `buf` from `pos`; a short read is an error
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

fn out_of_range(pos: u64, len: usize, size: u64) -> MftError {
    MftError::IoError(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "access of {} bytes at {:#x} is past end of {}-byte source",
            len, pos, size
        ),
    ))
}

fn check_range(pos: u64, len: usize, size: u64) -> Result<usize> {
    match pos.checked_add(len as u64) {
        Some(end) if end <= size => Ok(pos as usize),
        _ => Err(out_of_range(pos, len, size)),
    }
}

// ============================================================================
// MemorySource
// ============================================================================

/// A volume image held in memory
pub struct MemorySource {
    data: RwLock<Vec<u8>>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl ByteSource for MemorySource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = check_range(pos, buf.len(), data.len() as u64)?;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, pos: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = check_range(pos, src.len(), data.len() as u64)?;
        data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }
}

// ============================================================================
// FileSource
// ============================================================================

/// An image file or raw device. Seek and read share one handle, so access is
/// serialized.
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
    writable: bool,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
            writable,
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        check_range(pos, buf.len(), self.len)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(MftError::IoError(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "source was opened read-only",
            )));
        }
        check_range(pos, data.len(), self.len)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }
}

// ============================================================================
// MmapSource
// ============================================================================

/// A read-only memory-mapped image
pub struct MmapSource {
    map: Mmap,
}

impl MmapSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only; the image must not be truncated
        // while it is mapped.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }
}

impl ByteSource for MmapSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let start = check_range(pos, buf.len(), self.map.len() as u64)?;
        buf.copy_from_slice(&self.map[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, _pos: u64, _data: &[u8]) -> Result<()> {
        Err(MftError::IoError(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "memory-mapped source is read-only",
        )))
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn is_read_only(&self) -> bool {
        true
    }
}
