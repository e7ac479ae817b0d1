#![forbid(unsafe_code)]
//! Byte-addressed device access.
//!
//! Provides the read-only `ByteDevice` trait, a file-backed implementation
//! using `pread` semantics, an in-memory device for tests and harnesses,
//! and the superblock region read.

use cw_error::{CwError, Result};
use cw_types::{BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset reads (pread semantics).
///
/// The lookup paths never write; the trait is read-only by construction.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len).map_err(|_| CwError::Format("read length overflows u64".into()))?,
        )
        .ok_or_else(|| CwError::Format("read range overflows u64".into()))?;
    if end > device_len {
        return Err(CwError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not touch the
/// shared seek position. The file is opened read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device for tests and synthetic-image harnesses.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Vec<u8>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| CwError::Format("offset overflows usize".into()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read the 4 KiB superblock region at the 64 KiB superblock copy.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    let offset = u64::try_from(BTRFS_SUPER_INFO_OFFSET)
        .map_err(|_| CwError::Format("superblock offset overflows u64".into()))?;
    let mut region = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
    dev.read_exact_at(offset, &mut region)?;
    Ok(region)
}
