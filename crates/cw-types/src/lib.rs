#![forbid(unsafe_code)]
//! Shared key types, on-disk constants, and byte-parsing primitives.
//!
//! Everything in this crate is format-level: tree keys, well-known object
//! ids, item type discriminants, and the little-endian read helpers the
//! parsing layer is built on. No I/O happens here.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub const BTRFS_SUPER_INFO_OFFSET: usize = 64 * 1024;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Well-known tree object ids (root tree keyspace).
pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const CSUM_TREE_OBJECTID: u64 = 7;

/// Object id carried by every checksum-tree item (-10 as u64).
pub const EXTENT_CSUM_OBJECTID: u64 = 0xFFFF_FFFF_FFFF_FFF6;

/// Item type discriminants used by the lookup paths.
pub const EXTENT_DATA_KEY: u8 = 108;
pub const EXTENT_CSUM_KEY: u8 = 128;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const CHUNK_ITEM_KEY: u8 = 228;

/// File extent item kinds (the `type` byte of a file extent item).
pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

/// Checksum algorithm ids (superblock `csum_type` field).
pub const CSUM_TYPE_CRC32C: u16 = 0;
pub const CSUM_TYPE_XXHASH64: u16 = 1;
pub const CSUM_TYPE_SHA256: u16 = 2;
pub const CSUM_TYPE_BLAKE2B: u16 = 3;

/// Stored checksum size in bytes for a superblock `csum_type`, or `None`
/// for an algorithm this build does not know about.
#[must_use]
pub fn csum_size_for_type(csum_type: u16) -> Option<u16> {
    match csum_type {
        CSUM_TYPE_CRC32C => Some(4),
        CSUM_TYPE_XXHASH64 => Some(8),
        CSUM_TYPE_SHA256 | CSUM_TYPE_BLAKE2B => Some(32),
        _ => None,
    }
}

/// Tree key: `(objectid, item_type, offset)`.
///
/// Total order is lexicographic on the triple, matching on-disk item
/// ordering. The derived `Ord` relies on field declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Compare against another key without constructing it.
    #[must_use]
    pub fn cmp_parts(&self, objectid: u64, item_type: u8, offset: u64) -> Ordering {
        self.cmp(&Self::new(objectid, item_type, offset))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} {} {})",
            self.objectid as i64, self.item_type, self.offset
        )
    }
}

/// Inode number on the fs tree (objectid of inode-scoped items).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction id, carried as an opaque pass-through by read paths that
/// may run inside a writer context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_is_lexicographic_on_triple() {
        let a = Key::new(1, 0, u64::MAX);
        let b = Key::new(1, 1, 0);
        let c = Key::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);

        // offset is the least significant component
        assert!(Key::new(5, 108, 0) < Key::new(5, 108, 4096));
        assert!(Key::new(5, 108, u64::MAX) < Key::new(5, 128, 0));
    }

    #[test]
    fn csum_objectid_sorts_last() {
        // -10 as u64 must compare above every real objectid, so csum
        // items sit at the end of the keyspace.
        assert!(Key::new(FS_TREE_OBJECTID, 255, u64::MAX) < Key::new(EXTENT_CSUM_OBJECTID, 0, 0));
    }

    #[test]
    fn csum_sizes_match_algorithms() {
        assert_eq!(csum_size_for_type(CSUM_TYPE_CRC32C), Some(4));
        assert_eq!(csum_size_for_type(CSUM_TYPE_XXHASH64), Some(8));
        assert_eq!(csum_size_for_type(CSUM_TYPE_SHA256), Some(32));
        assert_eq!(csum_size_for_type(CSUM_TYPE_BLAKE2B), Some(32));
        assert_eq!(csum_size_for_type(4), None);
    }

    #[test]
    fn read_helpers_enforce_bounds() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0x0201);
        assert_eq!(read_le_u32(&data, 0).unwrap(), 0x0403_0201);
        assert!(matches!(
            read_le_u32(&data, 1),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 3,
            })
        ));
        assert!(read_le_u64(&data, 0).is_err());
        assert!(matches!(
            ensure_slice(&data, usize::MAX, 2),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn read_fixed_copies_exact_window() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD];
        assert_eq!(read_fixed::<2>(&data, 1).unwrap(), [0xBB, 0xCC]);
        assert!(read_fixed::<8>(&data, 0).is_err());
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"label\0\0\0"), "label");
        assert_eq!(trim_nul_padded(b"\0junk"), "");
        assert_eq!(trim_nul_padded(b"full"), "full");
    }
}
