#![forbid(unsafe_code)]
//! On-disk structure parsing: superblock, tree node headers, leaf and
//! internal node items, chunk entries, root items, and file extent items.
//!
//! Pure byte-level decoding — no I/O. Every parser bounds-checks before
//! reading and returns `ParseError` on malformed input.

use cw_types::{
    BTRFS_MAGIC, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, FILE_EXTENT_INLINE,
    FILE_EXTENT_PREALLOC, FILE_EXTENT_REG, Key, ParseError, read_fixed, read_le_u16, read_le_u32,
    read_le_u64, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Node header size on disk.
pub const NODE_HEADER_SIZE: usize = 101;
/// Size of a leaf item descriptor (key:17 + data_offset:u32 + data_size:u32).
pub const LEAF_ITEM_SIZE: usize = 25;
/// Size of an internal key-pointer (key:17 + blockptr:u64 + generation:u64).
pub const KEY_PTR_SIZE: usize = 33;
/// Size of a disk key (objectid:u64 + type:u8 + offset:u64).
pub const DISK_KEY_SIZE: usize = 17;
/// Maximum tree depth (kernel enforces levels 0-7).
pub const MAX_LEVEL: u8 = 7;

const SUPER_LABEL_OFFSET: usize = 0x12B;
const SUPER_LABEL_LEN: usize = 256;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Fixed chunk header fields before the stripe array.
const CHUNK_FIXED_SIZE: usize = 48;
/// One stripe on disk (devid:u64 + offset:u64 + dev_uuid:16).
const STRIPE_SIZE: usize = 32;

/// Fixed (non-inline) portion of a file extent item.
const FILE_EXTENT_FIXED_SIZE: usize = 53;
/// Inline file extent items carry data instead of the disk fields.
const FILE_EXTENT_INLINE_HEADER: usize = 21;

/// Root item `bytenr` field offset (after the 160-byte embedded inode item).
const ROOT_ITEM_GENERATION_OFFSET: usize = 160;
const ROOT_ITEM_BYTENR_OFFSET: usize = 176;
const ROOT_ITEM_LEVEL_OFFSET: usize = 238;
const ROOT_ITEM_MIN_SIZE: usize = 239;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub magic: u64,
    pub generation: u64,
    /// Root tree root bytenr.
    pub root: u64,
    /// Chunk tree root bytenr.
    pub chunk_root: u64,
    pub total_bytes: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub label: String,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse the 4 KiB superblock region (already sliced from the image).
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be a non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be a non-zero power of two",
            });
        }
        if sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "exceeds 256K upper bound",
            });
        }
        if nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds 256K upper bound",
            });
        }
        if nodesize < sectorsize {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "smaller than sectorsize",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end =
            SYS_CHUNK_ARRAY_OFFSET
                .checked_add(sys_array_len)
                .ok_or(ParseError::InvalidField {
                    field: "sys_chunk_array",
                    reason: "offset overflow",
                })?;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            total_bytes: read_le_u64(region, 0x70)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            label: trim_nul_padded(&read_fixed::<SUPER_LABEL_LEN>(region, SUPER_LABEL_OFFSET)?),
            sys_chunk_array: region[SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec(),
        })
    }

    /// Parse from a whole image byte slice (superblock copy at 64 KiB).
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let end = BTRFS_SUPER_INFO_OFFSET
            .checked_add(BTRFS_SUPER_INFO_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "superblock_offset",
                reason: "overflow",
            })?;

        if image.len() < end {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: BTRFS_SUPER_INFO_OFFSET,
                actual: image.len().saturating_sub(BTRFS_SUPER_INFO_OFFSET),
            });
        }

        Self::parse_superblock_region(&image[BTRFS_SUPER_INFO_OFFSET..end])
    }
}

// ── Tree nodes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < NODE_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: NODE_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Validate against the block the header was parsed from: `bytenr`
    /// matches (when known), level within bounds, nritems fits capacity.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr {
            if self.bytenr != expected {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "header bytenr does not match expected",
                });
            }
        }

        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(NODE_HEADER_SIZE);
        let item_size = if self.level == 0 {
            LEAF_ITEM_SIZE
        } else {
            KEY_PTR_SIZE
        };
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
        if nritems > payload_space / item_size {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }
}

fn parse_disk_key(data: &[u8], offset: usize) -> Result<Key, ParseError> {
    Ok(Key {
        objectid: read_le_u64(data, offset)?,
        item_type: *data
            .get(offset + 8)
            .ok_or(ParseError::InsufficientData {
                needed: DISK_KEY_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            })?,
        offset: read_le_u64(data, offset + 9)?,
    })
}

/// A leaf item with its payload bytes already extracted and bounds-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    pub key: Key,
    pub payload: Vec<u8>,
}

/// An internal node entry: key paired with a child block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// Parse a leaf node, returning the header and items with owned payloads.
pub fn parse_leaf(block: &[u8]) -> Result<(NodeHeader, Vec<LeafItem>), ParseError> {
    let header = NodeHeader::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
    let table_end = NODE_HEADER_SIZE
        .checked_add(nritems.checked_mul(LEAF_ITEM_SIZE).ok_or(
            ParseError::InvalidField {
                field: "nritems",
                reason: "item table overflow",
            },
        )?)
        .ok_or(ParseError::InvalidField {
            field: "nritems",
            reason: "item table overflow",
        })?;
    if block.len() < table_end {
        return Err(ParseError::InsufficientData {
            needed: table_end,
            offset: NODE_HEADER_SIZE,
            actual: block.len().saturating_sub(NODE_HEADER_SIZE),
        });
    }

    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = NODE_HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        let key = parse_disk_key(block, base)?;
        let data_offset = read_le_u32(block, base + 17)?;
        let data_size = read_le_u32(block, base + 21)?;

        // Item payloads are addressed relative to the start of the item
        // area, i.e. right after the header.
        let off = NODE_HEADER_SIZE
            .checked_add(usize::try_from(data_offset).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "data_offset",
                }
            })?)
            .ok_or(ParseError::InvalidField {
                field: "data_offset",
                reason: "overflow",
            })?;
        let sz = usize::try_from(data_size)
            .map_err(|_| ParseError::IntegerConversion { field: "data_size" })?;
        let end = off.checked_add(sz).ok_or(ParseError::InvalidField {
            field: "data_offset",
            reason: "overflow",
        })?;
        if end > block.len() {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item data extends past block",
            });
        }

        items.push(LeafItem {
            key,
            payload: block[off..end].to_vec(),
        });
    }

    Ok((header, items))
}

/// Parse an internal (non-leaf) node, returning the header and key-pointers.
pub fn parse_internal(block: &[u8]) -> Result<(NodeHeader, Vec<KeyPtr>), ParseError> {
    let header = NodeHeader::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal level > 0",
        });
    }

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
    let table_end = NODE_HEADER_SIZE
        .checked_add(
            nritems
                .checked_mul(KEY_PTR_SIZE)
                .ok_or(ParseError::InvalidField {
                    field: "nritems",
                    reason: "key ptr table overflow",
                })?,
        )
        .ok_or(ParseError::InvalidField {
            field: "nritems",
            reason: "key ptr table overflow",
        })?;
    if block.len() < table_end {
        return Err(ParseError::InsufficientData {
            needed: table_end,
            offset: NODE_HEADER_SIZE,
            actual: block.len().saturating_sub(NODE_HEADER_SIZE),
        });
    }

    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = NODE_HEADER_SIZE + idx * KEY_PTR_SIZE;
        ptrs.push(KeyPtr {
            key: parse_disk_key(block, base)?,
            blockptr: read_le_u64(block, base + 17)?,
            generation: read_le_u64(block, base + 25)?,
        });
    }

    Ok((header, ptrs))
}

// ── Chunk entries and address mapping ───────────────────────────────────────

/// A single stripe within a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A chunk: one contiguous logical byte range mapped onto device stripes.
///
/// `key.offset` is the logical start address of the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub key: Key,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

/// Parse one chunk payload (fixed header + stripe array) for `key`.
///
/// Returns the entry and the number of payload bytes consumed, so the
/// sys_chunk_array walker can advance past variable-length entries.
pub fn parse_chunk_payload(key: Key, data: &[u8]) -> Result<(ChunkEntry, usize), ParseError> {
    if data.len() < CHUNK_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: CHUNK_FIXED_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    let length = read_le_u64(data, 0)?;
    let owner = read_le_u64(data, 8)?;
    let stripe_len = read_le_u64(data, 16)?;
    let chunk_type = read_le_u64(data, 24)?;
    let num_stripes = read_le_u16(data, 44)?;
    let sub_stripes = read_le_u16(data, 46)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let stripes_count = usize::from(num_stripes);
    let stripes_bytes =
        stripes_count
            .checked_mul(STRIPE_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "num_stripes",
                reason: "stripe count overflow",
            })?;
    let total = CHUNK_FIXED_SIZE
        .checked_add(stripes_bytes)
        .ok_or(ParseError::InvalidField {
            field: "num_stripes",
            reason: "stripe count overflow",
        })?;
    if data.len() < total {
        return Err(ParseError::InsufficientData {
            needed: total,
            offset: CHUNK_FIXED_SIZE,
            actual: data.len().saturating_sub(CHUNK_FIXED_SIZE),
        });
    }

    let mut stripes = Vec::with_capacity(stripes_count);
    let mut cur = CHUNK_FIXED_SIZE;
    for _ in 0..stripes_count {
        stripes.push(Stripe {
            devid: read_le_u64(data, cur)?,
            offset: read_le_u64(data, cur + 8)?,
            dev_uuid: read_fixed::<16>(data, cur + 16)?,
        });
        cur += STRIPE_SIZE;
    }

    Ok((
        ChunkEntry {
            key,
            length,
            owner,
            stripe_len,
            chunk_type,
            num_stripes,
            sub_stripes,
            stripes,
        },
        total,
    ))
}

/// Parse the superblock's sys_chunk_array: alternating disk key + chunk.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<ChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + DISK_KEY_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: DISK_KEY_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let key = parse_disk_key(data, cur)?;
        cur += DISK_KEY_SIZE;

        let (entry, consumed) = parse_chunk_payload(key, &data[cur..])?;
        cur += consumed;
        entries.push(entry);
    }

    Ok(entries)
}

/// Result of a logical-to-physical bytenr mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Map a logical byte address to a physical (device, offset) pair.
///
/// Uses the first stripe of the covering chunk (single-device assumption;
/// RAID layouts would need stripe arithmetic here).
///
/// Returns `Ok(Some(mapping))` if covered, `Ok(None)` if no chunk covers
/// the address, or `Err` on malformed chunk data.
pub fn map_logical_to_physical(
    chunks: &[ChunkEntry],
    logical: u64,
) -> Result<Option<PhysicalMapping>, ParseError> {
    for chunk in chunks {
        let chunk_start = chunk.key.offset;
        let chunk_end = chunk_start
            .checked_add(chunk.length)
            .ok_or(ParseError::InvalidField {
                field: "chunk_length",
                reason: "logical range overflow",
            })?;

        if logical >= chunk_start && logical < chunk_end {
            let offset_within = logical - chunk_start;
            let stripe = chunk.stripes.first().ok_or(ParseError::InvalidField {
                field: "stripes",
                reason: "chunk has no stripes",
            })?;
            let physical =
                stripe
                    .offset
                    .checked_add(offset_within)
                    .ok_or(ParseError::InvalidField {
                        field: "stripe_offset",
                        reason: "physical address overflow",
                    })?;
            return Ok(Some(PhysicalMapping {
                devid: stripe.devid,
                physical,
            }));
        }
    }
    Ok(None)
}

// ── Root items ──────────────────────────────────────────────────────────────

/// The subset of a root item needed to walk the referenced tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub generation: u64,
    /// Root node bytenr of the referenced tree.
    pub bytenr: u64,
    pub level: u8,
}

impl RootItem {
    pub fn parse_payload(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < ROOT_ITEM_MIN_SIZE {
            return Err(ParseError::InsufficientData {
                needed: ROOT_ITEM_MIN_SIZE,
                offset: 0,
                actual: payload.len(),
            });
        }
        Ok(Self {
            generation: read_le_u64(payload, ROOT_ITEM_GENERATION_OFFSET)?,
            bytenr: read_le_u64(payload, ROOT_ITEM_BYTENR_OFFSET)?,
            level: payload[ROOT_ITEM_LEVEL_OFFSET],
        })
    }
}

// ── File extent items ───────────────────────────────────────────────────────

/// Extent kind from the file extent item `type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentKind {
    /// Data embedded directly in the item payload; no disk extent.
    Inline,
    /// Regular on-disk extent.
    Regular,
    /// Allocated but unwritten; carries no checksums.
    Prealloc,
}

/// A parsed file extent item.
///
/// For `Inline` extents the disk fields are all zero and `num_bytes` is
/// the ram_bytes length of the embedded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentItem {
    pub generation: u64,
    pub kind: ExtentKind,
    pub compression: u8,
    /// Physical start address of the extent's data (0 for a hole).
    pub disk_bytenr: u64,
    /// Full on-disk allocation length.
    pub disk_num_bytes: u64,
    /// Byte offset into the disk extent where this reference starts.
    pub extent_offset: u64,
    /// Logical length in bytes covered by this reference.
    pub num_bytes: u64,
}

impl FileExtentItem {
    pub fn parse_payload(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < FILE_EXTENT_INLINE_HEADER {
            return Err(ParseError::InsufficientData {
                needed: FILE_EXTENT_INLINE_HEADER,
                offset: 0,
                actual: payload.len(),
            });
        }

        let generation = read_le_u64(payload, 0)?;
        let ram_bytes = read_le_u64(payload, 8)?;
        let compression = payload[16];
        let kind = match payload[20] {
            FILE_EXTENT_INLINE => ExtentKind::Inline,
            FILE_EXTENT_REG => ExtentKind::Regular,
            FILE_EXTENT_PREALLOC => ExtentKind::Prealloc,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "extent_type",
                    reason: "unknown file extent kind",
                });
            }
        };

        if kind == ExtentKind::Inline {
            return Ok(Self {
                generation,
                kind,
                compression,
                disk_bytenr: 0,
                disk_num_bytes: 0,
                extent_offset: 0,
                num_bytes: ram_bytes,
            });
        }

        if payload.len() < FILE_EXTENT_FIXED_SIZE {
            return Err(ParseError::InsufficientData {
                needed: FILE_EXTENT_FIXED_SIZE,
                offset: 0,
                actual: payload.len(),
            });
        }

        Ok(Self {
            generation,
            kind,
            compression,
            disk_bytenr: read_le_u64(payload, 21)?,
            disk_num_bytes: read_le_u64(payload, 29)?,
            extent_offset: read_le_u64(payload, 37)?,
            num_bytes: read_le_u64(payload, 45)?,
        })
    }
}
