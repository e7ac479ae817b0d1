#![forbid(unsafe_code)]
//! Image open and lookup wiring.
//!
//! [`Image::open`] reads and validates the superblock, loads the full
//! logical-to-physical chunk mapping (bootstrap sys_chunk_array first,
//! then the chunk tree), and resolves the checksum-tree and fs-tree roots
//! from the root tree. The opened image exposes the per-inode checksum
//! dump used by the CLI.
//!
//! Everything is read-only; the image is never written or locked.

use cw_block::{ByteDevice, FileByteDevice, read_superblock_region};
use cw_btree::{SearchOutcome, TreeReader};
use cw_csum::{CsumEntry, CsumTreeWalker, ExtentEnumerator, FileExtent, WalkMode, dump_file_csums};
use cw_error::{CwError, Result};
use cw_ondisk::{ChunkEntry, RootItem, Superblock, parse_chunk_payload, parse_sys_chunk_array};
use cw_types::{
    CHUNK_ITEM_KEY, CSUM_TREE_OBJECTID, FS_TREE_OBJECTID, InodeNumber, Key, ParseError,
    ROOT_ITEM_KEY, csum_size_for_type,
};
use std::path::Path;
use tracing::{debug, info};

fn parse_failed(err: ParseError) -> CwError {
    CwError::Parse(err.to_string())
}

/// An opened filesystem image, ready for checksum lookups.
pub struct Image {
    dev: Box<dyn ByteDevice>,
    superblock: Superblock,
    chunks: Vec<ChunkEntry>,
    csum_root: u64,
    fs_root: u64,
    csum_size: u16,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("label", &self.superblock.label)
            .field("sectorsize", &self.superblock.sectorsize)
            .field("nodesize", &self.superblock.nodesize)
            .field("csum_root", &self.csum_root)
            .field("fs_root", &self.fs_root)
            .field("chunks", &self.chunks.len())
            .field("dev_len", &self.dev.len_bytes())
            .finish()
    }
}

impl Image {
    /// Open the image file at `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::from_device(Box::new(dev))
    }

    /// Open an already-constructed device (used by tests and harnesses).
    pub fn from_device(dev: Box<dyn ByteDevice>) -> Result<Self> {
        let region = read_superblock_region(&*dev)?;
        let superblock = Superblock::parse_superblock_region(&region)
            .map_err(|err| CwError::Format(format!("not a usable btrfs superblock: {err}")))?;

        let csum_size = csum_size_for_type(superblock.csum_type).ok_or_else(|| {
            CwError::Format(format!(
                "unsupported checksum algorithm {}",
                superblock.csum_type
            ))
        })?;

        let bootstrap = parse_sys_chunk_array(&superblock.sys_chunk_array).map_err(parse_failed)?;
        let chunks = load_chunk_tree(
            &*dev,
            &bootstrap,
            superblock.chunk_root,
            superblock.nodesize,
        )?;

        let csum_root = find_tree_root(
            &*dev,
            &chunks,
            superblock.root,
            superblock.nodesize,
            CSUM_TREE_OBJECTID,
        )?
        .ok_or_else(|| CwError::Format("image has no checksum tree root".into()))?;
        let fs_root = find_tree_root(
            &*dev,
            &chunks,
            superblock.root,
            superblock.nodesize,
            FS_TREE_OBJECTID,
        )?
        .ok_or_else(|| CwError::Format("image has no fs tree root".into()))?;

        info!(
            label = %superblock.label,
            generation = superblock.generation,
            sectorsize = superblock.sectorsize,
            nodesize = superblock.nodesize,
            csum_size,
            chunks = chunks.len(),
            "opened image"
        );

        Ok(Self {
            dev,
            superblock,
            chunks,
            csum_root,
            fs_root,
            csum_size,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.superblock.sectorsize
    }

    /// Stored checksum size in bytes, from the superblock algorithm.
    #[must_use]
    pub fn csum_size(&self) -> u16 {
        self.csum_size
    }

    fn enumerator(&self) -> ExtentEnumerator<'_> {
        ExtentEnumerator::new(
            &*self.dev,
            &self.chunks,
            self.fs_root,
            self.superblock.nodesize,
        )
    }

    fn walker(&self) -> CsumTreeWalker<'_> {
        CsumTreeWalker::new(
            &*self.dev,
            &self.chunks,
            self.csum_root,
            self.superblock.nodesize,
            self.superblock.sectorsize,
            self.csum_size,
        )
    }

    /// All data extents of `ino`, ascending by logical offset.
    pub fn extents_of(&self, ino: InodeNumber) -> Result<Vec<FileExtent>> {
        self.enumerator().extents_of(ino)
    }

    /// Stored checksums for every regular data extent of `ino`.
    pub fn dump_csums_for_inode(&self, mode: WalkMode, ino: InodeNumber) -> Result<Vec<CsumEntry>> {
        dump_file_csums(&self.enumerator(), &self.walker(), mode, ino)
    }
}

/// Load the full chunk list: every CHUNK_ITEM in the chunk tree, plus any
/// bootstrap entries the tree does not repeat.
///
/// The sys_chunk_array only covers SYSTEM chunks; metadata and data live
/// in chunks described by the chunk tree itself, which is readable via
/// the bootstrap mapping.
fn load_chunk_tree(
    dev: &dyn ByteDevice,
    bootstrap: &[ChunkEntry],
    chunk_root: u64,
    nodesize: u32,
) -> Result<Vec<ChunkEntry>> {
    let tree = TreeReader::new(dev, bootstrap, chunk_root, nodesize);
    let (mut cursor, _) = tree.search(&Key::new(0, 0, 0))?;

    let mut chunks: Vec<ChunkEntry> = Vec::new();
    loop {
        if cursor.at_leaf_end() {
            if !tree.next_leaf(&mut cursor)? {
                break;
            }
            continue;
        }
        let Some((key, payload)) = cursor.item() else {
            break;
        };
        if key.item_type == CHUNK_ITEM_KEY {
            let (entry, _) = parse_chunk_payload(*key, payload).map_err(parse_failed)?;
            chunks.push(entry);
        }
        cursor.advance();
    }

    for entry in bootstrap {
        if !chunks.iter().any(|c| c.key.offset == entry.key.offset) {
            chunks.push(entry.clone());
        }
    }

    debug!(count = chunks.len(), "loaded chunk mapping");
    Ok(chunks)
}

/// Resolve the root bytenr of the tree owned by `objectid` via the root
/// tree. Returns `Ok(None)` when the root tree has no such item.
fn find_tree_root(
    dev: &dyn ByteDevice,
    chunks: &[ChunkEntry],
    root_tree: u64,
    nodesize: u32,
    objectid: u64,
) -> Result<Option<u64>> {
    let tree = TreeReader::new(dev, chunks, root_tree, nodesize);
    let key = Key::new(objectid, ROOT_ITEM_KEY, 0);
    let (mut cursor, outcome) = tree.search(&key)?;

    // Snapshot roots carry a transaction id in the key offset, so an
    // insertion point may sit just before the item; take the first item
    // at or after the search key that still matches objectid and type.
    if outcome == SearchOutcome::Insertion && cursor.at_leaf_end() && !tree.next_leaf(&mut cursor)?
    {
        return Ok(None);
    }

    let Some((found, payload)) = cursor.item() else {
        return Ok(None);
    };
    if found.objectid != objectid || found.item_type != ROOT_ITEM_KEY {
        return Ok(None);
    }

    let item = RootItem::parse_payload(payload).map_err(parse_failed)?;
    debug!(objectid, bytenr = item.bytenr, level = item.level, "resolved tree root");
    Ok(Some(item.bytenr))
}
