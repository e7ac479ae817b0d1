#![forbid(unsafe_code)]
//! Checksum range walker and file extent enumerator.
//!
//! [`CsumTreeWalker::collect_checksums`] walks the checksum tree from a
//! physical start address, reading values out of byte-packed checksum
//! items across item and leaf boundaries until the requested count is
//! satisfied. [`ExtentEnumerator::extents_of`] walks a file's extent
//! items in the fs tree; [`dump_file_csums`] drives one checksum walk per
//! regular extent.
//!
//! Both walks are single-threaded, read-only, and run to completion or
//! fail outright. The fs-tree cursor and each per-extent checksum-tree
//! cursor are independent; no cursor is shared across extents.

use cw_block::ByteDevice;
use cw_btree::{SearchOutcome, TreeReader};
use cw_error::{CwError, Result};
use cw_ondisk::{ChunkEntry, ExtentKind, FileExtentItem};
use cw_types::{
    EXTENT_CSUM_KEY, EXTENT_CSUM_OBJECTID, EXTENT_DATA_KEY, InodeNumber, Key, ParseError, TxnId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

fn parse_failed(err: ParseError) -> CwError {
    CwError::Parse(err.to_string())
}

/// Whether the walk runs standalone or inside a caller's transaction.
///
/// The walker only threads this through for diagnostics; it never starts,
/// commits, or coordinates transactions itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    ReadOnly,
    WithinTransaction(TxnId),
}

/// One stored checksum value and the physical address of the sector it
/// covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsumEntry {
    pub bytenr: u64,
    pub csum: Vec<u8>,
}

/// A data extent of a file, in ascending logical-offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtent {
    /// Logical file offset this extent starts at.
    pub logical_offset: u64,
    pub kind: ExtentKind,
    pub compression: u8,
    /// Physical start address of the extent's data (0 for a hole).
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Logical length in bytes.
    pub num_bytes: u64,
}

// ── Checksum range walker ───────────────────────────────────────────────────

/// Walker over the global checksum tree.
pub struct CsumTreeWalker<'a> {
    tree: TreeReader<'a>,
    sector_size: u32,
    csum_size: u16,
}

impl<'a> CsumTreeWalker<'a> {
    #[must_use]
    pub fn new(
        dev: &'a dyn ByteDevice,
        chunks: &'a [ChunkEntry],
        csum_root: u64,
        nodesize: u32,
        sector_size: u32,
        csum_size: u16,
    ) -> Self {
        Self {
            tree: TreeReader::new(dev, chunks, csum_root, nodesize),
            sector_size,
            csum_size,
        }
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Collect exactly `required` checksum values covering the physical
    /// range starting at `start_bytenr`, in ascending address order.
    ///
    /// `start_bytenr` must be sector-aligned and `required` at least 1.
    /// Fails with `NotFound` when no item covers the start address or the
    /// tree runs out before `required` values were produced, `InvalidKey`
    /// when a non-checksum item sits where a predecessor was expected,
    /// and `Gap` when the next item in key order does not pick up at the
    /// expected continuation address.
    pub fn collect_checksums(
        &self,
        mode: WalkMode,
        start_bytenr: u64,
        required: usize,
    ) -> Result<Vec<CsumEntry>> {
        let sector = u64::from(self.sector_size);
        let csum_size = usize::from(self.csum_size);

        if required == 0 {
            return Err(CwError::NotFound(format!(
                "requested zero checksums at {start_bytenr}"
            )));
        }
        if start_bytenr % sector != 0 {
            return Err(CwError::UnalignedAddress {
                bytenr: start_bytenr,
                sector_size: self.sector_size,
            });
        }

        debug!(?mode, start_bytenr, required, "collect checksums");

        let search_key = Key::new(EXTENT_CSUM_OBJECTID, EXTENT_CSUM_KEY, start_bytenr);
        let (mut cursor, outcome) = self.tree.search(&search_key)?;

        // Element index into the current item's value array. An exact hit
        // starts at the item's first value; an insertion point steps back
        // to the predecessor and lands mid-item.
        let mut elem = match outcome {
            SearchOutcome::Exact => 0_usize,
            SearchOutcome::Insertion => {
                if !cursor.step_back() {
                    return Err(CwError::NotFound(format!(
                        "no checksum item precedes address {start_bytenr}"
                    )));
                }
                let (key, _) = cursor.item().ok_or_else(|| {
                    CwError::SearchFailed("cursor lost its leaf after step back".into())
                })?;
                if key.objectid != EXTENT_CSUM_OBJECTID || key.item_type != EXTENT_CSUM_KEY {
                    return Err(CwError::InvalidKey(format!(
                        "expected checksum item before address {start_bytenr}, found key {key}"
                    )));
                }
                usize::try_from((start_bytenr - key.offset) / sector)
                    .map_err(|_| CwError::Format("element index overflows usize".into()))?
            }
        };

        let mut out = Vec::with_capacity(required);
        let mut pending = required;
        let mut expected_next = start_bytenr;

        loop {
            if cursor.at_leaf_end() {
                if !self.tree.next_leaf(&mut cursor)? {
                    return Err(CwError::NotFound(format!(
                        "checksum tree exhausted with {pending} of {required} values missing \
                         (walk started at {start_bytenr})"
                    )));
                }
                // Leaf boundaries are transparent: resume at slot 0 and
                // re-check, since the next leaf may be empty.
                continue;
            }

            let (key, payload) = cursor
                .item()
                .ok_or_else(|| CwError::SearchFailed("cursor slot out of range".into()))?;
            let key = *key;

            if key.objectid != EXTENT_CSUM_OBJECTID || key.item_type != EXTENT_CSUM_KEY {
                return Err(CwError::InvalidKey(format!(
                    "expected checksum item at address {expected_next}, found key {key}"
                )));
            }
            if payload.is_empty() || payload.len() % csum_size != 0 {
                return Err(CwError::InvalidItemSize {
                    bytenr: key.offset,
                    size: payload.len(),
                    csum_size: self.csum_size,
                });
            }

            let count = payload.len() / csum_size;
            if elem >= count {
                // The predecessor item ends before the walk position.
                return Err(CwError::NotFound(format!(
                    "no checksum item covers address {expected_next}"
                )));
            }

            // The item must pick up exactly where the walk left off. The
            // on-disk format does not guarantee this across items, so a
            // mismatch is surfaced instead of emitting misaligned data.
            let elem_bytenr = (elem as u64)
                .checked_mul(sector)
                .and_then(|off| key.offset.checked_add(off))
                .ok_or_else(|| CwError::Format("checksum address overflows u64".into()))?;
            if elem_bytenr != expected_next {
                return Err(CwError::Gap {
                    expected: expected_next,
                    found: key.offset,
                });
            }

            let take = (count - elem).min(pending);
            for idx in elem..elem + take {
                out.push(CsumEntry {
                    bytenr: key.offset + (idx as u64) * sector,
                    csum: payload[idx * csum_size..(idx + 1) * csum_size].to_vec(),
                });
            }
            pending -= take;
            expected_next = key.offset + ((elem + take) as u64) * sector;
            trace!(
                item_offset = key.offset,
                taken = take,
                pending,
                "read checksum item"
            );

            if pending == 0 {
                return Ok(out);
            }
            cursor.advance();
            elem = 0;
        }
    }
}

// ── Extent enumerator ───────────────────────────────────────────────────────

/// Enumerator over a file's extent items in the fs tree.
pub struct ExtentEnumerator<'a> {
    tree: TreeReader<'a>,
}

impl<'a> ExtentEnumerator<'a> {
    #[must_use]
    pub fn new(
        dev: &'a dyn ByteDevice,
        chunks: &'a [ChunkEntry],
        fs_root: u64,
        nodesize: u32,
    ) -> Self {
        Self {
            tree: TreeReader::new(dev, chunks, fs_root, nodesize),
        }
    }

    /// All data-extent items for `ino`, in ascending logical-offset order.
    ///
    /// A file with no extent items yields an empty sequence, not an
    /// error. Enumeration stops at the first item whose key has moved to
    /// a different object or type.
    pub fn extents_of(&self, ino: InodeNumber) -> Result<Vec<FileExtent>> {
        let search_key = Key::new(ino.0, EXTENT_DATA_KEY, 0);
        let (mut cursor, _) = self
            .tree
            .search(&search_key)
            .map_err(|err| CwError::ExtentLookupFailed(err.to_string()))?;

        let mut extents = Vec::new();
        loop {
            if cursor.at_leaf_end() {
                if !self.tree.next_leaf(&mut cursor)? {
                    break;
                }
                continue;
            }

            let Some((key, payload)) = cursor.item() else {
                return Err(CwError::ExtentLookupFailed(
                    "cursor slot out of range".into(),
                ));
            };
            if key.objectid != ino.0 || key.item_type != EXTENT_DATA_KEY {
                // Keyspace moved past this inode's extents.
                break;
            }

            let item = FileExtentItem::parse_payload(payload).map_err(parse_failed)?;
            extents.push(FileExtent {
                logical_offset: key.offset,
                kind: item.kind,
                compression: item.compression,
                disk_bytenr: item.disk_bytenr,
                disk_num_bytes: item.disk_num_bytes,
                num_bytes: item.num_bytes,
            });
            cursor.advance();
        }

        debug!(ino = ino.0, count = extents.len(), "enumerated extents");
        Ok(extents)
    }
}

/// Collect the stored checksums for every regular data extent of `ino`.
///
/// The expected value count per extent is derived from the extent length
/// and the filesystem's sector size. Inline extents, holes, preallocated
/// (unwritten) extents, and sub-sector tails carry no stored checksums
/// and are skipped. Any walker error aborts the whole enumeration with no
/// partial result.
pub fn dump_file_csums(
    enumerator: &ExtentEnumerator<'_>,
    walker: &CsumTreeWalker<'_>,
    mode: WalkMode,
    ino: InodeNumber,
) -> Result<Vec<CsumEntry>> {
    let sector = u64::from(walker.sector_size());
    let extents = enumerator.extents_of(ino)?;

    let mut out = Vec::new();
    for extent in &extents {
        match extent.kind {
            ExtentKind::Inline => {
                debug!(logical = extent.logical_offset, "skipping inline extent");
                continue;
            }
            ExtentKind::Prealloc => {
                debug!(logical = extent.logical_offset, "skipping unwritten extent");
                continue;
            }
            ExtentKind::Regular if extent.disk_bytenr == 0 => {
                debug!(logical = extent.logical_offset, "skipping hole");
                continue;
            }
            ExtentKind::Regular => {}
        }

        let count = usize::try_from(extent.num_bytes / sector)
            .map_err(|_| CwError::Format("checksum count overflows usize".into()))?;
        if count == 0 {
            debug!(
                logical = extent.logical_offset,
                num_bytes = extent.num_bytes,
                "extent shorter than one sector, no stored checksums"
            );
            continue;
        }

        let entries = walker.collect_checksums(mode, extent.disk_bytenr, count)?;
        out.extend(entries);
    }

    Ok(out)
}
