#![forbid(unsafe_code)]
//! Read-only cursor over one on-disk tree.
//!
//! [`TreeReader::search`] descends from the root to the leaf that would
//! contain a key and returns a [`Cursor`] holding the whole path, so
//! [`TreeReader::next_leaf`] can continue across leaf boundaries without
//! re-searching. Dropping the cursor releases it; there is no explicit
//! release call.

use cw_block::ByteDevice;
use cw_error::{CwError, Result};
use cw_ondisk::{
    ChunkEntry, KeyPtr, LeafItem, MAX_LEVEL, map_logical_to_physical, parse_internal, parse_leaf,
};
use cw_types::{Key, ParseError};
use tracing::{debug, trace};

fn parse_failed(err: ParseError) -> CwError {
    CwError::Parse(err.to_string())
}

/// Whether a point search landed on the key or on its insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The cursor slot holds an item with exactly the searched key.
    Exact,
    /// No exact match; the cursor slot is where the key would be inserted
    /// (possibly one past the last item of the leaf).
    Insertion,
}

enum NodeKind {
    Leaf(Vec<LeafItem>),
    Internal(Vec<KeyPtr>),
}

struct PathLevel {
    bytenr: u64,
    level: u8,
    kind: NodeKind,
    slot: usize,
}

/// A traversal position: one parsed node plus slot per level, root first.
///
/// The slot of the deepest level indexes into that leaf's items and may
/// sit one past the last item after [`Cursor::advance`] or an insertion
/// search.
pub struct Cursor {
    levels: Vec<PathLevel>,
}

impl Cursor {
    fn leaf(&self) -> &PathLevel {
        self.levels.last().expect("cursor always holds a leaf")
    }

    fn leaf_mut(&mut self) -> &mut PathLevel {
        self.levels.last_mut().expect("cursor always holds a leaf")
    }

    fn leaf_items(&self) -> &[LeafItem] {
        match &self.leaf().kind {
            NodeKind::Leaf(items) => items,
            NodeKind::Internal(_) => unreachable!("deepest level is always a leaf"),
        }
    }

    /// Current slot within the leaf.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.leaf().slot
    }

    /// Number of items in the current leaf.
    #[must_use]
    pub fn leaf_len(&self) -> usize {
        self.leaf_items().len()
    }

    /// True when the slot points past the last item of the leaf.
    #[must_use]
    pub fn at_leaf_end(&self) -> bool {
        self.slot() >= self.leaf_len()
    }

    /// Key and payload at the current slot, or `None` past the leaf end.
    #[must_use]
    pub fn item(&self) -> Option<(&Key, &[u8])> {
        self.leaf_items()
            .get(self.slot())
            .map(|item| (&item.key, item.payload.as_slice()))
    }

    /// Step back one slot within the current leaf. Returns `false` when
    /// the slot is already the first in the leaf.
    pub fn step_back(&mut self) -> bool {
        let level = self.leaf_mut();
        if level.slot == 0 {
            return false;
        }
        level.slot -= 1;
        true
    }

    /// Advance one slot; may move one past the last item of the leaf.
    pub fn advance(&mut self) {
        let len = self.leaf_len();
        let level = self.leaf_mut();
        if level.slot < len {
            level.slot += 1;
        }
    }
}

/// Reader for one tree: device + chunk mapping + root bytenr + nodesize.
///
/// Each [`search`](Self::search) returns an independent cursor; walking
/// two trees concurrently needs two readers and never shares a cursor.
pub struct TreeReader<'a> {
    dev: &'a dyn ByteDevice,
    chunks: &'a [ChunkEntry],
    root_bytenr: u64,
    nodesize: u32,
}

impl<'a> TreeReader<'a> {
    #[must_use]
    pub fn new(
        dev: &'a dyn ByteDevice,
        chunks: &'a [ChunkEntry],
        root_bytenr: u64,
        nodesize: u32,
    ) -> Self {
        Self {
            dev,
            chunks,
            root_bytenr,
            nodesize,
        }
    }

    fn read_node(&self, logical: u64, expect_level: Option<u8>) -> Result<PathLevel> {
        let mapping = map_logical_to_physical(self.chunks, logical)
            .map_err(parse_failed)?
            .ok_or_else(|| {
                CwError::SearchFailed(format!("logical address {logical} not covered by any chunk"))
            })?;

        let nodesize = usize::try_from(self.nodesize)
            .map_err(|_| CwError::Format("nodesize overflows usize".into()))?;
        let mut block = vec![0_u8; nodesize];
        self.dev.read_exact_at(mapping.physical, &mut block)?;

        let header = cw_ondisk::NodeHeader::parse_from_block(&block).map_err(parse_failed)?;
        header
            .validate(block.len(), Some(logical))
            .map_err(parse_failed)?;

        if let Some(expected) = expect_level {
            if header.level != expected {
                return Err(CwError::SearchFailed(format!(
                    "node {logical} has level {}, expected {expected}",
                    header.level
                )));
            }
        }

        let kind = if header.level == 0 {
            let (_, items) = parse_leaf(&block).map_err(parse_failed)?;
            NodeKind::Leaf(items)
        } else {
            let (_, ptrs) = parse_internal(&block).map_err(parse_failed)?;
            NodeKind::Internal(ptrs)
        };

        Ok(PathLevel {
            bytenr: logical,
            level: header.level,
            kind,
            slot: 0,
        })
    }

    /// Point search: descend to the leaf that contains `key` or its
    /// insertion point.
    pub fn search(&self, key: &Key) -> Result<(Cursor, SearchOutcome)> {
        let mut levels = Vec::new();
        let mut logical = self.root_bytenr;
        let mut expect_level: Option<u8> = None;

        // Bounded by the maximum tree depth; a deeper chain of internal
        // nodes is corruption, not a taller tree.
        for _ in 0..=usize::from(MAX_LEVEL) {
            let mut node = self.read_node(logical, expect_level)?;
            match &node.kind {
                NodeKind::Internal(ptrs) => {
                    if ptrs.is_empty() {
                        return Err(CwError::SearchFailed(format!(
                            "internal node {logical} has no children"
                        )));
                    }
                    // Child with the greatest first key <= target; keys
                    // below the first child still descend through slot 0.
                    let slot = match ptrs.binary_search_by(|ptr| ptr.key.cmp(key)) {
                        Ok(idx) => idx,
                        Err(0) => 0,
                        Err(idx) => idx - 1,
                    };
                    node.slot = slot;
                    let child = ptrs[slot].blockptr;
                    expect_level = Some(node.level - 1);
                    trace!(bytenr = logical, level = node.level, slot, child, "descend");
                    levels.push(node);
                    logical = child;
                }
                NodeKind::Leaf(items) => {
                    let (slot, outcome) = match items.binary_search_by(|item| item.key.cmp(key)) {
                        Ok(idx) => (idx, SearchOutcome::Exact),
                        Err(idx) => (idx, SearchOutcome::Insertion),
                    };
                    node.slot = slot;
                    trace!(bytenr = logical, slot, ?outcome, "leaf reached");
                    levels.push(node);
                    return Ok((Cursor { levels }, outcome));
                }
            }
        }

        Err(CwError::SearchFailed(
            "tree deeper than the maximum level".into(),
        ))
    }

    /// Advance the cursor to slot 0 of the following leaf.
    ///
    /// Returns `false` when the current leaf is the last one in the tree;
    /// the cursor is left unchanged in that case. On `Err` the cursor is
    /// invalidated and must not be used again.
    pub fn next_leaf(&self, cursor: &mut Cursor) -> Result<bool> {
        // Deepest ancestor with an unvisited right sibling.
        let Some(pivot) = cursor.levels.iter().rposition(|level| match &level.kind {
            NodeKind::Internal(ptrs) => level.slot + 1 < ptrs.len(),
            NodeKind::Leaf(_) => false,
        }) else {
            debug!("next_leaf: tree exhausted");
            return Ok(false);
        };

        let mut levels: Vec<PathLevel> = cursor.levels.drain(..=pivot).collect();
        let pivot_level = levels.last_mut().expect("pivot level present");
        pivot_level.slot += 1;

        let (mut logical, mut expect_level) = match &pivot_level.kind {
            NodeKind::Internal(ptrs) => (
                ptrs[pivot_level.slot].blockptr,
                pivot_level.level.checked_sub(1),
            ),
            NodeKind::Leaf(_) => unreachable!("pivot is always internal"),
        };

        // Descend leftmost to the next leaf.
        loop {
            let node = self.read_node(logical, expect_level)?;
            debug!(bytenr = node.bytenr, level = node.level, "next_leaf descend");
            match &node.kind {
                NodeKind::Leaf(_) => {
                    levels.push(node);
                    cursor.levels = levels;
                    return Ok(true);
                }
                NodeKind::Internal(ptrs) => {
                    let first = ptrs.first().ok_or_else(|| {
                        CwError::SearchFailed(format!("internal node {logical} has no children"))
                    })?;
                    logical = first.blockptr;
                    expect_level = node.level.checked_sub(1);
                    levels.push(node);
                }
            }
        }
    }
}
