//! End-to-end walk over a synthetic image file: superblock, chunk tree,
//! root tree, fs tree, and a two-leaf checksum tree, opened through the
//! regular file path.

use cw_core::Image;
use cw_csum::WalkMode;
use cw_ondisk::ExtentKind;
use cw_types::{
    BTRFS_MAGIC, BTRFS_SUPER_INFO_OFFSET, CHUNK_ITEM_KEY, CSUM_TREE_OBJECTID, EXTENT_CSUM_KEY,
    EXTENT_CSUM_OBJECTID, EXTENT_DATA_KEY, FS_TREE_OBJECTID, InodeNumber, Key, ROOT_ITEM_KEY,
};
use std::io::Write;

const NODESIZE: usize = 4096;
const SECTOR: u64 = 4096;
const IMAGE_LEN: u64 = 0x80_000;

const CHUNK_ROOT: u64 = 0x20_000;
const ROOT_TREE: u64 = 0x30_000;
const FS_TREE: u64 = 0x40_000;
const CSUM_ROOT: u64 = 0x50_000;
const CSUM_LEAF_A: u64 = 0x52_000;
const CSUM_LEAF_B: u64 = 0x54_000;
const DATA_A: u64 = 0x60_000;
const DATA_B: u64 = 0x70_000;

const INO: InodeNumber = InodeNumber(261);

const NODE_HEADER_SIZE: usize = 101;
const LEAF_ITEM_SIZE: usize = 25;
const KEY_PTR_SIZE: usize = 33;

// ── block builders ──────────────────────────────────────────────────────────

fn write_key(buf: &mut [u8], at: usize, key: Key) {
    buf[at..at + 8].copy_from_slice(&key.objectid.to_le_bytes());
    buf[at + 8] = key.item_type;
    buf[at + 9..at + 17].copy_from_slice(&key.offset.to_le_bytes());
}

/// Identity-mapped single-stripe chunk payload covering `length` bytes.
fn chunk_payload(length: u64, chunk_type: u64) -> Vec<u8> {
    let mut payload = vec![0_u8; 48 + 32];
    payload[0..8].copy_from_slice(&length.to_le_bytes());
    payload[8..16].copy_from_slice(&2_u64.to_le_bytes());
    payload[16..24].copy_from_slice(&0x1_0000_u64.to_le_bytes());
    payload[24..32].copy_from_slice(&chunk_type.to_le_bytes());
    payload[44..46].copy_from_slice(&1_u16.to_le_bytes());
    payload[48..56].copy_from_slice(&1_u64.to_le_bytes());
    // stripe offset 0 and zero dev_uuid make the mapping an identity
    payload
}

fn root_item_payload(bytenr: u64, level: u8) -> Vec<u8> {
    let mut payload = vec![0_u8; 239];
    payload[160..168].copy_from_slice(&10_u64.to_le_bytes());
    payload[176..184].copy_from_slice(&bytenr.to_le_bytes());
    payload[238] = level;
    payload
}

fn regular_extent_payload(disk_bytenr: u64, num_bytes: u64) -> Vec<u8> {
    let mut payload = vec![0_u8; 53];
    payload[0..8].copy_from_slice(&10_u64.to_le_bytes());
    payload[8..16].copy_from_slice(&num_bytes.to_le_bytes());
    payload[20] = 1;
    payload[21..29].copy_from_slice(&disk_bytenr.to_le_bytes());
    payload[29..37].copy_from_slice(&num_bytes.to_le_bytes());
    payload[45..53].copy_from_slice(&num_bytes.to_le_bytes());
    payload
}

fn inline_extent_payload(data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0_u8; 21 + data.len()];
    payload[0..8].copy_from_slice(&10_u64.to_le_bytes());
    payload[8..16].copy_from_slice(&(data.len() as u64).to_le_bytes());
    payload[20] = 0;
    payload[21..].copy_from_slice(data);
    payload
}

fn leaf(bytenr: u64, items: &[(Key, Vec<u8>)]) -> Vec<u8> {
    let mut block = vec![0_u8; NODESIZE];
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&(items.len() as u32).to_le_bytes());
    block[0x64] = 0;
    let mut data_cursor = NODESIZE - NODE_HEADER_SIZE;
    for (idx, (key, payload)) in items.iter().enumerate() {
        data_cursor -= payload.len();
        let base = NODE_HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        write_key(&mut block, base, *key);
        block[base + 17..base + 21].copy_from_slice(&(data_cursor as u32).to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let start = NODE_HEADER_SIZE + data_cursor;
        block[start..start + payload.len()].copy_from_slice(payload);
    }
    block
}

fn internal(bytenr: u64, level: u8, children: &[(Key, u64)]) -> Vec<u8> {
    let mut block = vec![0_u8; NODESIZE];
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&(children.len() as u32).to_le_bytes());
    block[0x64] = level;
    for (idx, (key, ptr)) in children.iter().enumerate() {
        let base = NODE_HEADER_SIZE + idx * KEY_PTR_SIZE;
        write_key(&mut block, base, *key);
        block[base + 17..base + 25].copy_from_slice(&ptr.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&10_u64.to_le_bytes());
    }
    block
}

fn csum_key(offset: u64) -> Key {
    Key::new(EXTENT_CSUM_OBJECTID, EXTENT_CSUM_KEY, offset)
}

fn superblock() -> Vec<u8> {
    let mut region = vec![0_u8; 4096];
    region[0x30..0x38].copy_from_slice(&(BTRFS_SUPER_INFO_OFFSET as u64).to_le_bytes());
    region[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
    region[0x48..0x50].copy_from_slice(&10_u64.to_le_bytes());
    region[0x50..0x58].copy_from_slice(&ROOT_TREE.to_le_bytes());
    region[0x58..0x60].copy_from_slice(&CHUNK_ROOT.to_le_bytes());
    region[0x70..0x78].copy_from_slice(&IMAGE_LEN.to_le_bytes());
    region[0x88..0x90].copy_from_slice(&1_u64.to_le_bytes());
    region[0x90..0x94].copy_from_slice(&(SECTOR as u32).to_le_bytes());
    region[0x94..0x98].copy_from_slice(&(NODESIZE as u32).to_le_bytes());
    region[0xC4..0xC6].copy_from_slice(&0_u16.to_le_bytes());
    region[0x12B..0x130].copy_from_slice(b"itest");

    // Bootstrap SYSTEM chunk: disk key + chunk, identity over the image.
    let mut array = Vec::new();
    let mut disk_key = [0_u8; 17];
    write_key(&mut disk_key, 0, Key::new(256, CHUNK_ITEM_KEY, 0));
    array.extend_from_slice(&disk_key);
    array.extend_from_slice(&chunk_payload(IMAGE_LEN, 2));
    region[0xA0..0xA4].copy_from_slice(&(array.len() as u32).to_le_bytes());
    region[0x32B..0x32B + array.len()].copy_from_slice(&array);
    region
}

/// Full image: one identity chunk, a root tree referencing the fs tree
/// and a two-leaf checksum tree, and one three-extent file.
///
/// Inode 261 layout:
///   [0, 0x2000)       regular extent at DATA_A, two sectors
///   [0x2000, 0x2040)  inline extent, no stored checksums
///   [0x3000, 0x4000)  regular extent at DATA_B, one sector
///
/// Checksum values (LE u32): 0xA0, 0xA1 for DATA_A split across the two
/// leaves, 0xB0 for DATA_B.
fn build_image() -> Vec<u8> {
    let mut image = vec![0_u8; IMAGE_LEN as usize];
    let mut place = |bytenr: u64, block: &[u8]| {
        let start = bytenr as usize;
        image[start..start + block.len()].copy_from_slice(block);
    };

    place(BTRFS_SUPER_INFO_OFFSET as u64, &superblock());

    place(
        CHUNK_ROOT,
        &leaf(
            CHUNK_ROOT,
            &[(Key::new(256, CHUNK_ITEM_KEY, 0), chunk_payload(IMAGE_LEN, 2))],
        ),
    );

    place(
        ROOT_TREE,
        &leaf(
            ROOT_TREE,
            &[
                (
                    Key::new(FS_TREE_OBJECTID, ROOT_ITEM_KEY, 0),
                    root_item_payload(FS_TREE, 0),
                ),
                (
                    Key::new(CSUM_TREE_OBJECTID, ROOT_ITEM_KEY, 0),
                    root_item_payload(CSUM_ROOT, 1),
                ),
            ],
        ),
    );

    place(
        FS_TREE,
        &leaf(
            FS_TREE,
            &[
                (
                    Key::new(INO.0, EXTENT_DATA_KEY, 0),
                    regular_extent_payload(DATA_A, SECTOR * 2),
                ),
                (
                    Key::new(INO.0, EXTENT_DATA_KEY, SECTOR * 2),
                    inline_extent_payload(b"inline data, not checksummed here"),
                ),
                (
                    Key::new(INO.0, EXTENT_DATA_KEY, SECTOR * 3),
                    regular_extent_payload(DATA_B, SECTOR),
                ),
                // A neighboring inode that must stay out of the dump.
                (
                    Key::new(INO.0 + 1, EXTENT_DATA_KEY, 0),
                    regular_extent_payload(DATA_B, SECTOR),
                ),
            ],
        ),
    );

    // DATA_A's two values split across the leaves so the walk has to
    // follow a leaf boundary mid-extent.
    place(
        CSUM_ROOT,
        &internal(
            CSUM_ROOT,
            1,
            &[
                (csum_key(DATA_A), CSUM_LEAF_A),
                (csum_key(DATA_A + SECTOR), CSUM_LEAF_B),
            ],
        ),
    );
    place(
        CSUM_LEAF_A,
        &leaf(
            CSUM_LEAF_A,
            &[(csum_key(DATA_A), 0xA0_u32.to_le_bytes().to_vec())],
        ),
    );
    place(
        CSUM_LEAF_B,
        &leaf(
            CSUM_LEAF_B,
            &[
                (csum_key(DATA_A + SECTOR), 0xA1_u32.to_le_bytes().to_vec()),
                (csum_key(DATA_B), 0xB0_u32.to_le_bytes().to_vec()),
            ],
        ),
    );

    image
}

fn open_image() -> Image {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&build_image()).expect("write image");
    file.flush().expect("flush");
    Image::open(file.path()).expect("open image")
}

#[test]
fn open_reads_geometry_from_superblock() {
    let image = open_image();
    assert_eq!(image.sector_size(), SECTOR as u32);
    assert_eq!(image.csum_size(), 4);
    assert_eq!(image.superblock().label, "itest");
    assert_eq!(image.superblock().generation, 10);
}

#[test]
fn extents_enumerate_in_logical_order() {
    let image = open_image();
    let extents = image.extents_of(INO).expect("extents");
    assert_eq!(extents.len(), 3);
    assert_eq!(extents[0].logical_offset, 0);
    assert_eq!(extents[0].kind, ExtentKind::Regular);
    assert_eq!(extents[0].disk_bytenr, DATA_A);
    assert_eq!(extents[1].kind, ExtentKind::Inline);
    assert_eq!(extents[2].logical_offset, SECTOR * 3);
    assert_eq!(extents[2].disk_bytenr, DATA_B);
}

#[test]
fn dump_walks_all_regular_extents() {
    let image = open_image();
    let entries = image
        .dump_csums_for_inode(WalkMode::ReadOnly, INO)
        .expect("dump");

    let got: Vec<(u64, Vec<u8>)> = entries
        .iter()
        .map(|e| (e.bytenr, e.csum.clone()))
        .collect();
    assert_eq!(
        got,
        vec![
            (DATA_A, 0xA0_u32.to_le_bytes().to_vec()),
            (DATA_A + SECTOR, 0xA1_u32.to_le_bytes().to_vec()),
            (DATA_B, 0xB0_u32.to_le_bytes().to_vec()),
        ]
    );
}

#[test]
fn dump_is_repeatable() {
    let image = open_image();
    let first = image
        .dump_csums_for_inode(WalkMode::ReadOnly, INO)
        .expect("first dump");
    let second = image
        .dump_csums_for_inode(WalkMode::ReadOnly, INO)
        .expect("second dump");
    assert_eq!(first, second);
}

#[test]
fn walk_mode_does_not_change_results() {
    let image = open_image();
    let read_only = image
        .dump_csums_for_inode(WalkMode::ReadOnly, INO)
        .expect("read-only dump");
    let in_txn = image
        .dump_csums_for_inode(WalkMode::WithinTransaction(cw_types::TxnId(7)), INO)
        .expect("transactional dump");
    assert_eq!(read_only, in_txn);
}

#[test]
fn inode_without_extents_dumps_nothing() {
    let image = open_image();
    let entries = image
        .dump_csums_for_inode(WalkMode::ReadOnly, InodeNumber(9999))
        .expect("dump");
    assert!(entries.is_empty());
}
