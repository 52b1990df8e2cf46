//! # Doublewrite Header Codec
//!
//! The on-disk anchor of the staging area is a 38-byte header embedded in
//! the system header page at [`HEADER_OFFSET`](crate::config::HEADER_OFFSET).
//! It records where the two staging blocks live and doubles as the
//! presence marker consulted by both bootstrap and the recovery loader.
//!
//! ## Header Layout (38 bytes)
//!
//! ```text
//! Offset  Size  Field             Description
//! ------  ----  ----------------  -----------------------------------
//! 0       4     magic             MAGIC when the area exists
//! 4       10    fseg              File-segment anchor (opaque here;
//!                                 owned by the space manager)
//! 14      4     block1            First page of staging block 1
//! 18      4     block2            First page of staging block 2
//! 22      4     magic_repeat      Copy of magic
//! 26      4     block1_repeat     Copy of block1
//! 30      4     block2_repeat     Copy of block2
//! 34      4     space_ids_stored  SPACE_IDS_STORED once staged pages
//!                                 carry tablespace ids
//! ```
//!
//! The header sits on a page that is itself rewritten in place, so every
//! load-bearing field is stored twice: the header is trusted only when
//! both magic copies agree, and bootstrap stamps the block numbers into
//! both slots inside the same mini-transaction.
//!
//! All fields are little-endian; the struct is `Unaligned` because the
//! header overlays an arbitrary byte offset of the page.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{HEADER_SIZE, MAGIC, SPACE_IDS_STORED};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DoublewriteHeader {
    magic: U32,
    fseg: [u8; 10],
    block1: U32,
    block2: U32,
    magic_repeat: U32,
    block1_repeat: U32,
    block2_repeat: U32,
    space_ids_stored: U32,
}

const _: () = assert!(std::mem::size_of::<DoublewriteHeader>() == HEADER_SIZE);

/// Byte offsets of the header fields, relative to the header start.
/// Bootstrap stamps fields individually through logged mini-transaction
/// writes, so the offsets are part of the format.
pub const OFF_MAGIC: usize = 0;
pub const OFF_FSEG: usize = 4;
pub const OFF_BLOCK1: usize = 14;
pub const OFF_BLOCK2: usize = 18;
pub const OFF_MAGIC_REPEAT: usize = 22;
pub const OFF_BLOCK1_REPEAT: usize = 26;
pub const OFF_BLOCK2_REPEAT: usize = 30;
pub const OFF_SPACE_IDS_STORED: usize = 34;

const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, magic) == OFF_MAGIC);
const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, fseg) == OFF_FSEG);
const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, block1) == OFF_BLOCK1);
const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, block2) == OFF_BLOCK2);
const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, magic_repeat) == OFF_MAGIC_REPEAT);
const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, block1_repeat) == OFF_BLOCK1_REPEAT);
const _: () = assert!(std::mem::offset_of!(DoublewriteHeader, block2_repeat) == OFF_BLOCK2_REPEAT);
const _: () =
    assert!(std::mem::offset_of!(DoublewriteHeader, space_ids_stored) == OFF_SPACE_IDS_STORED);

impl DoublewriteHeader {
    /// A fully stamped header for a freshly allocated area.
    pub fn new(block1: u32, block2: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            fseg: [0u8; 10],
            block1: U32::new(block1),
            block2: U32::new(block2),
            magic_repeat: U32::new(MAGIC),
            block1_repeat: U32::new(block1),
            block2_repeat: U32::new(block2),
            space_ids_stored: U32::new(SPACE_IDS_STORED),
        }
    }

    /// Overlays the header on a byte slice without copying. The bytes may
    /// be anything (detection reads headers that were never written), so
    /// this validates length only; see [`Self::is_valid`].
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "buffer too small for DoublewriteHeader: {} < {}",
            bytes.len(),
            HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse DoublewriteHeader: {:?}", e))
    }

    /// Owned copy of the header read out of a buffer.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        Ok(*Self::from_bytes(bytes)?)
    }

    /// The area exists iff both magic copies carry the magic value.
    pub fn is_valid(&self) -> bool {
        self.magic.get() == MAGIC && self.magic_repeat.get() == MAGIC
    }

    /// Whether staged pages carry tablespace ids. Areas written by engines
    /// that predate multiple tablespaces answer false and are upgraded by
    /// the recovery loader.
    pub fn space_ids_current(&self) -> bool {
        self.space_ids_stored.get() == SPACE_IDS_STORED
    }

    zerocopy_getters! {
        block1: u32,
        block2: u32,
        space_ids_stored: u32,
    }
}
