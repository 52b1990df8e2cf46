//! # Page Frame Layout
//!
//! This module defines the byte layout the doublewrite subsystem relies on
//! when it inspects raw page frames: recovery reads page identities out of
//! staged images, and the flush paths cross-check the two LSN stamps before
//! letting a page reach disk.
//!
//! ## Frame Header Layout
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       4     checksum   Legacy header checksum slot (unused here)
//! 4       4     page_no    Page number within its tablespace
//! 8       8     reserved   Prev/next links of the owning structure
//! 16      8     lsn        LSN of the newest modification
//! 24      2     page_type  Page type tag (index, allocated, ...)
//! 26      8     reserved
//! 34      4     space_id   Owning tablespace id
//! 38      ...   payload
//! ```
//!
//! ## Frame Trailer (last 8 bytes)
//!
//! ```text
//! len-8   4     checksum   CRC-32 over frame[..len-8]
//! len-4   4     lsn_echo   Low 32 bits of the header LSN
//! ```
//!
//! The trailer repeats the low half of the header LSN. A page whose header
//! and trailer stamps disagree was torn mid-write: the head of the frame
//! reached disk but the tail did not. This is the detection primitive both
//! the pre-stage tripwire and the recovery repairer build on.
//!
//! Compressed page images use the same trailer layout within their own
//! (smaller) physical size.
//!
//! All multi-byte fields are little-endian.

use crc::{Crc, CRC_32_ISCSI};
use tracing::error;

use crate::config::{PAGE_SIZE, PAGE_TRAILER_SIZE};
use crate::ports::PageOracle;

pub const OFF_PAGE_NO: usize = 4;
pub const OFF_LSN: usize = 16;
pub const OFF_PAGE_TYPE: usize = 24;
pub const OFF_SPACE_ID: usize = 34;

/// First payload byte after the frame header.
pub const OFF_PAGE_DATA: usize = 38;

pub const PAGE_TYPE_ALLOCATED: u16 = 0;
pub const PAGE_TYPE_INDEX: u16 = 2;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

#[inline]
pub fn page_no(frame: &[u8]) -> u32 {
    read_u32(frame, OFF_PAGE_NO)
}

#[inline]
pub fn space_id(frame: &[u8]) -> u32 {
    read_u32(frame, OFF_SPACE_ID)
}

#[inline]
pub fn set_space_id(frame: &mut [u8], space: u32) {
    frame[OFF_SPACE_ID..OFF_SPACE_ID + 4].copy_from_slice(&space.to_le_bytes());
}

#[inline]
pub fn page_lsn(frame: &[u8]) -> u64 {
    u64::from_le_bytes(frame[OFF_LSN..OFF_LSN + 8].try_into().unwrap())
}

#[inline]
pub fn page_type(frame: &[u8]) -> u16 {
    read_u16(frame, OFF_PAGE_TYPE)
}

/// Whether the header LSN and the trailer LSN echo agree. A mismatch means
/// the frame was torn: its head and tail come from different writes.
pub fn lsn_stamps_match(buf: &[u8]) -> bool {
    let len = buf.len();
    let header_low = read_u32(buf, OFF_LSN);
    let trailer_low = read_u32(buf, len - 4);
    header_low == trailer_low
}

pub fn compute_page_checksum(buf: &[u8]) -> u32 {
    CRC32.checksum(&buf[..buf.len() - PAGE_TRAILER_SIZE])
}

pub fn stored_page_checksum(buf: &[u8]) -> u32 {
    read_u32(buf, buf.len() - PAGE_TRAILER_SIZE)
}

/// Initializes the identity fields of a fresh frame.
pub fn init_page(frame: &mut [u8], space: u32, no: u32, ptype: u16) {
    frame[OFF_PAGE_NO..OFF_PAGE_NO + 4].copy_from_slice(&no.to_le_bytes());
    frame[OFF_PAGE_TYPE..OFF_PAGE_TYPE + 2].copy_from_slice(&ptype.to_le_bytes());
    set_space_id(frame, space);
}

/// Stamps both LSN copies and the trailer checksum; the final step of
/// preparing a frame image for disk.
pub fn seal_page(buf: &mut [u8], lsn: u64) {
    let len = buf.len();
    buf[OFF_LSN..OFF_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    buf[len - 4..].copy_from_slice(&(lsn as u32).to_le_bytes());
    let checksum = compute_page_checksum(buf);
    buf[len - PAGE_TRAILER_SIZE..len - 4].copy_from_slice(&checksum.to_le_bytes());
}

pub fn is_zeroes(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Structural sanity of an index page: the slot directory recorded in the
/// payload header must fit inside the frame.
pub fn validate_index_page(frame: &[u8]) -> bool {
    if frame.len() != PAGE_SIZE || page_type(frame) != PAGE_TYPE_INDEX {
        return false;
    }
    let cell_count = read_u16(frame, OFF_PAGE_DATA) as usize;
    let free_start = read_u16(frame, OFF_PAGE_DATA + 2) as usize;
    let directory_end = OFF_PAGE_DATA + 4 + cell_count * 2;
    directory_end <= free_start && free_start <= PAGE_SIZE - PAGE_TRAILER_SIZE
}

/// Logs a diagnostic dump of a frame. Used on the fatal paths so the
/// operator sees what was about to reach (or came off) the disk.
pub fn dump_frame(buf: &[u8], context: &str) {
    let len = buf.len();
    error!(
        context,
        space = space_id(buf),
        page_no = page_no(buf),
        page_type = page_type(buf),
        lsn = page_lsn(buf),
        trailer_lsn_low = read_u32(buf, len - 4),
        stored_checksum = stored_page_checksum(buf),
        computed_checksum = compute_page_checksum(buf),
        head = ?&buf[..32.min(len)],
        "page dump"
    );
}

/// Default [`PageOracle`]: CRC-32 trailer checksum plus the LSN echo.
///
/// An all-zero image is never corrupt (a zero-filled page is an allocation
/// artifact, handled separately by the repairer). Embedders with their own
/// checksum schemes supply their own oracle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrcPageOracle;

impl PageOracle for CrcPageOracle {
    fn is_corrupted(&self, buf: &[u8], zip_size: Option<usize>) -> bool {
        let len = zip_size.unwrap_or(PAGE_SIZE);
        let buf = &buf[..len];
        if is_zeroes(buf) {
            return false;
        }
        if zip_size.is_none() && !lsn_stamps_match(buf) {
            return true;
        }
        stored_page_checksum(buf) != compute_page_checksum(buf)
    }

    fn is_zeroes(&self, buf: &[u8], zip_size: Option<usize>) -> bool {
        is_zeroes(&buf[..zip_size.unwrap_or(PAGE_SIZE)])
    }

    fn validate_index_page(&self, frame: &[u8]) -> bool {
        validate_index_page(frame)
    }
}
