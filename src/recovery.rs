//! # Crash Recovery
//!
//! Two startup-path entry points, run before the engine accepts writes:
//!
//! 1. [`load_staged_pages`]: reads both staging blocks out of the system
//!    tablespace through a direct file handle (the tablespace layer is
//!    not up yet) and returns the staged page images.
//! 2. [`repair`]: for every staged page, reads the page's home location
//!    and rewrites it from the staged copy when the home copy is torn or
//!    zero-filled.
//!
//! ## Repair case analysis
//!
//! | data-file page    | staged copy        | action                     |
//! |-------------------|--------------------|----------------------------|
//! | corrupt           | corrupt            | fatal, dump both           |
//! | corrupt           | valid              | rewrite from staged copy   |
//! | all zeros         | non-zero and valid | rewrite from staged copy   |
//! | anything else     |                    | leave untouched            |
//!
//! A staged page whose tablespace is gone, or which lies beyond the
//! tablespace's current size, is logged and skipped; dropped and shrunk
//! tablespaces legitimately orphan staged copies.
//!
//! Repair is idempotent: a rewritten page is valid, so a second pass
//! finds every target intact.
//!
//! ## Legacy areas
//!
//! Areas written before pages carried tablespace ids are upgraded in
//! place: the space-id field of every staged page is zeroed and the slot
//! written back. Upgrade mode feeds nothing to the repairer.

use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use crate::config::{BLOCK_PAGES, HEADER_OFFSET, PAGE_SIZE, SLOT_COUNT, SYS_HEADER_PAGE};
use crate::error::DblwrError;
use crate::header::DoublewriteHeader;
use crate::page;
use crate::ports::{FileIo, PageOracle, RawFile, Tablespaces};

/// Staged page images recovered from the doublewrite area.
#[derive(Debug, Default)]
pub struct StagedPages {
    pages: Vec<Box<[u8]>>,
}

impl StagedPages {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.pages.iter().map(|page| &page[..])
    }
}

/// What a repair pass did, per category.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RepairSummary {
    /// Corrupt data-file pages rewritten from their staged copies.
    pub restored: Vec<(u32, u32)>,
    /// Zero-filled data-file pages rewritten from their staged copies.
    pub restored_zero: Vec<(u32, u32)>,
    /// Staged pages whose home copies were already sound.
    pub intact: usize,
    pub skipped_unknown_space: usize,
    pub skipped_out_of_bounds: usize,
}

/// Reads the doublewrite area off the system tablespace. Returns no pages
/// when the area does not exist, or when it predates tablespace ids (the
/// area is upgraded in place instead).
pub fn load_staged_pages(file: &dyn RawFile) -> Result<StagedPages> {
    let mut sys_page = vec![0u8; PAGE_SIZE];
    file.read_at(u64::from(SYS_HEADER_PAGE) * PAGE_SIZE as u64, &mut sys_page)
        .wrap_err("failed to read the system header page")?;

    let header = DoublewriteHeader::read_from(&sys_page[HEADER_OFFSET..])?;
    if !header.is_valid() {
        debug!("no doublewrite area on disk; nothing staged to load");
        return Ok(StagedPages::default());
    }

    let mut buf = vec![0u8; SLOT_COUNT * PAGE_SIZE];
    let half = BLOCK_PAGES * PAGE_SIZE;
    file.read_at(u64::from(header.block1()) * PAGE_SIZE as u64, &mut buf[..half])
        .wrap_err("failed to read staging block 1")?;
    file.read_at(u64::from(header.block2()) * PAGE_SIZE as u64, &mut buf[half..])
        .wrap_err("failed to read staging block 2")?;

    if !header.space_ids_current() {
        info!("doublewrite area predates tablespace ids: resetting space ids in staged pages");
        for (i, frame) in buf.chunks_exact_mut(PAGE_SIZE).enumerate() {
            page::set_space_id(frame, 0);
            let slot_page = if i < BLOCK_PAGES {
                header.block1() + i as u32
            } else {
                header.block2() + (i - BLOCK_PAGES) as u32
            };
            file.write_at(u64::from(slot_page) * PAGE_SIZE as u64, frame)?;
        }
        file.flush()?;
        return Ok(StagedPages::default());
    }

    let pages = buf
        .chunks_exact(PAGE_SIZE)
        .map(|chunk| chunk.to_vec().into_boxed_slice())
        .collect();
    Ok(StagedPages { pages })
}

/// Repairs torn and zero-filled data-file pages from their staged copies,
/// then flushes every tablespace.
pub fn repair(
    staged: &StagedPages,
    io: &dyn FileIo,
    spaces: &dyn Tablespaces,
    oracle: &dyn PageOracle,
) -> Result<RepairSummary> {
    let mut summary = RepairSummary::default();
    let mut read_buf = vec![0u8; PAGE_SIZE];

    for staged_page in staged.iter() {
        match repair_page(staged_page, io, spaces, oracle, &mut read_buf) {
            Ok(PageOutcome::Intact) => summary.intact += 1,
            Ok(PageOutcome::Restored { space, page_no }) => {
                summary.restored.push((space, page_no));
            }
            Ok(PageOutcome::RestoredZero { space, page_no }) => {
                summary.restored_zero.push((space, page_no));
            }
            Err(err) => match err.downcast_ref::<DblwrError>() {
                Some(DblwrError::RecoveryUnknownTablespace { space, page_no }) => {
                    debug!(
                        space,
                        page_no, "staged page belongs to a dropped tablespace; skipping"
                    );
                    summary.skipped_unknown_space += 1;
                }
                Some(DblwrError::RecoveryOutOfBounds { space, page_no }) => {
                    warn!(
                        space,
                        page_no,
                        "a staged page is not within tablespace bounds; skipping"
                    );
                    summary.skipped_out_of_bounds += 1;
                }
                _ => return Err(err),
            },
        }
    }

    spaces.flush_all()?;
    Ok(summary)
}

enum PageOutcome {
    Intact,
    Restored { space: u32, page_no: u32 },
    RestoredZero { space: u32, page_no: u32 },
}

fn repair_page(
    staged: &[u8],
    io: &dyn FileIo,
    spaces: &dyn Tablespaces,
    oracle: &dyn PageOracle,
    read_buf: &mut Vec<u8>,
) -> Result<PageOutcome> {
    let space = page::space_id(staged);
    let page_no = page::page_no(staged);

    if !spaces.exists(space) {
        return Err(DblwrError::RecoveryUnknownTablespace { space, page_no }.into());
    }
    if !spaces.in_bounds(space, page_no) {
        return Err(DblwrError::RecoveryOutOfBounds { space, page_no }.into());
    }

    let zip = spaces.zip_size(space);
    let len = zip.unwrap_or(PAGE_SIZE);
    read_buf.resize(len, 0);
    io.read_page(space, page_no, read_buf)
        .wrap_err_with(|| format!("failed to read page {page_no} of tablespace {space}"))?;

    let staged_image = &staged[..len];

    if oracle.is_corrupted(read_buf, zip) {
        warn!(
            space,
            page_no,
            "database page corruption or a failed read; trying to recover from the doublewrite area"
        );

        if oracle.is_corrupted(staged_image, zip) {
            page::dump_frame(read_buf, "corrupt data-file page");
            page::dump_frame(staged_image, "corrupt staged copy");
            return Err(DblwrError::StagedAndTargetCorrupt { space, page_no }.into());
        }

        io.write_page(space, page_no, staged_image)?;
        info!(space, page_no, "recovered page from the doublewrite area");
        return Ok(PageOutcome::Restored { space, page_no });
    }

    if oracle.is_zeroes(read_buf, zip)
        && !oracle.is_zeroes(staged_image, zip)
        && !oracle.is_corrupted(staged_image, zip)
    {
        // The home write never happened; the page kept its freshly
        // allocated zero fill while the staged copy carries real content.
        io.write_page(space, page_no, staged_image)?;
        debug!(space, page_no, "restored zero-filled page from the doublewrite area");
        return Ok(PageOutcome::RestoredZero { space, page_no });
    }

    Ok(PageOutcome::Intact)
}
