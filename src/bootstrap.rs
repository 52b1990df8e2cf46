//! # Bootstrap
//!
//! Detects an existing doublewrite area in the system tablespace, or
//! allocates and stamps one on first boot.
//!
//! ## Creation
//!
//! The staging blocks must live at known, extent-aligned locations:
//! block 1 at page `EXTENT_PAGES`, block 2 at `2 * EXTENT_PAGES`. A fresh
//! file segment anchored in the header's fseg slot hands out pages in
//! ascending order, so the loop allocates `2B + E/2` pages: the first
//! `E/2` burn through the tail of extent 0, after which allocation is
//! extent-aligned and the block starts fall out exactly where required.
//! Every allocation past the burn-in must be contiguous with its
//! predecessor; any gap means the segment was not fresh and the area
//! cannot be trusted.
//!
//! Mini-transactions stack a page latch per allocation, and latch stacks
//! have an implementation bound, so the loop commits and restarts its
//! mini-transaction every [`BOOTSTRAP_MTX_BATCH`] allocations.
//!
//! The header magic is stamped only after every page is allocated, and
//! the outer loop re-runs detection after creating: a crash at any point
//! leaves either no valid header (the next boot re-creates from a fresh
//! segment) or a complete area, never a torn one.

use eyre::{ensure, Result};
use tracing::{debug, info};

use crate::config::{
    BLOCK_PAGES, BOOTSTRAP_MTX_BATCH, BOOTSTRAP_POOL_SLACK, EXTENT_PAGES, HEADER_FSEG_OFFSET,
    HEADER_OFFSET, HEADER_SIZE, MAGIC, PAGE_SIZE, SLOT_COUNT, SPACE_IDS_STORED,
};
use crate::error::DblwrError;
use crate::header::{
    DoublewriteHeader, OFF_BLOCK1, OFF_BLOCK1_REPEAT, OFF_BLOCK2, OFF_BLOCK2_REPEAT, OFF_MAGIC,
    OFF_MAGIC_REPEAT, OFF_SPACE_IDS_STORED,
};
use crate::ports::{MiniTx, Ports};

/// Returns the staging block locations, creating the on-disk area if the
/// header does not recognize one. Idempotent: a second call takes the
/// detect path and changes nothing.
pub(crate) fn create_or_init(ports: &Ports) -> Result<(u32, u32)> {
    loop {
        let mut mtx = ports.sys.begin()?;
        let bytes = mtx.read_sys(HEADER_OFFSET, HEADER_SIZE)?;
        let header = DoublewriteHeader::read_from(&bytes)?;

        if header.is_valid() {
            mtx.commit()?;
            debug!(
                block1 = header.block1(),
                block2 = header.block2(),
                "doublewrite area found"
            );
            return Ok((header.block1(), header.block2()));
        }

        info!("doublewrite area not found: creating new");
        create(ports, mtx)?;
    }
}

fn create<'a>(ports: &'a Ports, mut mtx: Box<dyn MiniTx + 'a>) -> Result<()> {
    let required = (SLOT_COUNT + EXTENT_PAGES / 2 + BOOTSTRAP_POOL_SLACK) * PAGE_SIZE;
    let actual = ports.buffer_pool.capacity_bytes();
    if actual < required {
        return Err(DblwrError::BootstrapInsufficientBuffer { required, actual }.into());
    }

    if !mtx.create_segment(HEADER_FSEG_OFFSET)? {
        return Err(DblwrError::BootstrapOutOfSpace.into());
    }

    let mut prev_page_no = 0u32;
    for i in 0..SLOT_COUNT + EXTENT_PAGES / 2 {
        let page_no = mtx
            .alloc_page(HEADER_FSEG_OFFSET, prev_page_no + 1)?
            .ok_or(DblwrError::BootstrapOutOfSpace)?;

        if i == EXTENT_PAGES / 2 {
            ensure!(
                page_no as usize == EXTENT_PAGES,
                "first staging block must begin at page {}, segment handed out page {}",
                EXTENT_PAGES,
                page_no
            );
            write_header_u32(&mut *mtx, OFF_BLOCK1, page_no)?;
            write_header_u32(&mut *mtx, OFF_BLOCK1_REPEAT, page_no)?;
        } else if i == EXTENT_PAGES / 2 + BLOCK_PAGES {
            ensure!(
                page_no as usize == 2 * EXTENT_PAGES,
                "second staging block must begin at page {}, segment handed out page {}",
                2 * EXTENT_PAGES,
                page_no
            );
            write_header_u32(&mut *mtx, OFF_BLOCK2, page_no)?;
            write_header_u32(&mut *mtx, OFF_BLOCK2_REPEAT, page_no)?;
        } else if i > EXTENT_PAGES / 2 {
            ensure!(
                page_no == prev_page_no + 1,
                "staging block pages must be contiguous: expected {}, got {}",
                prev_page_no + 1,
                page_no
            );
        }

        if (i + 1) % BOOTSTRAP_MTX_BATCH == 0 {
            mtx.commit()?;
            mtx = ports.sys.begin()?;
        }

        prev_page_no = page_no;
    }

    write_header_u32(&mut *mtx, OFF_MAGIC, MAGIC)?;
    write_header_u32(&mut *mtx, OFF_MAGIC_REPEAT, MAGIC)?;
    write_header_u32(&mut *mtx, OFF_SPACE_IDS_STORED, SPACE_IDS_STORED)?;
    mtx.commit()?;

    // The header pages must be durable before anything is staged over
    // them, and stale buffer-pool copies of the freshly allocated pages
    // must not shadow the on-disk state.
    ports.checkpoint.make_checkpoint()?;
    ports.buffer_pool.invalidate_all();

    info!("doublewrite area created");
    Ok(())
}

fn write_header_u32(mtx: &mut dyn MiniTx, field_offset: usize, value: u32) -> Result<()> {
    mtx.write_sys(HEADER_OFFSET + field_offset, &value.to_le_bytes())
}
