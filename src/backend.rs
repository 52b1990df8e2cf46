//! # Staging Backends
//!
//! The drain and single-page paths hand their page images to a
//! [`StageBackend`]: the component that makes the images durable somewhere
//! recoverable *before* any target write is allowed to start. Two
//! implementations exist:
//!
//! - [`BlockBackend`]: the classic pair of staging blocks inside the
//!   system tablespace (this module)
//! - `SsdBackend`: a FIFO ring on a dedicated raw file
//!   ([`crate::ssd`])
//!
//! `stage` returns only after the staged images are flushed; that return
//! is the happens-before edge every target write depends on. The token it
//! returns tells the orchestrator which pages still need target writes
//! now (`deferred` pages reach their homes later, at ring write-back) and
//! what `finalize` must unfix.

use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;

use crate::config::{BLOCK_PAGES, PAGE_SIZE, SYS_SPACE};
use crate::ports::{FileIo, PageHandle};
use crate::staging::DrainedBatch;

/// What staging left behind for the orchestrator.
pub(crate) struct StageToken {
    /// Per-page flags, parallel to the staged batch: true when the page's
    /// home write is deferred to write-back and the page must be completed
    /// immediately. Empty means no page is deferred.
    pub(crate) deferred: Vec<bool>,
    /// SSD metadata entries whose `io_fix` must drop back to `None` in
    /// [`StageBackend::finalize`].
    pub(crate) touched: SmallVec<[usize; 16]>,
}

impl StageToken {
    pub(crate) fn passthrough() -> Self {
        Self {
            deferred: Vec::new(),
            touched: SmallVec::new(),
        }
    }

    pub(crate) fn is_deferred(&self, index: usize) -> bool {
        self.deferred.get(index).copied().unwrap_or(false)
    }
}

pub(crate) trait StageBackend: Send + Sync {
    /// Durably persists every image of a drained batch.
    fn stage(&self, batch: &DrainedBatch) -> Result<StageToken>;

    /// Durably persists a single page occupying staging slot `slot`.
    /// `staged` is the padded image for compressed pages; uncompressed
    /// frames are taken from the handle.
    fn stage_single(
        &self,
        slot: usize,
        handle: &PageHandle,
        staged: Option<&[u8]>,
    ) -> Result<StageToken>;

    /// Releases backend bookkeeping once target handling is decided.
    fn finalize(&self, token: StageToken) -> Result<()>;
}

/// The on-tablespace backend: two runs of [`BLOCK_PAGES`] pages whose
/// locations were pinned at bootstrap.
pub(crate) struct BlockBackend {
    io: Arc<dyn FileIo>,
    block1: u32,
    block2: u32,
}

impl BlockBackend {
    pub(crate) fn new(io: Arc<dyn FileIo>, block1: u32, block2: u32) -> Self {
        Self { io, block1, block2 }
    }

    /// Staging-block page number backing slot `slot` of the staging area.
    pub(crate) fn slot_page(&self, slot: usize) -> u32 {
        if slot < BLOCK_PAGES {
            self.block1 + slot as u32
        } else {
            self.block2 + (slot - BLOCK_PAGES) as u32
        }
    }

    /// Writes one staged image into its block slot. Shared with the SSD
    /// backend, whose compressed pages keep the classic path.
    pub(crate) fn write_slot(&self, slot: usize, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        self.io.write_page(SYS_SPACE, self.slot_page(slot), image)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.io.flush(SYS_SPACE)
    }
}

impl StageBackend for BlockBackend {
    fn stage(&self, batch: &DrainedBatch) -> Result<StageToken> {
        // Batch slot i of the drain snapshot is block slot i on disk.
        for (i, image) in batch.images.chunks_exact(PAGE_SIZE).enumerate() {
            self.write_slot(i, image)?;
        }
        self.flush()?;
        Ok(StageToken::passthrough())
    }

    fn stage_single(
        &self,
        slot: usize,
        handle: &PageHandle,
        staged: Option<&[u8]>,
    ) -> Result<StageToken> {
        match staged {
            Some(image) => self.write_slot(slot, image)?,
            None => self.write_slot(slot, &handle.frame()[..])?,
        }
        self.flush()?;
        Ok(StageToken::passthrough())
    }

    fn finalize(&self, _token: StageToken) -> Result<()> {
        Ok(())
    }
}
