//! # Doublewrite Orchestrator
//!
//! [`Doublewrite`] ties the staging state machine, the staging backend,
//! and the collaborator ports together into the three operations the
//! flusher layer calls:
//!
//! - [`post_batch`](Doublewrite::post_batch): queue a page into the batch
//!   region (auto-draining when it fills)
//! - [`flush_buffered`](Doublewrite::flush_buffered): drain the batch
//!   region to the staging medium, then fan out the target writes
//! - [`write_single`](Doublewrite::write_single): stage-and-write one page
//!   end to end, for latency-sensitive evictions
//!
//! ## The ordering crux
//!
//! ```text
//!  post ──► copy into write_buf ──► stage (write + FSYNC) ──► target
//!  writes (async) ──► completions ──► final flush-all ──► region reset
//! ```
//!
//! No target write for a page is issued before the stage write of its
//! batch has been flushed; recovery depends on nothing else. Completions
//! arrive from the I/O layer via the closures handed to
//! `write_page_async`; the last batch completion performs the final
//! cross-tablespace flush before the region reopens.
//!
//! ## Deadlock contract
//!
//! `flush_buffered` must be called after posting a batch, and before
//! blocking on a page latch that another thread might hold while itself
//! waiting for staging space. The page cleaner posting pages and a latch
//! holder waiting out a drain otherwise deadlock through the full batch
//! region.
//!
//! ## Disabled mode
//!
//! With `Config::enabled == false` the staging area is bypassed: posts
//! become direct asynchronous target writes and `flush_buffered`
//! degrades to wake-pump, wait-for-pending, flush-all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use tracing::error;

use crate::backend::{BlockBackend, StageBackend};
use crate::bootstrap;
use crate::config::{Config, BLOCK_PAGES, PAGE_SIZE};
use crate::page;
use crate::ports::{Completion, PageHandle, Ports};
use crate::ssd::{SsdBackend, SsdCache};
use crate::staging::{BatchPost, BatchRelease, DrainStart, DrainedBatch, SinglePost, Staging};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushKind {
    Batch,
    Single,
}

#[derive(Default)]
struct Stats {
    pages_written: AtomicU64,
    batches: AtomicU64,
    single_writes: AtomicU64,
}

/// Point-in-time copy of the flush counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Pages that went through staging, batch and single combined.
    pub pages_written: u64,
    /// Batch drains performed.
    pub batches: u64,
    /// Single-page writes performed.
    pub single_writes: u64,
}

struct Inner {
    config: Config,
    ports: Ports,
    staging: Staging,
    backend: Box<dyn StageBackend>,
    ssd: Option<Arc<SsdCache>>,
    block1: u32,
    block2: u32,
    stats: Stats,
}

/// The doublewrite subsystem. Clones share one instance; pass clones to
/// every flusher thread rather than reaching for ambient state.
#[derive(Clone)]
pub struct Doublewrite {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Doublewrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doublewrite").finish_non_exhaustive()
    }
}

impl Doublewrite {
    /// Detects or creates the on-disk area (see [`crate::bootstrap`]) and
    /// initializes the in-memory staging state. Idempotent across
    /// restarts: after the first boot this only reads the header back.
    pub fn init(ports: Ports, config: Config) -> Result<Self> {
        config.validate()?;

        let (block1, block2) = bootstrap::create_or_init(&ports)?;
        let staging = Staging::new(config.batch_slots);
        let blocks = BlockBackend::new(ports.io.clone(), block1, block2);

        let (backend, ssd): (Box<dyn StageBackend>, Option<Arc<SsdCache>>) =
            match &config.ssd_cache {
                None => (Box::new(blocks), None),
                Some(ssd_config) => {
                    let cache = Arc::new(SsdCache::open(ssd_config)?);
                    let backend = SsdBackend::new(
                        Arc::clone(&cache),
                        blocks,
                        ports.io.clone(),
                        ssd_config.defer_target_writes,
                    );
                    (Box::new(backend), Some(cache))
                }
            };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ports,
                staging,
                backend,
                ssd,
                block1,
                block2,
                stats: Stats::default(),
            }),
        })
    }

    pub fn block1(&self) -> u32 {
        self.inner.block1
    }

    pub fn block2(&self) -> u32 {
        self.inner.block2
    }

    /// Whether a system-tablespace page number falls inside either
    /// staging block. The file layer consults this to keep ordinary page
    /// writes out of the staging region.
    pub fn page_inside(&self, page_no: u32) -> bool {
        let block = BLOCK_PAGES as u32;
        (page_no >= self.inner.block1 && page_no < self.inner.block1 + block)
            || (page_no >= self.inner.block2 && page_no < self.inner.block2 + block)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            pages_written: stats.pages_written.load(Ordering::Relaxed),
            batches: stats.batches.load(Ordering::Relaxed),
            single_writes: stats.single_writes.load(Ordering::Relaxed),
        }
    }

    /// The SSD staging ring, when configured.
    pub fn ssd_cache(&self) -> Option<&SsdCache> {
        self.inner.ssd.as_deref()
    }

    /// Posts a page for batched flushing. Blocks while a drain runs or
    /// the batch region is full; filling the last slot triggers an
    /// automatic drain before returning.
    pub fn post_batch(&self, handle: &PageHandle) -> Result<()> {
        let inner = &self.inner;

        if !inner.config.enabled {
            return inner
                .ports
                .io
                .write_page_async(handle, Box::new(|| {}));
        }

        inner.validate_before_stage(handle);

        loop {
            match inner.staging.try_post_batch(handle) {
                BatchPost::Posted { region_full } => {
                    if region_full {
                        self.flush_buffered()?;
                    }
                    return Ok(());
                }
                BatchPost::Busy { captured } => inner.staging.batch_event.wait_low(captured),
                BatchPost::Full => self.flush_buffered()?,
            }
        }
    }

    /// Drains the batch region: stages every posted page durably, then
    /// issues their asynchronous target writes. Call after posting a
    /// batch, and before waiting on any page latch (see the module doc).
    pub fn flush_buffered(&self) -> Result<()> {
        let inner = &self.inner;

        if !inner.config.enabled {
            return inner.sync_datafiles();
        }

        loop {
            match inner.staging.begin_drain() {
                DrainStart::Empty => return Ok(()),
                DrainStart::Busy { captured } => inner.staging.batch_event.wait_low(captured),
                DrainStart::Started(batch) => return self.run_batch(batch),
            }
        }
    }

    /// Stages and writes one page outside any batch. With `sync` the call
    /// returns only after the page is durably in its home location;
    /// otherwise the completion handler finishes the write.
    pub fn write_single(&self, handle: &PageHandle, sync: bool) -> Result<()> {
        let inner = &self.inner;

        if !inner.config.enabled {
            if sync {
                inner.write_home_sync(handle)?;
                return inner.ports.io.flush(handle.space());
            }
            return inner
                .ports
                .io
                .write_page_async(handle, Box::new(|| {}));
        }

        inner.validate_before_stage(handle);

        let (slot, staged) = loop {
            match inner.staging.try_reserve_single(handle) {
                SinglePost::Reserved { slot, staged } => break (slot, staged),
                SinglePost::Full { captured } => inner.staging.single_event.wait_low(captured),
            }
        };

        let token = inner.backend.stage_single(slot, handle, staged.as_deref())?;

        inner.stats.single_writes.fetch_add(1, Ordering::Relaxed);
        inner.stats.pages_written.fetch_add(1, Ordering::Relaxed);

        let deferred = token.is_deferred(0);
        inner.backend.finalize(token)?;

        if deferred {
            // The ring holds the page; its home write happens at
            // write-back time.
            return inner.complete(handle, FlushKind::Single);
        }

        if sync {
            inner.write_home_sync(handle)?;
            inner.ports.io.flush(handle.space())?;
            inner.complete(handle, FlushKind::Single)
        } else {
            let completion = completion_for(inner, handle, FlushKind::Single);
            inner.ports.io.write_page_async(handle, completion)?;
            inner.ports.io.wake_io_threads();
            Ok(())
        }
    }

    /// Verifies the subsystem is quiescent. Call after the flushers have
    /// stopped and before dropping the last clone.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ports.io.wait_until_no_pending_writes()?;

        let (first_free, b_reserved, s_reserved, batch_running) = inner.staging.counters();
        ensure!(
            !batch_running && first_free == 0 && b_reserved == 0 && s_reserved == 0,
            "doublewrite closed with work in flight: first_free={}, b_reserved={}, s_reserved={}, batch_running={}",
            first_free,
            b_reserved,
            s_reserved,
            batch_running
        );

        if let Some(ssd) = &inner.ssd {
            ensure!(
                ssd.quiesced(),
                "ssd staging ring closed with fixed entries"
            );
        }
        Ok(())
    }

    fn run_batch(&self, batch: DrainedBatch) -> Result<()> {
        let inner = &self.inner;

        // Corruption tripwire: both the live frame and the staged image
        // must carry coherent LSN stamps before any of this reaches disk.
        for (i, handle) in batch.handles.iter().enumerate() {
            let image = &batch.images[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            inner.check_batch_page(handle, image);
        }

        let token = inner.backend.stage(&batch)?;

        inner.stats.batches.fetch_add(1, Ordering::Relaxed);
        inner
            .stats
            .pages_written
            .fetch_add(batch.handles.len() as u64, Ordering::Relaxed);

        let deferred: Vec<bool> = (0..batch.handles.len())
            .map(|i| token.is_deferred(i))
            .collect();
        inner.backend.finalize(token)?;

        for (i, handle) in batch.handles.iter().enumerate() {
            if deferred[i] {
                inner.complete(handle, FlushKind::Batch)?;
            } else {
                let completion = completion_for(inner, handle, FlushKind::Batch);
                inner.ports.io.write_page_async(handle, completion)?;
            }
        }
        inner.ports.io.wake_io_threads();
        Ok(())
    }
}

impl Inner {
    /// The completion handler: releases the page's staging slot; the last
    /// batch release performs the final cross-tablespace flush before the
    /// region reopens.
    fn complete(&self, handle: &PageHandle, kind: FlushKind) -> Result<()> {
        match kind {
            FlushKind::Batch => match self.staging.release_batch_one() {
                BatchRelease::InFlight => Ok(()),
                BatchRelease::BatchDone => {
                    self.ports.spaces.flush_all()?;
                    self.staging.finish_batch();
                    Ok(())
                }
            },
            FlushKind::Single => {
                self.staging.release_single(handle);
                Ok(())
            }
        }
    }

    /// Pre-stage validation of an uncompressed file page: coherent LSN
    /// stamps, and structural sanity when the page is flagged for it. A
    /// failure here means corruption is about to be made durable; the
    /// process stops instead.
    fn validate_before_stage(&self, handle: &PageHandle) {
        if !handle.is_file_page() || handle.zip_size().is_some() {
            return;
        }

        let frame = handle.frame();
        if !page::lsn_stamps_match(&frame) {
            page::dump_frame(&frame, "pre-stage LSN stamp mismatch");
            error!(
                space = handle.space(),
                page_no = handle.page_no(),
                "page to be written has mismatched LSN stamps; crashing before it reaches disk"
            );
            panic!(
                "doublewrite: refusing to stage corrupt page (space {}, page {})",
                handle.space(),
                handle.page_no()
            );
        }

        if handle.check_on_flush() && !self.ports.oracle.validate_index_page(&frame) {
            page::dump_frame(&frame, "pre-stage index validation failure");
            error!(
                space = handle.space(),
                page_no = handle.page_no(),
                "index page fails structural validation; crashing before it reaches disk"
            );
            panic!(
                "doublewrite: refusing to stage structurally invalid index page (space {}, page {})",
                handle.space(),
                handle.page_no()
            );
        }
    }

    fn check_batch_page(&self, handle: &PageHandle, image: &[u8]) {
        // A handle the buffer pool invalidated since posting carries no
        // trustworthy frame; the staged image was validated at post time.
        if !handle.is_file_page() || handle.zip_size().is_some() {
            return;
        }

        self.validate_before_stage(handle);

        if !page::lsn_stamps_match(image) {
            page::dump_frame(image, "staged image LSN stamp mismatch");
            panic!(
                "doublewrite: staged copy of page (space {}, page {}) is torn in memory",
                handle.space(),
                handle.page_no()
            );
        }
    }

    fn write_home_sync(&self, handle: &PageHandle) -> Result<()> {
        match handle.zip_data() {
            Some(zip) => self
                .ports
                .io
                .write_page(handle.space(), handle.page_no(), zip),
            None => {
                let frame = handle.frame();
                self.ports
                    .io
                    .write_page(handle.space(), handle.page_no(), &frame[..])
            }
        }
    }

    /// Disabled-mode flush: push queued writes through and sync every
    /// tablespace.
    fn sync_datafiles(&self) -> Result<()> {
        self.ports.io.wake_io_threads();
        self.ports.io.wait_until_no_pending_writes()?;
        self.ports.spaces.flush_all()
    }
}

/// Builds the completion closure the I/O layer invokes when a target
/// write finishes. A completion has no caller to report to; failure of
/// the release path is fatal.
fn completion_for(inner: &Arc<Inner>, handle: &PageHandle, kind: FlushKind) -> Completion {
    let inner = Arc::clone(inner);
    let handle = handle.clone();
    Box::new(move || {
        if let Err(err) = inner.complete(&handle, kind) {
            error!(
                space = handle.space(),
                page_no = handle.page_no(),
                ?kind,
                ?err,
                "doublewrite completion failed"
            );
            panic!("doublewrite: completion failed: {err:#}");
        }
    })
}
