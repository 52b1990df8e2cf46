//! # SSD Staging Ring
//!
//! An alternative staging backend: instead of the two small blocks inside
//! the system tablespace, staged pages land in a large FIFO ring on a
//! dedicated raw file. Hot pages get a second chance to stay in the ring
//! across eviction passes, amortizing the double-write cost; cold valid
//! pages are written back to their home tablespaces when their slot is
//! reclaimed.
//!
//! ## Structure
//!
//! ```text
//!            ring file (C page slots)
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!   │ 0  │ 1  │ 2  │ .. │    │    │    │C-1 │
//!   └────┴────┴────┴────┴────┴────┴────┴────┘
//!                  ▲
//!              free_idx ── advances monotonically, wraps mod C
//!
//!   meta[i]   per-slot metadata: {space, page_no, lsn, flags,
//!             ssd_offset, ref_count, io_fix}, each behind its own mutex
//!   hash      (space, page_no) -> slot, behind one RwLock
//!   cursor    {free_idx, wrapped}, behind one RwLock
//! ```
//!
//! ## Insertion of `n` pages
//!
//! 1. Under the cursor lock, scan forward from `free_idx`. A slot whose
//!    entry is `VALID|REF` is granted a second chance (`GSC`); the scan
//!    stops once it has seen `n` slots that were not granted one. The
//!    window `[first, first+total)` is claimed and `free_idx` advances.
//! 2. The claimed window is read back from the ring (skipping parts never
//!    written on the first lap) and a new window image is assembled:
//!    second-chance survivors first, then the `n` incoming pages.
//!    Survivors are re-homed to their new slots; displaced valid entries
//!    are written back to their home tablespaces and dropped from the
//!    hash.
//! 3. The window image is written to the ring (two writes when it wraps)
//!    and flushed; only then is the insertion durable.
//!
//! Slot metadata is re-assigned strictly in window order, and the `j`-th
//! survivor moves to window position `j <= p` where `p` is the position it
//! was found at, so a re-home never clobbers an unprocessed slot.
//!
//! ## Write-back state machine
//!
//! `VALID -> VALID|WB` (intent), wait for the entry's `io_fix` to drain to
//! `None`, write the page home synchronously, then under the hash write
//! lock clear `VALID` and remove the key. A concurrent writer that
//! invalidated the entry first turns the write-back into a no-op.
//!
//! ## Locks
//!
//! The cursor lock serializes window reservation; the hash lock serializes
//! index mutation; each entry's mutex guards its `io_fix`. Waits for
//! in-flight I/O spin with short sleeps ([`SSD_IO_POLL`]) and never hold
//! another lock while sleeping.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, info, trace};

use crate::backend::{BlockBackend, StageBackend, StageToken};
use crate::config::{SsdCacheConfig, PAGE_SIZE, SSD_IO_POLL};
use crate::ports::{FileIo, FsFile, PageHandle, RawFile};
use crate::staging::DrainedBatch;

const VALID: u8 = 1 << 0;
const DIRTY: u8 = 1 << 1;
const REF: u8 = 1 << 2;
const GSC: u8 = 1 << 3;
const WB: u8 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoFix {
    None,
    Read,
    Write,
}

#[derive(Debug)]
struct MetaEntry {
    space: u32,
    page_no: u32,
    lsn: u64,
    flags: u8,
    ssd_offset: usize,
    ref_count: u32,
    io_fix: IoFix,
}

impl MetaEntry {
    fn empty() -> Self {
        Self {
            space: 0,
            page_no: 0,
            lsn: 0,
            flags: 0,
            ssd_offset: 0,
            ref_count: 0,
            io_fix: IoFix::None,
        }
    }

    #[inline]
    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

struct FreeCursor {
    free_idx: usize,
    wrapped: bool,
}

/// Result of one batch insertion, for the caller's bookkeeping and for
/// test observation.
#[derive(Debug)]
pub struct InsertOutcome {
    /// First slot of the claimed window.
    pub first: usize,
    /// Window length: incoming pages plus second-chance survivors.
    pub total: usize,
    pub second_chances: usize,
    pub write_backs: usize,
    /// Slots whose `io_fix` the caller must drop once target handling for
    /// the batch is decided.
    pub(crate) touched: SmallVec<[usize; 16]>,
}

pub struct SsdCache {
    size: usize,
    file: Box<dyn RawFile>,
    meta: Box<[Mutex<MetaEntry>]>,
    cursor: RwLock<FreeCursor>,
    hash: RwLock<HashMap<(u32, u32), usize>>,
    second_chances: AtomicU64,
    write_backs: AtomicU64,
}

impl SsdCache {
    pub fn open(config: &SsdCacheConfig) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)
            .wrap_err_with(|| format!("failed to open ssd cache file at {:?}", config.path))?;
        file.set_len((config.size * PAGE_SIZE) as u64)
            .wrap_err("failed to size ssd cache file")?;

        info!(path = ?config.path, pages = config.size, "ssd staging ring opened");
        Ok(Self::with_file(Box::new(FsFile::new(file)), config.size))
    }

    /// Builds the ring over an already-open file; the unit tests drive the
    /// ring through an in-memory [`RawFile`].
    pub fn with_file(file: Box<dyn RawFile>, size: usize) -> Self {
        assert!(size > 0, "ssd cache must hold at least one page");
        let meta = (0..size)
            .map(|_| Mutex::new(MetaEntry::empty()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            size,
            file,
            meta,
            cursor: RwLock::new(FreeCursor {
                free_idx: 0,
                wrapped: false,
            }),
            hash: RwLock::new(HashMap::new()),
            second_chances: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_idx(&self) -> usize {
        self.cursor.read().free_idx
    }

    /// True once the free index has lapped the ring at least once.
    pub fn wrapped(&self) -> bool {
        self.cursor.read().wrapped
    }

    pub fn second_chance_count(&self) -> u64 {
        self.second_chances.load(Ordering::Relaxed)
    }

    pub fn write_back_count(&self) -> u64 {
        self.write_backs.load(Ordering::Relaxed)
    }

    pub fn contains(&self, space: u32, page_no: u32) -> bool {
        self.hash.read().contains_key(&(space, page_no))
    }

    /// Ring slot currently holding `(space, page_no)`, if cached.
    pub fn slot_of(&self, space: u32, page_no: u32) -> Option<usize> {
        self.hash.read().get(&(space, page_no)).copied()
    }

    /// Read-path access marking: a hit sets the `REF` bit that earns the
    /// entry its second chance at the next eviction pass.
    pub fn mark_referenced(&self, space: u32, page_no: u32) -> bool {
        let Some(idx) = self.slot_of(space, page_no) else {
            return false;
        };
        let mut entry = self.meta[idx].lock();
        if !entry.has(VALID) || entry.space != space || entry.page_no != page_no {
            return false;
        }
        entry.flags |= REF;
        entry.ref_count += 1;
        true
    }

    /// Serves a page out of the ring. Returns false on a miss or when the
    /// entry is mid-rewrite (the caller falls back to the tablespace).
    pub fn read_page(&self, space: u32, page_no: u32, out: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        let Some(idx) = self.slot_of(space, page_no) else {
            return Ok(false);
        };

        let slot = {
            let mut entry = self.meta[idx].lock();
            if !entry.has(VALID)
                || entry.space != space
                || entry.page_no != page_no
                || entry.io_fix != IoFix::None
            {
                return Ok(false);
            }
            entry.io_fix = IoFix::Read;
            entry.flags |= REF;
            entry.ref_count += 1;
            entry.ssd_offset
        };

        let res = self.file.read_at((slot * PAGE_SIZE) as u64, out);
        self.meta[idx].lock().io_fix = IoFix::None;
        res?;
        Ok(true)
    }

    /// Raw slot read, used by tests to observe relocations.
    pub fn read_slot(&self, slot: usize, out: &mut [u8]) -> Result<()> {
        ensure!(slot < self.size, "slot {} out of ring bounds {}", slot, self.size);
        self.file.read_at((slot * PAGE_SIZE) as u64, out)
    }

    /// Inserts a batch of `handles.len()` normal-sized pages whose staged
    /// images lie concatenated in `images`. Displaced valid pages are
    /// written back through `io`. On return the ring content is durable;
    /// the caller must still [`unfix`](Self::unfix) the touched slots.
    pub(crate) fn insert_batch(
        &self,
        handles: &[PageHandle],
        images: &[u8],
        io: &dyn FileIo,
    ) -> Result<InsertOutcome> {
        let n = handles.len();
        ensure!(n > 0, "empty ssd cache insertion");
        debug_assert_eq!(images.len(), n * PAGE_SIZE);

        // Claim a window: [first, first + total), where total covers the
        // incoming pages plus every survivor granted a second chance.
        let (first, total, gsc, was_wrapped) = {
            let mut cursor = self.cursor.write();
            let first = cursor.free_idx;
            let mut scanned = 0usize;
            let mut gsc = 0usize;
            loop {
                ensure!(
                    scanned < self.size,
                    "ssd cache of {} pages cannot absorb a batch of {} (every other slot is referenced)",
                    self.size,
                    n
                );
                let idx = (first + scanned) % self.size;
                let mut entry = self.meta[idx].lock();
                if entry.has(VALID) && entry.has(REF) {
                    entry.flags |= GSC;
                    gsc += 1;
                }
                drop(entry);
                scanned += 1;
                if scanned - gsc == n {
                    break;
                }
            }

            let was_wrapped = cursor.wrapped;
            if first + scanned >= self.size {
                cursor.wrapped = true;
            }
            cursor.free_idx = (first + scanned) % self.size;
            (first, scanned, gsc, was_wrapped)
        };

        trace!(first, total, gsc, n, "ssd ring window claimed");

        let window = self.read_window(first, total, was_wrapped)?;

        // Assemble the new window image: survivors first, then the
        // incoming pages; write back displaced valid entries as we go.
        let mut out = vec![0u8; total * PAGE_SIZE];
        let mut survivor = 0usize;
        let mut write_backs = 0usize;
        for pos in 0..total {
            let idx = (first + pos) % self.size;
            let (flags, space, page_no, lsn) = {
                let entry = self.meta[idx].lock();
                (entry.flags, entry.space, entry.page_no, entry.lsn)
            };

            let image = &window[pos * PAGE_SIZE..(pos + 1) * PAGE_SIZE];
            if flags & (VALID | REF | GSC) == VALID | REF | GSC {
                debug!(space, page_no, from = idx, "second chance granted");
                out[survivor * PAGE_SIZE..(survivor + 1) * PAGE_SIZE].copy_from_slice(image);
                self.install_entry(space, page_no, lsn, (first + survivor) % self.size)?;
                survivor += 1;
            } else if flags & VALID != 0 {
                if self.write_back(idx, image, io)? {
                    write_backs += 1;
                }
            }
        }
        debug_assert_eq!(survivor, gsc);

        for (j, handle) in handles.iter().enumerate() {
            let pos = gsc + j;
            out[pos * PAGE_SIZE..(pos + 1) * PAGE_SIZE]
                .copy_from_slice(&images[j * PAGE_SIZE..(j + 1) * PAGE_SIZE]);
            self.install_entry(
                handle.space(),
                handle.page_no(),
                handle.lsn(),
                (first + pos) % self.size,
            )?;
        }

        self.write_window(first, total, &out)?;
        self.file.flush()?;

        self.second_chances.fetch_add(gsc as u64, Ordering::Relaxed);
        self.write_backs
            .fetch_add(write_backs as u64, Ordering::Relaxed);

        let touched = (0..total)
            .map(|pos| (first + pos) % self.size)
            .collect::<SmallVec<[usize; 16]>>();

        Ok(InsertOutcome {
            first,
            total,
            second_chances: gsc,
            write_backs,
            touched,
        })
    }

    /// Drops the write fix on every slot of a completed insertion window.
    pub(crate) fn unfix(&self, touched: &[usize]) {
        for &idx in touched {
            self.meta[idx].lock().io_fix = IoFix::None;
        }
    }

    /// Re-creates slot `meta_idx` for `(space, page_no)`: a fresh entry
    /// fixed for write, any prior hash mapping of the same key evicted.
    fn install_entry(&self, space: u32, page_no: u32, lsn: u64, meta_idx: usize) -> Result<()> {
        {
            let mut entry = self.meta[meta_idx].lock();
            *entry = MetaEntry {
                space,
                page_no,
                lsn,
                flags: DIRTY | VALID,
                ssd_offset: meta_idx,
                ref_count: 0,
                io_fix: IoFix::None,
            };
        }

        let key = (space, page_no);
        loop {
            let old = self.hash.read().get(&key).copied();
            let Some(old) = old else { break };
            if old == meta_idx {
                break;
            }

            // An older copy of this page lives elsewhere in the ring; it
            // must leave the hash before the new slot goes in. Readers fix
            // the entry while they copy it out, so wait for them.
            let fix = self.meta[old].lock().io_fix;
            if fix == IoFix::Read {
                trace!(space, page_no, old, "waiting for read fix before eviction");
                std::thread::sleep(SSD_IO_POLL);
                continue;
            }

            let mut hash = self.hash.write();
            if hash.get(&key) == Some(&old) {
                self.meta[old].lock().flags &= !VALID;
                hash.remove(&key);
            }
            break;
        }

        let mut hash = self.hash.write();
        self.meta[meta_idx].lock().io_fix = IoFix::Write;
        hash.insert(key, meta_idx);
        Ok(())
    }

    /// Write-back of the displaced entry at `idx` whose ring image is
    /// `image`. Returns false when another writer superseded the entry and
    /// the write-back degenerated to a no-op.
    fn write_back(&self, idx: usize, image: &[u8], io: &dyn FileIo) -> Result<bool> {
        let key = {
            let mut entry = self.meta[idx].lock();
            if !entry.has(VALID) {
                return Ok(false);
            }
            entry.flags |= WB;
            (entry.space, entry.page_no)
        };

        // Only the copy the hash still points at is authoritative.
        if self.hash.read().get(&key) != Some(&idx) {
            self.meta[idx].lock().flags &= !WB;
            return Ok(false);
        }

        loop {
            let fix = self.meta[idx].lock().io_fix;
            if fix == IoFix::None {
                break;
            }
            trace!(space = key.0, page_no = key.1, idx, "write-back waiting for io fix");
            std::thread::sleep(SSD_IO_POLL);
        }

        debug!(space = key.0, page_no = key.1, idx, "writing displaced page back to its home");
        io.write_page(key.0, key.1, image)?;

        let mut hash = self.hash.write();
        let mut entry = self.meta[idx].lock();
        if entry.has(VALID) {
            entry.flags &= !(VALID | WB);
            if hash.get(&key) == Some(&idx) {
                hash.remove(&key);
            }
            Ok(true)
        } else {
            // Invalidated while we flushed; the newer copy owns the key.
            entry.flags &= !WB;
            Ok(false)
        }
    }

    /// Reads the claimed window off the ring. Parts of the ring never
    /// written (ahead of the cursor on the first lap) stay zeroed; their
    /// entries are invalid, so the bytes are never consulted.
    fn read_window(&self, first: usize, total: usize, was_wrapped: bool) -> Result<Vec<u8>> {
        let mut window = vec![0u8; total * PAGE_SIZE];
        if total == 0 {
            return Ok(window);
        }

        let part1 = total.min(self.size - first);
        if was_wrapped {
            self.file
                .read_at((first * PAGE_SIZE) as u64, &mut window[..part1 * PAGE_SIZE])?;
        }
        if part1 < total {
            self.file
                .read_at(0, &mut window[part1 * PAGE_SIZE..])?;
        }
        Ok(window)
    }

    fn write_window(&self, first: usize, total: usize, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), total * PAGE_SIZE);
        let part1 = total.min(self.size - first);
        self.file
            .write_at((first * PAGE_SIZE) as u64, &buf[..part1 * PAGE_SIZE])?;
        if part1 < total {
            self.file.write_at(0, &buf[part1 * PAGE_SIZE..])?;
        }
        Ok(())
    }

    /// Sanity sweep used at teardown: every fixed entry must be unfixed.
    pub fn quiesced(&self) -> bool {
        self.meta
            .iter()
            .all(|entry| entry.lock().io_fix == IoFix::None)
    }
}

/// [`StageBackend`] over the ring. Normal-sized pages stage into the
/// ring; compressed pages keep the classic block path (the ring's
/// write-back writes full pages and cannot re-derive a compressed image).
pub(crate) struct SsdBackend {
    cache: std::sync::Arc<SsdCache>,
    blocks: BlockBackend,
    io: std::sync::Arc<dyn FileIo>,
    defer_target_writes: bool,
}

impl SsdBackend {
    pub(crate) fn new(
        cache: std::sync::Arc<SsdCache>,
        blocks: BlockBackend,
        io: std::sync::Arc<dyn FileIo>,
        defer_target_writes: bool,
    ) -> Self {
        Self {
            cache,
            blocks,
            io,
            defer_target_writes,
        }
    }
}

impl StageBackend for SsdBackend {
    fn stage(&self, batch: &DrainedBatch) -> Result<StageToken> {
        let n = batch.handles.len();
        let mut deferred = vec![false; n];

        let mut staged_zip = false;
        for (i, handle) in batch.handles.iter().enumerate() {
            if handle.zip_size().is_some() {
                self.blocks
                    .write_slot(i, &batch.images[i * PAGE_SIZE..(i + 1) * PAGE_SIZE])?;
                staged_zip = true;
            }
        }
        if staged_zip {
            self.blocks.flush()?;
        }

        let normal: Vec<usize> = (0..n)
            .filter(|&i| batch.handles[i].zip_size().is_none())
            .collect();
        let mut touched = SmallVec::new();
        if !normal.is_empty() {
            let handles: Vec<PageHandle> =
                normal.iter().map(|&i| batch.handles[i].clone()).collect();
            let mut images = Vec::with_capacity(normal.len() * PAGE_SIZE);
            for &i in &normal {
                images.extend_from_slice(&batch.images[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
            }

            let outcome = self.cache.insert_batch(&handles, &images, &*self.io)?;
            touched = outcome.touched;

            if self.defer_target_writes {
                for &i in &normal {
                    deferred[i] = true;
                }
            }
        }

        Ok(StageToken { deferred, touched })
    }

    fn stage_single(
        &self,
        slot: usize,
        handle: &PageHandle,
        staged: Option<&[u8]>,
    ) -> Result<StageToken> {
        if handle.zip_size().is_some() {
            return self.blocks.stage_single(slot, handle, staged);
        }

        let image = handle.frame().to_vec();
        let outcome =
            self.cache
                .insert_batch(std::slice::from_ref(handle), &image, &*self.io)?;

        Ok(StageToken {
            deferred: vec![self.defer_target_writes],
            touched: outcome.touched,
        })
    }

    fn finalize(&self, token: StageToken) -> Result<()> {
        self.cache.unfix(&token.touched);
        Ok(())
    }
}

impl std::fmt::Debug for SsdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cursor = self.cursor.read();
        f.debug_struct("SsdCache")
            .field("size", &self.size)
            .field("free_idx", &cursor.free_idx)
            .field("wrapped", &cursor.wrapped)
            .field("cached", &self.hash.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Completion;

    /// In-memory ring file.
    struct MemFile {
        bytes: Mutex<Vec<u8>>,
    }

    impl MemFile {
        fn new(len: usize) -> Self {
            Self {
                bytes: Mutex::new(vec![0u8; len]),
            }
        }
    }

    impl RawFile for MemFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let bytes = self.bytes.lock();
            let off = offset as usize;
            buf.copy_from_slice(&bytes[off..off + buf.len()]);
            Ok(())
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            let mut bytes = self.bytes.lock();
            let off = offset as usize;
            bytes[off..off + buf.len()].copy_from_slice(buf);
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Captures write-back targets; everything else is inert.
    #[derive(Default)]
    struct WriteSink {
        writes: Mutex<Vec<(u32, u32, Vec<u8>)>>,
    }

    impl FileIo for WriteSink {
        fn read_page(&self, _space: u32, _page_no: u32, _buf: &mut [u8]) -> Result<()> {
            unreachable!("ring tests never read tablespaces")
        }

        fn write_page(&self, space: u32, page_no: u32, buf: &[u8]) -> Result<()> {
            self.writes.lock().push((space, page_no, buf.to_vec()));
            Ok(())
        }

        fn write_page_async(&self, _handle: &PageHandle, _completion: Completion) -> Result<()> {
            unreachable!("ring write-backs are synchronous")
        }

        fn flush(&self, _space: u32) -> Result<()> {
            Ok(())
        }

        fn wake_io_threads(&self) {}

        fn wait_until_no_pending_writes(&self) -> Result<()> {
            Ok(())
        }
    }

    fn ring(size: usize) -> SsdCache {
        SsdCache::with_file(Box::new(MemFile::new(size * PAGE_SIZE)), size)
    }

    fn page(space: u32, no: u32, fill: u8) -> (PageHandle, Vec<u8>) {
        let mut frame = vec![fill; PAGE_SIZE];
        crate::page::init_page(&mut frame, space, no, crate::page::PAGE_TYPE_ALLOCATED);
        crate::page::seal_page(&mut frame, u64::from(no));
        (
            PageHandle::new(space, no, u64::from(no), frame.clone()),
            frame,
        )
    }

    fn insert(cache: &SsdCache, io: &WriteSink, pages: &[(PageHandle, Vec<u8>)]) -> InsertOutcome {
        let handles: Vec<PageHandle> = pages.iter().map(|(h, _)| h.clone()).collect();
        let images: Vec<u8> = pages.iter().flat_map(|(_, img)| img.clone()).collect();
        let outcome = cache.insert_batch(&handles, &images, io).unwrap();
        cache.unfix(&outcome.touched);
        outcome
    }

    #[test]
    fn first_lap_fills_without_evictions() {
        let cache = ring(4);
        let io = WriteSink::default();

        let pages: Vec<_> = (0..4).map(|no| page(1, no, no as u8 + 1)).collect();
        let outcome = insert(&cache, &io, &pages);

        assert_eq!(outcome.first, 0);
        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.second_chances, 0);
        assert_eq!(outcome.write_backs, 0);
        assert!(cache.wrapped(), "filling the ring exactly wraps the cursor");
        assert_eq!(cache.free_idx(), 0);
        for no in 0..4 {
            assert_eq!(cache.slot_of(1, no), Some(no as usize));
        }
        assert!(io.writes.lock().is_empty());
    }

    #[test]
    fn wrapped_becomes_true_exactly_once() {
        let cache = ring(4);
        let io = WriteSink::default();

        insert(&cache, &io, &[page(1, 0, 1), page(1, 1, 2)]);
        assert!(!cache.wrapped());
        assert_eq!(cache.free_idx(), 2);

        insert(&cache, &io, &[page(1, 2, 3), page(1, 3, 4)]);
        assert!(cache.wrapped());
        assert_eq!(cache.free_idx(), 0);

        insert(&cache, &io, &[page(1, 4, 5)]);
        assert!(cache.wrapped());
    }

    #[test]
    fn displaced_valid_pages_are_written_back() {
        let cache = ring(4);
        let io = WriteSink::default();

        let old: Vec<_> = (0..4).map(|no| page(1, no, no as u8 + 1)).collect();
        insert(&cache, &io, &old);

        let outcome = insert(&cache, &io, &[page(1, 10, 0x10), page(1, 11, 0x11)]);
        assert_eq!(outcome.write_backs, 2);

        let writes = io.writes.lock();
        let targets: Vec<(u32, u32)> = writes.iter().map(|(s, n, _)| (*s, *n)).collect();
        assert_eq!(targets, vec![(1, 0), (1, 1)]);
        // The written-back image is the ring copy of the displaced page.
        assert_eq!(writes[0].2, old[0].1);

        assert!(!cache.contains(1, 0));
        assert!(!cache.contains(1, 1));
        assert!(cache.contains(1, 10));
        assert!(cache.contains(1, 11));
    }

    #[test]
    fn referenced_page_survives_one_pass() {
        let cache = ring(4);
        let io = WriteSink::default();

        let old: Vec<_> = (0..4).map(|no| page(1, no, no as u8 + 1)).collect();
        insert(&cache, &io, &old);
        assert!(cache.mark_referenced(1, 0));

        let outcome = insert(&cache, &io, &[page(1, 10, 0x10), page(1, 11, 0x11)]);

        // Window {0, 1, 2}: slot 0 survives, slots 1 and 2 go home.
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.second_chances, 1);
        assert_eq!(outcome.write_backs, 2);

        assert_eq!(cache.slot_of(1, 0), Some(0));
        let mut slot0 = vec![0u8; PAGE_SIZE];
        cache.read_slot(0, &mut slot0).unwrap();
        assert_eq!(slot0, old[0].1);

        // A second pass without a fresh reference evicts it: the chance
        // was consumed by the re-home.
        let outcome = insert(&cache, &io, &[page(1, 12, 0x12)]);
        assert_eq!(outcome.second_chances, 0);
    }

    #[test]
    fn survivor_relocates_across_the_window() {
        let cache = ring(4);
        let io = WriteSink::default();

        let old: Vec<_> = (0..4).map(|no| page(1, no, no as u8 + 1)).collect();
        insert(&cache, &io, &old);
        assert!(cache.mark_referenced(1, 2));

        // Window {0, 1, 2, 3}: the survivor at slot 2 moves to slot 0.
        let outcome = insert(&cache, &io, &[page(1, 10, 0x10), page(1, 11, 0x11), page(1, 12, 0x12)]);
        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.second_chances, 1);
        assert_eq!(outcome.write_backs, 3);

        assert_eq!(cache.slot_of(1, 2), Some(0));
        let mut relocated = vec![0u8; PAGE_SIZE];
        cache.read_slot(0, &mut relocated).unwrap();
        assert_eq!(relocated, old[2].1);

        for (no, slot) in [(10u32, 1usize), (11, 2), (12, 3)] {
            assert_eq!(cache.slot_of(1, no), Some(slot));
        }
    }

    #[test]
    fn window_wraps_with_two_part_write() {
        let cache = ring(4);
        let io = WriteSink::default();

        insert(&cache, &io, &[page(1, 0, 1), page(1, 1, 2), page(1, 2, 3)]);
        // free_idx = 3; the next two-page window wraps to slot 0.
        let pages = [page(1, 10, 0x10), page(1, 11, 0x11)];
        let outcome = insert(&cache, &io, &pages);

        assert_eq!(outcome.first, 3);
        assert_eq!(cache.free_idx(), 1);
        assert_eq!(cache.slot_of(1, 10), Some(3));
        assert_eq!(cache.slot_of(1, 11), Some(0));

        let mut slot = vec![0u8; PAGE_SIZE];
        cache.read_slot(3, &mut slot).unwrap();
        assert_eq!(slot, pages[0].1);
        cache.read_slot(0, &mut slot).unwrap();
        assert_eq!(slot, pages[1].1);
    }

    #[test]
    fn reinserting_a_cached_page_moves_its_hash_entry() {
        let cache = ring(4);
        let io = WriteSink::default();

        insert(&cache, &io, &[page(1, 7, 0x70)]);
        assert_eq!(cache.slot_of(1, 7), Some(0));

        let newer = page(1, 7, 0x71);
        insert(&cache, &io, &[newer.clone()]);
        assert_eq!(cache.slot_of(1, 7), Some(1));

        // The stale slot-0 copy is invalid: no write-back may resurrect it.
        let outcome = insert(&cache, &io, &[page(1, 8, 0x80), page(1, 9, 0x90)]);
        assert_eq!(outcome.write_backs, 0, "the superseded slot-0 copy is not valid");
        assert!(io.writes.lock().is_empty());
        assert_eq!(cache.slot_of(1, 7), Some(1));
    }

    #[test]
    fn read_page_hits_and_marks() {
        let cache = ring(4);
        let io = WriteSink::default();

        let pages: Vec<_> = (0..4).map(|no| page(3, no, no as u8 + 1)).collect();
        insert(&cache, &io, &pages);

        let mut out = vec![0u8; PAGE_SIZE];
        assert!(cache.read_page(3, 0, &mut out).unwrap());
        assert_eq!(out, pages[0].1);
        assert!(!cache.read_page(3, 8, &mut out).unwrap());

        // The hit earned the entry a second chance at the next pass.
        let outcome = insert(&cache, &io, &[page(3, 20, 0x20), page(3, 21, 0x21)]);
        assert_eq!(outcome.second_chances, 1);
    }

    #[test]
    fn quiesced_after_unfix() {
        let cache = ring(4);
        let io = WriteSink::default();
        let handles: Vec<PageHandle> = vec![page(1, 0, 1).0];
        let images = page(1, 0, 1).1;
        let outcome = cache.insert_batch(&handles, &images, &io).unwrap();
        assert!(!cache.quiesced());
        cache.unfix(&outcome.touched);
        assert!(cache.quiesced());
    }
}
