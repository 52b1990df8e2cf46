//! Shared test harness: simulated engine collaborators.
//!
//! `SimIo` is an in-memory tablespace farm with the same asynchronous
//! write protocol a real I/O layer has: `write_page_async` queues, and
//! nothing reaches the "disk" until [`SimIo::pump`] runs. The gap between
//! staging and pumping is the crash window the recovery tests exploit:
//! [`SimIo::crash_drop_pending`] loses queued target writes outright and
//! [`SimIo::crash_tear_pending`] applies the head of one write before
//! losing the rest, producing a torn page.
//!
//! Every applied write and flush lands in an ordered event log so tests
//! can assert the stage-flush happens-before target-write guarantee.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use parking_lot::Mutex;

use dblwr::config::{EXTENT_PAGES, HEADER_FSEG_OFFSET, PAGE_SIZE, SYS_HEADER_PAGE, SYS_SPACE};
use dblwr::page;
use dblwr::{
    BufferPool, Checkpoint, Completion, CrcPageOracle, FileIo, MiniTx, PageHandle, Ports, RawFile,
    SysSpace, Tablespaces,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    Write { space: u32, page_no: u32 },
    Flush { space: u32 },
    FlushAll,
}

struct Space {
    data: Vec<u8>,
    page_count: usize,
    zip_size: Option<usize>,
}

impl Space {
    fn phys(&self) -> usize {
        self.zip_size.unwrap_or(PAGE_SIZE)
    }
}

struct PendingWrite {
    space: u32,
    page_no: u32,
    image: Vec<u8>,
    completion: Completion,
}

/// In-memory tablespaces plus the asynchronous write queue.
#[derive(Default)]
pub struct SimIo {
    spaces: Mutex<HashMap<u32, Space>>,
    pending: Mutex<Vec<PendingWrite>>,
    log: Mutex<Vec<IoEvent>>,
    auto_pump: std::sync::atomic::AtomicBool,
}

impl SimIo {
    pub fn new() -> Arc<Self> {
        let io = Arc::new(Self::default());
        // The system tablespace always exists, sized past both staging
        // blocks.
        io.create_space(SYS_SPACE, 3 * EXTENT_PAGES + 16, None);
        io
    }

    pub fn create_space(&self, space: u32, pages: usize, zip_size: Option<usize>) {
        let phys = zip_size.unwrap_or(PAGE_SIZE);
        self.spaces.lock().insert(
            space,
            Space {
                data: vec![0u8; pages * phys],
                page_count: pages,
                zip_size,
            },
        );
    }

    pub fn drop_space(&self, space: u32) {
        self.spaces.lock().remove(&space);
    }

    /// Lowers the visible size of a space without touching its bytes.
    pub fn truncate_space(&self, space: u32, pages: usize) {
        if let Some(sp) = self.spaces.lock().get_mut(&space) {
            sp.page_count = pages;
        }
    }

    /// With auto-pump on, `wake_io_threads` drains the queue inline, as
    /// if I/O helper threads were running. Leave off to hold writes in
    /// the crash window.
    pub fn set_auto_pump(&self, on: bool) {
        self.auto_pump.store(on, Ordering::Relaxed);
    }

    /// Applies every queued asynchronous write and runs its completion.
    pub fn pump(&self) {
        loop {
            let Some(write) = ({
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            }) else {
                return;
            };

            self.apply_write(write.space, write.page_no, &write.image)
                .expect("simulated write must land");
            (write.completion)();
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Crash: queued target writes never happen. Completions never run.
    pub fn crash_drop_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let lost = pending.len();
        pending.clear();
        lost
    }

    /// Crash mid-write: the queued write for `(space, page_no)` applies
    /// only its head, so the frame's trailer stamp no longer matches.
    /// Everything else queued is lost.
    pub fn crash_tear_pending(&self, space: u32, page_no: u32) {
        let mut pending = self.pending.lock();
        for write in pending.drain(..) {
            if write.space == space && write.page_no == page_no {
                let half = write.image.len() / 2;
                let mut current = self.read_raw(space, page_no);
                current[..half].copy_from_slice(&write.image[..half]);
                self.apply_write(space, page_no, &current)
                    .expect("torn write must land");
            }
        }
    }

    pub fn events(&self) -> Vec<IoEvent> {
        self.log.lock().clone()
    }

    pub fn clear_events(&self) {
        self.log.lock().clear();
    }

    /// Bytes of a page as they currently are on the simulated disk.
    pub fn read_raw(&self, space: u32, page_no: u32) -> Vec<u8> {
        let spaces = self.spaces.lock();
        let sp = spaces.get(&space).expect("space exists");
        let phys = sp.phys();
        let start = page_no as usize * phys;
        sp.data[start..start + phys].to_vec()
    }

    /// Overwrites a page on the simulated disk without logging; tests use
    /// this to fabricate pre-crash disk states.
    pub fn patch_raw(&self, space: u32, page_no: u32, image: &[u8]) {
        let mut spaces = self.spaces.lock();
        let sp = spaces.get_mut(&space).expect("space exists");
        let phys = sp.phys();
        let start = page_no as usize * phys;
        sp.data[start..start + phys].copy_from_slice(image);
    }

    fn apply_write(&self, space: u32, page_no: u32, buf: &[u8]) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let sp = spaces
            .get_mut(&space)
            .ok_or_else(|| eyre!("write to unknown space {space}"))?;
        let phys = sp.phys();
        ensure!(
            buf.len() == phys,
            "write of {} bytes to space {} with physical page size {}",
            buf.len(),
            space,
            phys
        );

        let start = page_no as usize * phys;
        if sp.data.len() < start + phys {
            sp.data.resize(start + phys, 0);
        }
        sp.data[start..start + phys].copy_from_slice(buf);
        sp.page_count = sp.page_count.max(page_no as usize + 1);
        drop(spaces);

        self.log.lock().push(IoEvent::Write { space, page_no });
        Ok(())
    }
}

impl FileIo for SimIo {
    fn read_page(&self, space: u32, page_no: u32, buf: &mut [u8]) -> Result<()> {
        let spaces = self.spaces.lock();
        let sp = spaces
            .get(&space)
            .ok_or_else(|| eyre!("read from unknown space {space}"))?;
        let phys = sp.phys();
        ensure!(buf.len() == phys, "read buffer does not match physical page size");
        let start = page_no as usize * phys;
        ensure!(
            sp.data.len() >= start + phys,
            "read past end of space {space}: page {page_no}"
        );
        buf.copy_from_slice(&sp.data[start..start + phys]);
        Ok(())
    }

    fn write_page(&self, space: u32, page_no: u32, buf: &[u8]) -> Result<()> {
        self.apply_write(space, page_no, buf)
    }

    fn write_page_async(&self, handle: &PageHandle, completion: Completion) -> Result<()> {
        let image = match handle.zip_data() {
            Some(zip) => zip.to_vec(),
            None => handle.frame().to_vec(),
        };
        self.pending.lock().push(PendingWrite {
            space: handle.space(),
            page_no: handle.page_no(),
            image,
            completion,
        });
        Ok(())
    }

    fn flush(&self, space: u32) -> Result<()> {
        self.log.lock().push(IoEvent::Flush { space });
        Ok(())
    }

    fn wake_io_threads(&self) {
        if self.auto_pump.load(Ordering::Relaxed) {
            self.pump();
        }
    }

    fn wait_until_no_pending_writes(&self) -> Result<()> {
        self.pump();
        Ok(())
    }
}

impl Tablespaces for SimIo {
    fn exists(&self, space: u32) -> bool {
        self.spaces.lock().contains_key(&space)
    }

    fn in_bounds(&self, space: u32, page_no: u32) -> bool {
        self.spaces
            .lock()
            .get(&space)
            .is_some_and(|sp| (page_no as usize) < sp.page_count)
    }

    fn zip_size(&self, space: u32) -> Option<usize> {
        self.spaces.lock().get(&space).and_then(|sp| sp.zip_size)
    }

    fn flush_all(&self) -> Result<()> {
        self.log.lock().push(IoEvent::FlushAll);
        Ok(())
    }
}

/// Byte-offset view of one simulated tablespace, for the recovery loader.
pub struct SimRawFile {
    io: Arc<SimIo>,
    space: u32,
}

impl SimRawFile {
    pub fn new(io: Arc<SimIo>, space: u32) -> Self {
        Self { io, space }
    }
}

impl RawFile for SimRawFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let spaces = self.io.spaces.lock();
        let sp = spaces
            .get(&self.space)
            .ok_or_else(|| eyre!("raw read from unknown space {}", self.space))?;
        let off = offset as usize;
        ensure!(
            sp.data.len() >= off + buf.len(),
            "raw read past end of space {}",
            self.space
        );
        buf.copy_from_slice(&sp.data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut spaces = self.io.spaces.lock();
        let sp = spaces
            .get_mut(&self.space)
            .ok_or_else(|| eyre!("raw write to unknown space {}", self.space))?;
        let off = offset as usize;
        if sp.data.len() < off + buf.len() {
            sp.data.resize(off + buf.len(), 0);
        }
        sp.data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Bump allocator over the system tablespace, with the mini-transaction
/// bookkeeping bootstrap exercises.
pub struct SimSys {
    io: Arc<SimIo>,
    inner: Mutex<SysInner>,
}

struct SysInner {
    next_page: u32,
    segment_created: bool,
    max_pages: Option<u32>,
    begins: usize,
    commits: usize,
    max_allocs_per_mtx: usize,
}

impl SimSys {
    pub fn new(io: Arc<SimIo>) -> Arc<Self> {
        Arc::new(Self {
            io,
            inner: Mutex::new(SysInner {
                // A fresh segment burns through the tail of extent 0
                // before extent-aligned allocation begins.
                next_page: (EXTENT_PAGES / 2) as u32,
                segment_created: false,
                max_pages: None,
                begins: 0,
                commits: 0,
                max_allocs_per_mtx: 0,
            }),
        })
    }

    /// Caps allocation so bootstrap runs out of space.
    pub fn limit_pages(&self, max: u32) {
        self.inner.lock().max_pages = Some(max);
    }

    pub fn begins(&self) -> usize {
        self.inner.lock().begins
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().commits
    }

    /// Largest number of page allocations any single mini-transaction
    /// performed.
    pub fn max_allocs_per_mtx(&self) -> usize {
        self.inner.lock().max_allocs_per_mtx
    }
}

impl SysSpace for SimSys {
    fn begin(&self) -> Result<Box<dyn MiniTx + '_>> {
        self.inner.lock().begins += 1;
        Ok(Box::new(SimMiniTx { sys: self, allocs: 0 }))
    }
}

struct SimMiniTx<'a> {
    sys: &'a SimSys,
    allocs: usize,
}

impl MiniTx for SimMiniTx<'_> {
    fn create_segment(&mut self, anchor: usize) -> Result<bool> {
        ensure!(anchor == HEADER_FSEG_OFFSET, "unexpected segment anchor {anchor}");
        self.sys.inner.lock().segment_created = true;
        Ok(true)
    }

    fn alloc_page(&mut self, anchor: usize, hint: u32) -> Result<Option<u32>> {
        ensure!(anchor == HEADER_FSEG_OFFSET, "unexpected segment anchor {anchor}");
        let mut inner = self.sys.inner.lock();
        ensure!(inner.segment_created, "allocation before segment creation");

        if let Some(max) = inner.max_pages {
            if inner.next_page >= max {
                return Ok(None);
            }
        }

        let page_no = inner.next_page;
        debug_assert!(hint <= page_no + 1, "allocation hint runs ahead of the segment");
        inner.next_page += 1;

        self.allocs += 1;
        inner.max_allocs_per_mtx = inner.max_allocs_per_mtx.max(self.allocs);
        Ok(Some(page_no))
    }

    fn read_sys(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let page = self.sys.io.read_raw(SYS_SPACE, SYS_HEADER_PAGE);
        Ok(page[offset..offset + len].to_vec())
    }

    fn write_sys(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut page = self.sys.io.read_raw(SYS_SPACE, SYS_HEADER_PAGE);
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.sys.io.patch_raw(SYS_SPACE, SYS_HEADER_PAGE, &page);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.sys.inner.lock().commits += 1;
        Ok(())
    }
}

pub struct SimBufferPool {
    capacity: AtomicUsize,
    invalidations: AtomicU64,
}

impl SimBufferPool {
    pub fn new(capacity_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: AtomicUsize::new(capacity_bytes),
            invalidations: AtomicU64::new(0),
        })
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl BufferPool for SimBufferPool {
    fn capacity_bytes(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct SimCheckpoint {
    count: AtomicU64,
}

impl SimCheckpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Checkpoint for SimCheckpoint {
    fn make_checkpoint(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A full simulated engine plus its ports bundle.
pub struct SimEngine {
    pub io: Arc<SimIo>,
    pub sys: Arc<SimSys>,
    pub buffer_pool: Arc<SimBufferPool>,
    pub checkpoint: Arc<SimCheckpoint>,
}

impl SimEngine {
    pub fn new() -> Self {
        let io = SimIo::new();
        let sys = SimSys::new(Arc::clone(&io));
        Self {
            io,
            sys,
            // Comfortably above the bootstrap precheck.
            buffer_pool: SimBufferPool::new(1024 * PAGE_SIZE),
            checkpoint: SimCheckpoint::new(),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            io: self.io.clone(),
            spaces: self.io.clone(),
            oracle: Arc::new(CrcPageOracle),
            checkpoint: self.checkpoint.clone(),
            buffer_pool: self.buffer_pool.clone(),
            sys: self.sys.clone(),
        }
    }

    pub fn raw_sys_file(&self) -> SimRawFile {
        SimRawFile::new(Arc::clone(&self.io), SYS_SPACE)
    }
}

/// A sealed, checksummed page image.
pub fn sealed_page(space: u32, page_no: u32, lsn: u64, fill: u8) -> Vec<u8> {
    let mut frame = vec![0u8; PAGE_SIZE];
    frame[page::OFF_PAGE_DATA..].fill(fill);
    page::init_page(&mut frame, space, page_no, page::PAGE_TYPE_ALLOCATED);
    page::seal_page(&mut frame, lsn);
    frame
}

/// A handle over a sealed page image.
pub fn sealed_handle(space: u32, page_no: u32, lsn: u64, fill: u8) -> PageHandle {
    PageHandle::new(space, page_no, lsn, sealed_page(space, page_no, lsn, fill))
}
