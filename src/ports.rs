//! # Collaborator Ports
//!
//! The doublewrite subsystem sits between a buffer-pool flusher and the
//! tablespace files; everything it needs from the rest of the engine comes
//! in through the object-safe traits below, bundled into [`Ports`]. The
//! subsystem owns no file handles of its own except the optional SSD ring.
//!
//! ## Ports
//!
//! - [`FileIo`]: page-granular tablespace I/O, including the asynchronous
//!   target writes whose completions drive the batch lifecycle
//! - [`Tablespaces`]: mount/bounds/compression metadata and bulk flush
//! - [`PageOracle`]: corruption, zero-fill, and structural checks
//! - [`Checkpoint`]: the single checkpoint bootstrap makes after stamping
//!   the header
//! - [`BufferPool`]: capacity precheck and post-bootstrap invalidation
//! - [`SysSpace`] / [`MiniTx`]: latched, logged mini-transactions against
//!   the system tablespace used by bootstrap's allocation loop
//! - [`RawFile`]: positioned byte I/O for the recovery loader (which runs
//!   before the tablespace layer is up) and for the SSD ring file
//!
//! ## Page Handles
//!
//! [`PageHandle`] is the opaque, clonable reference to a buffer-pool page.
//! The handle does not own the page: the buffer pool may invalidate it
//! between submission and completion, and the completion handler releases
//! staging slots by handle identity without touching the frame.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::PAGE_SIZE;

/// Callback handed to [`FileIo::write_page_async`]; the I/O layer invokes
/// it exactly once, after the target write has been applied to the file.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Page-granular tablespace I/O.
///
/// `buf.len()` is always the physical page size of the addressed space
/// (the compressed size for compressed tablespaces), and positioning is
/// `page_no * buf.len()`.
pub trait FileIo: Send + Sync {
    fn read_page(&self, space: u32, page_no: u32, buf: &mut [u8]) -> Result<()>;

    fn write_page(&self, space: u32, page_no: u32, buf: &[u8]) -> Result<()>;

    /// Queues an asynchronous write of the handle's current image
    /// (compressed payload if present, frame otherwise) to its home
    /// location. `completion` runs once the write is applied.
    fn write_page_async(&self, handle: &PageHandle, completion: Completion) -> Result<()>;

    fn flush(&self, space: u32) -> Result<()>;

    /// Wakes the I/O pump so queued asynchronous writes reach the OS.
    fn wake_io_threads(&self);

    fn wait_until_no_pending_writes(&self) -> Result<()>;
}

/// Tablespace directory: what is mounted, how large, how compressed.
pub trait Tablespaces: Send + Sync {
    fn exists(&self, space: u32) -> bool;

    fn in_bounds(&self, space: u32, page_no: u32) -> bool;

    /// Physical page size for compressed tablespaces, `None` for
    /// uncompressed ones.
    fn zip_size(&self, space: u32) -> Option<usize>;

    /// Flushes every mounted tablespace.
    fn flush_all(&self) -> Result<()>;
}

/// Page validation oracle. `zip_size` is `Some` when `buf` holds a
/// compressed image of that physical size.
pub trait PageOracle: Send + Sync {
    fn is_corrupted(&self, buf: &[u8], zip_size: Option<usize>) -> bool;

    fn is_zeroes(&self, buf: &[u8], zip_size: Option<usize>) -> bool;

    fn validate_index_page(&self, frame: &[u8]) -> bool;
}

/// Redo-log checkpointing, used once during bootstrap.
pub trait Checkpoint: Send + Sync {
    fn make_checkpoint(&self) -> Result<()>;
}

/// The buffer pool, as far as this subsystem needs to know it.
pub trait BufferPool: Send + Sync {
    fn capacity_bytes(&self) -> usize;

    /// Drops every cached copy so the freshly allocated staging pages are
    /// re-read from disk.
    fn invalidate_all(&self);
}

/// Factory for mini-transactions over the system tablespace.
pub trait SysSpace: Send + Sync {
    fn begin(&self) -> Result<Box<dyn MiniTx + '_>>;
}

/// A latched, logged mini-transaction over the system tablespace.
///
/// Bootstrap stacks page latches while it allocates the staging blocks;
/// implementations typically bound how many latches a single
/// mini-transaction may hold, which is why the allocation loop commits and
/// restarts periodically.
pub trait MiniTx {
    /// Creates the file segment anchored `anchor` bytes into the system
    /// header page. Returns false when the tablespace cannot host it.
    fn create_segment(&mut self, anchor: usize) -> Result<bool>;

    /// Allocates one page from the segment anchored at `anchor`,
    /// preferring `hint`. Returns `None` when the tablespace is full.
    fn alloc_page(&mut self, anchor: usize, hint: u32) -> Result<Option<u32>>;

    /// Reads `len` bytes at `offset` of the system header page.
    fn read_sys(&mut self, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Logged write into the system header page.
    fn write_sys(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Positioned byte I/O over a single file.
pub trait RawFile: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

/// [`RawFile`] over a [`std::fs::File`], serialized by a mutex so the
/// seek+read pairs stay atomic.
pub struct FsFile {
    file: Mutex<std::fs::File>,
}

impl FsFile {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl RawFile for FsFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

/// Everything the subsystem needs from its host engine.
#[derive(Clone)]
pub struct Ports {
    pub io: Arc<dyn FileIo>,
    pub spaces: Arc<dyn Tablespaces>,
    pub oracle: Arc<dyn PageOracle>,
    pub checkpoint: Arc<dyn Checkpoint>,
    pub buffer_pool: Arc<dyn BufferPool>,
    pub sys: Arc<dyn SysSpace>,
}

/// Lifecycle state of a page behind a [`PageHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    /// A full uncompressed frame backed by a buffer-pool block.
    FilePage = 0,
    /// A compressed-only dirty page; no decompressed frame exists.
    ZipDirty = 1,
    /// The buffer pool dropped the page after the write was submitted.
    Invalidated = 2,
}

struct ZipImage {
    size: usize,
    data: Box<[u8]>,
}

struct HandleInner {
    space: u32,
    page_no: u32,
    lsn: u64,
    frame: RwLock<Box<[u8]>>,
    zip: Option<ZipImage>,
    check_on_flush: AtomicBool,
    state: AtomicU8,
}

/// Opaque, clonable, non-owning reference to a buffer-pool page.
///
/// Clones share identity: the staging area matches a completion back to
/// its slot by comparing handles with [`PageHandle::same`], never by
/// inspecting the frame, so a handle invalidated mid-flight still releases
/// its slot correctly.
#[derive(Clone)]
pub struct PageHandle {
    inner: Arc<HandleInner>,
}

impl PageHandle {
    pub fn new(space: u32, page_no: u32, lsn: u64, frame: Vec<u8>) -> Self {
        assert_eq!(frame.len(), PAGE_SIZE, "page frame must be a full page");
        Self {
            inner: Arc::new(HandleInner {
                space,
                page_no,
                lsn,
                frame: RwLock::new(frame.into_boxed_slice()),
                zip: None,
                check_on_flush: AtomicBool::new(false),
                state: AtomicU8::new(HandleState::FilePage as u8),
            }),
        }
    }

    /// A handle carrying a compressed image alongside its frame. The
    /// compressed payload, not the frame, is what reaches disk.
    pub fn new_zip(space: u32, page_no: u32, lsn: u64, frame: Vec<u8>, zip_data: Vec<u8>) -> Self {
        assert_eq!(frame.len(), PAGE_SIZE, "page frame must be a full page");
        let size = zip_data.len();
        assert!(
            size > 0 && size < PAGE_SIZE,
            "compressed image must be smaller than a page"
        );
        Self {
            inner: Arc::new(HandleInner {
                space,
                page_no,
                lsn,
                frame: RwLock::new(frame.into_boxed_slice()),
                zip: Some(ZipImage {
                    size,
                    data: zip_data.into_boxed_slice(),
                }),
                check_on_flush: AtomicBool::new(false),
                state: AtomicU8::new(HandleState::ZipDirty as u8),
            }),
        }
    }

    pub fn space(&self) -> u32 {
        self.inner.space
    }

    pub fn page_no(&self) -> u32 {
        self.inner.page_no
    }

    /// LSN of the newest modification at submission time.
    pub fn lsn(&self) -> u64 {
        self.inner.lsn
    }

    pub fn zip_size(&self) -> Option<usize> {
        self.inner.zip.as_ref().map(|zip| zip.size)
    }

    pub fn zip_data(&self) -> Option<&[u8]> {
        self.inner.zip.as_ref().map(|zip| &*zip.data)
    }

    pub fn frame(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.inner.frame.read()
    }

    pub fn frame_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.inner.frame.write()
    }

    pub fn state(&self) -> HandleState {
        match self.inner.state.load(Ordering::Acquire) {
            0 => HandleState::FilePage,
            1 => HandleState::ZipDirty,
            _ => HandleState::Invalidated,
        }
    }

    pub fn is_file_page(&self) -> bool {
        self.state() == HandleState::FilePage
    }

    /// Called by the buffer pool when it drops the page. In-flight writes
    /// already carry the image; only slot release remains, and that goes
    /// by identity.
    pub fn invalidate(&self) {
        self.inner
            .state
            .store(HandleState::Invalidated as u8, Ordering::Release);
    }

    /// Marks the page for structural validation before every flush; set by
    /// index maintenance code after reorganizations.
    pub fn flag_check_on_flush(&self) {
        self.inner.check_on_flush.store(true, Ordering::Release);
    }

    pub fn check_on_flush(&self) -> bool {
        self.inner.check_on_flush.load(Ordering::Acquire)
    }

    /// Identity comparison; true only for clones of the same submission.
    pub fn same(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copies the image to stage for this page into a full staging slot:
    /// the compressed payload zero-padded to a page, or the frame as-is.
    pub fn copy_staged_image(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        match &self.inner.zip {
            Some(zip) => {
                out[..zip.size].copy_from_slice(&zip.data);
                out[zip.size..].fill(0);
            }
            None => out.copy_from_slice(&self.frame()[..]),
        }
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("space", &self.inner.space)
            .field("page_no", &self.inner.page_no)
            .field("lsn", &self.inner.lsn)
            .field("zip_size", &self.zip_size())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let handle = PageHandle::new(1, 2, 3, vec![0u8; PAGE_SIZE]);
        let clone = handle.clone();
        assert!(handle.same(&clone));

        let other = PageHandle::new(1, 2, 3, vec![0u8; PAGE_SIZE]);
        assert!(!handle.same(&other));
    }

    #[test]
    fn staged_image_pads_compressed_payload() {
        let zip: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        let handle = PageHandle::new_zip(1, 2, 3, vec![0xaa; PAGE_SIZE], zip.clone());

        let mut slot = vec![0xffu8; PAGE_SIZE];
        handle.copy_staged_image(&mut slot);

        assert_eq!(&slot[..8192], &zip[..]);
        assert!(slot[8192..].iter().all(|&b| b == 0));
    }

    #[test]
    fn invalidation_is_visible_but_identity_survives() {
        let handle = PageHandle::new(1, 2, 3, vec![0u8; PAGE_SIZE]);
        let clone = handle.clone();
        handle.invalidate();
        assert_eq!(clone.state(), HandleState::Invalidated);
        assert!(handle.same(&clone));
    }
}
