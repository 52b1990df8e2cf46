//! # Staging Area
//!
//! The in-memory half of the doublewrite buffer: `SLOT_COUNT` page slots
//! backed by one contiguous buffer, split into two regions with different
//! concurrency disciplines.
//!
//! ```text
//! slot      0                K                    SLOT_COUNT
//!           ├────────────────┼──────────────────────┤
//!           │  batch region  │    single region     │
//!           │  [0, K)        │    [K, 2B)           │
//!           └────────────────┴──────────────────────┘
//! ```
//!
//! - The **batch region** is an append-only run filled by `first_free`.
//!   One drain at a time snapshots `[0, first_free)` and writes it out;
//!   while `batch_running` is set no producer may append.
//! - The **single region** is a free-list of independent slots tracked by
//!   `in_use`, each owned by exactly one in-flight single-page write.
//!
//! Producers that find their region unavailable capture a reset count from
//! the region's [`Event`] *before* dropping the mutex and then block on
//! it; the completion handler signals after every release. See
//! [`crate::sync`].
//!
//! ## Invariants (observed whenever the mutex is held)
//!
//! - `first_free <= K`, and `first_free == b_reserved` while no drain runs
//! - `b_reserved <= first_free`, decreasing monotonically during a drain
//! - `s_reserved` equals the number of occupied single slots
//! - an occupied slot always carries its handle back-pointer
//!
//! This module owns the state transitions only; the I/O choreography
//! around them lives in [`crate::dblwr`].

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use crate::config::{PAGE_SIZE, SLOT_COUNT};
use crate::ports::PageHandle;
use crate::sync::Event;

pub(crate) struct Staging {
    /// Slots `[0, batch_slots)` form the batch region.
    pub(crate) batch_slots: usize,
    state: Mutex<StagingState>,
    pub(crate) batch_event: Event,
    pub(crate) single_event: Event,
}

pub(crate) struct StagingState {
    write_buf: Box<[u8]>,
    in_use: Box<[bool]>,
    handles: Box<[Option<PageHandle>]>,
    pub(crate) first_free: usize,
    pub(crate) b_reserved: usize,
    pub(crate) s_reserved: usize,
    pub(crate) batch_running: bool,
}

/// Outcome of a batch-region post attempt.
pub(crate) enum BatchPost {
    /// The page occupies a slot; when `region_full` the caller must drain.
    Posted { region_full: bool },
    /// A drain is in progress; wait on `batch_event` with the captured
    /// count, then retry.
    Busy { captured: u64 },
    /// The region is full and idle; drain, then retry.
    Full,
}

/// Outcome of a single-region reservation attempt.
pub(crate) enum SinglePost {
    /// Slot reserved. For compressed pages `staged` carries the
    /// zero-padded image that was copied into the slot and must be written
    /// to the staging block; uncompressed frames are written directly.
    Reserved {
        slot: usize,
        staged: Option<Vec<u8>>,
    },
    /// Every single slot is reserved; wait on `single_event` with the
    /// captured count, then retry.
    Full { captured: u64 },
}

/// Outcome of releasing one batch page.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BatchRelease {
    InFlight,
    /// The last page of the batch completed. The caller performs the
    /// cross-tablespace flush and then calls [`Staging::finish_batch`].
    BatchDone,
}

/// A drained snapshot of the batch region, safe to use without the mutex:
/// `batch_running` excludes producers from `[0, len)` until
/// [`Staging::finish_batch`].
pub(crate) struct DrainedBatch {
    pub(crate) images: Vec<u8>,
    pub(crate) handles: Vec<PageHandle>,
}

pub(crate) enum DrainStart {
    Empty,
    /// Another drain is running; wait and retry.
    Busy { captured: u64 },
    Started(DrainedBatch),
}

impl Staging {
    pub(crate) fn new(batch_slots: usize) -> Self {
        assert!(batch_slots > 0 && batch_slots < SLOT_COUNT);
        Self {
            batch_slots,
            state: Mutex::new(StagingState {
                write_buf: vec![0u8; SLOT_COUNT * PAGE_SIZE].into_boxed_slice(),
                in_use: vec![false; SLOT_COUNT].into_boxed_slice(),
                handles: vec![None; SLOT_COUNT].into_boxed_slice(),
                first_free: 0,
                b_reserved: 0,
                s_reserved: 0,
                batch_running: false,
            }),
            batch_event: Event::new(),
            single_event: Event::new(),
        }
    }

    pub(crate) fn single_slots(&self) -> usize {
        SLOT_COUNT - self.batch_slots
    }

    fn lock(&self) -> MutexGuard<'_, StagingState> {
        self.state.lock()
    }

    pub(crate) fn try_post_batch(&self, handle: &PageHandle) -> BatchPost {
        let mut st = self.lock();
        debug_assert!(st.first_free <= self.batch_slots);

        if st.batch_running {
            // Capture before unlocking; a signal between unlock and wait
            // must not be lost.
            return BatchPost::Busy {
                captured: self.batch_event.reset(),
            };
        }
        if st.first_free == self.batch_slots {
            return BatchPost::Full;
        }

        let slot = st.first_free;
        handle.copy_staged_image(st.slot_mut(slot));
        st.handles[slot] = Some(handle.clone());
        st.first_free += 1;
        st.b_reserved += 1;

        debug_assert!(!st.batch_running);
        debug_assert_eq!(st.first_free, st.b_reserved);
        self.check_invariants(&st);

        BatchPost::Posted {
            region_full: st.first_free == self.batch_slots,
        }
    }

    pub(crate) fn try_reserve_single(&self, handle: &PageHandle) -> SinglePost {
        let mut st = self.lock();

        if st.s_reserved == self.single_slots() {
            return SinglePost::Full {
                captured: self.single_event.reset(),
            };
        }

        let slot = (self.batch_slots..SLOT_COUNT)
            .find(|&i| !st.in_use[i])
            .expect("a free single slot must exist below the reservation cap");

        st.in_use[slot] = true;
        st.s_reserved += 1;
        st.handles[slot] = Some(handle.clone());

        // Compressed payloads are padded into the slot so the staging
        // block always receives full-page images; uncompressed frames skip
        // the copy and are written to the block directly.
        let staged = if handle.zip_size().is_some() {
            handle.copy_staged_image(st.slot_mut(slot));
            Some(st.slot(slot).to_vec())
        } else {
            None
        };

        self.check_invariants(&st);
        SinglePost::Reserved { slot, staged }
    }

    pub(crate) fn begin_drain(&self) -> DrainStart {
        let mut st = self.lock();

        if st.first_free == 0 {
            return DrainStart::Empty;
        }
        if st.batch_running {
            return DrainStart::Busy {
                captured: self.batch_event.reset(),
            };
        }

        debug_assert_eq!(st.first_free, st.b_reserved);
        st.batch_running = true;

        let len = st.first_free;
        let images = st.write_buf[..len * PAGE_SIZE].to_vec();
        let handles = st.handles[..len]
            .iter()
            .map(|h| h.clone().expect("batch slot below first_free has a handle"))
            .collect();

        DrainStart::Started(DrainedBatch { images, handles })
    }

    /// Releases one batch page on target-write completion.
    pub(crate) fn release_batch_one(&self) -> BatchRelease {
        let mut st = self.lock();
        debug_assert!(st.batch_running);
        debug_assert!(st.b_reserved > 0);
        debug_assert!(st.b_reserved <= st.first_free);

        st.b_reserved -= 1;
        if st.b_reserved == 0 {
            BatchRelease::BatchDone
        } else {
            BatchRelease::InFlight
        }
    }

    /// Reopens the batch region after the final cross-tablespace flush.
    pub(crate) fn finish_batch(&self) {
        let mut st = self.lock();
        debug_assert!(st.batch_running);
        debug_assert_eq!(st.b_reserved, 0);

        let len = st.first_free;
        for slot in st.handles[..len].iter_mut() {
            *slot = None;
        }
        st.first_free = 0;
        st.batch_running = false;
        self.check_invariants(&st);
        drop(st);

        self.batch_event.set();
    }

    /// Releases the single slot owned by `handle`. A completion for a
    /// handle that owns no slot means the staging bookkeeping and the I/O
    /// layer disagree about an in-flight write; continuing would corrupt
    /// slot accounting, so this is fatal.
    pub(crate) fn release_single(&self, handle: &PageHandle) {
        let mut st = self.lock();

        let slot = (self.batch_slots..SLOT_COUNT).find(|&i| {
            st.handles[i]
                .as_ref()
                .is_some_and(|owner| owner.same(handle))
        });

        let Some(slot) = slot else {
            error!(?handle, "single-page completion for a handle that owns no staging slot");
            panic!(
                "doublewrite: completion for unknown handle (space {}, page {})",
                handle.space(),
                handle.page_no()
            );
        };

        st.in_use[slot] = false;
        st.handles[slot] = None;
        st.s_reserved -= 1;
        self.check_invariants(&st);
        drop(st);

        self.single_event.set();
    }

    /// `(first_free, b_reserved, s_reserved, batch_running)` under the
    /// mutex, for assertions and teardown checks.
    pub(crate) fn counters(&self) -> (usize, usize, usize, bool) {
        let st = self.lock();
        (st.first_free, st.b_reserved, st.s_reserved, st.batch_running)
    }

    #[inline]
    fn check_invariants(&self, st: &StagingState) {
        debug_assert!(st.first_free <= self.batch_slots);
        debug_assert!(st.b_reserved <= st.first_free);
        if !st.batch_running {
            debug_assert_eq!(st.first_free, st.b_reserved);
        }
        debug_assert_eq!(
            st.s_reserved,
            st.in_use[self.batch_slots..].iter().filter(|&&u| u).count()
        );
        for i in self.batch_slots..SLOT_COUNT {
            debug_assert_eq!(st.in_use[i], st.handles[i].is_some());
        }
    }
}

impl StagingState {
    fn slot(&self, i: usize) -> &[u8] {
        &self.write_buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
    }

    fn slot_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.write_buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
    }
}
