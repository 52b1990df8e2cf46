//! # dblwr Configuration Constants
//!
//! This module centralizes the compile-time constants of the doublewrite
//! subsystem. Constants that depend on each other are co-located and their
//! relationships enforced through compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> PAGE_TRAILER_SIZE (8 bytes, LSN echo + checksum)
//!       │
//!       └─> HEADER_OFFSET (derived: PAGE_SIZE - 200)
//!             The doublewrite header lives near the end of the system
//!             header page, clear of the transaction-system fields that
//!             occupy the front of that page.
//!
//! BLOCK_PAGES (64, pages per staging block)
//!       │
//!       ├─> SLOT_COUNT (derived: 2 * BLOCK_PAGES)
//!       │     Total in-memory staging slots, batch region + single region.
//!       │
//!       └─> DEFAULT_BATCH_SLOTS (120, must stay < SLOT_COUNT)
//!             Slots reserved for batched background flushes; the rest
//!             serve latency-sensitive single-page flushes.
//!
//! EXTENT_PAGES (64, allocation granule of the space manager)
//!       │
//!       └─> Bootstrap pins block1 == EXTENT_PAGES and
//!           block2 == 2 * EXTENT_PAGES exactly; the allocation loop
//!           burns half an extent of slack before the first block so both
//!           blocks begin on extent boundaries.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `0 < DEFAULT_BATCH_SLOTS < SLOT_COUNT` (one region may never swallow
//!    the other; enforced below and re-validated for runtime overrides)
//! 2. `HEADER_SIZE` fits between `HEADER_OFFSET` and the page trailer
//!
//! ## Magic Values
//!
//! The header magic and the space-ids-stored stamp are fixed wire values;
//! changing either orphans every existing doublewrite area.

/// Size of each database page in bytes (16KB). The unit of staging I/O.
pub const PAGE_SIZE: usize = 16384;

/// Trailer bytes at the end of every page: a 4-byte checksum followed by
/// the low half of the page LSN (the torn-write tripwire).
pub const PAGE_TRAILER_SIZE: usize = 8;

/// Pages per on-disk staging block. Two blocks exist, so the staging area
/// spans `2 * BLOCK_PAGES` page slots.
pub const BLOCK_PAGES: usize = 64;

/// Total staging slots across both blocks.
pub const SLOT_COUNT: usize = 2 * BLOCK_PAGES;

/// Allocation granule of the space manager, in pages. Bootstrap requires
/// the two staging blocks to begin at page `EXTENT_PAGES` and
/// `2 * EXTENT_PAGES` of the system tablespace.
pub const EXTENT_PAGES: usize = 64;

/// Default number of slots reserved for batched flushing. The remaining
/// `SLOT_COUNT - DEFAULT_BATCH_SLOTS` slots serve single-page flushes.
pub const DEFAULT_BATCH_SLOTS: usize = 120;

const _: () = assert!(
    DEFAULT_BATCH_SLOTS > 0 && DEFAULT_BATCH_SLOTS < SLOT_COUNT,
    "batch region must leave at least one single-page slot"
);

/// The system tablespace.
pub const SYS_SPACE: u32 = 0;

/// Page of the system tablespace carrying the transaction-system header,
/// which hosts the doublewrite header at `HEADER_OFFSET`.
pub const SYS_HEADER_PAGE: u32 = 5;

/// Byte offset of the doublewrite header within the system header page.
pub const HEADER_OFFSET: usize = PAGE_SIZE - 200;

/// Byte offset of the file-segment anchor slot inside the header.
pub const HEADER_FSEG_OFFSET: usize = HEADER_OFFSET + 4;

/// Size of the serialized doublewrite header.
pub const HEADER_SIZE: usize = 38;

const _: () = assert!(
    HEADER_OFFSET + HEADER_SIZE <= PAGE_SIZE - PAGE_TRAILER_SIZE,
    "doublewrite header must not overlap the page trailer"
);

/// Header magic; the header is valid only when both stored copies match.
pub const MAGIC: u32 = 536_853_855;

/// Stamp recording that staged pages carry their space id. Areas written
/// before tablespace ids existed carry a different value and are upgraded
/// by the recovery loader.
pub const SPACE_IDS_STORED: u32 = 1_783_657_386;

/// The bootstrap allocation loop commits and restarts its mini-transaction
/// after this many page allocations, bounding the number of page latches
/// stacked inside one mini-transaction.
pub const BOOTSTRAP_MTX_BATCH: usize = 16;

/// Buffer-pool page slack demanded by bootstrap on top of the staging
/// allocation itself.
pub const BOOTSTRAP_POOL_SLACK: usize = 100;

/// Sleep between polls while an SSD metadata entry finishes its in-flight
/// I/O (write-back and hash-eviction waits).
pub const SSD_IO_POLL: std::time::Duration = std::time::Duration::from_micros(100);
