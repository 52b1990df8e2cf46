//! # dblwr - Doublewrite Page Durability
//!
//! dblwr is the doublewrite layer of a transactional storage engine: it
//! guarantees that every page written to a data file is recoverable in a
//! consistent state after a host crash or a torn write. Before a page is
//! written to its home location, a copy is made durable in a staging
//! area; on recovery, a torn or zero-filled home page is rewritten from
//! its intact staged twin.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Buffer-pool flusher (embedder)        │
//! ├─────────────────────────────────────────────┤
//! │  Doublewrite: post_batch / flush_buffered /  │
//! │       write_single / completion handling     │
//! ├──────────────────────┬──────────────────────┤
//! │   Staging area       │   Stage backend      │
//! │   (slots, regions,   │   blocks in the sys  │
//! │    events, mutex)    │   tablespace, or the │
//! │                      │   SSD FIFO ring      │
//! ├──────────────────────┴──────────────────────┤
//! │  Ports: FileIo · Tablespaces · PageOracle ·  │
//! │  Checkpoint · BufferPool · SysSpace/MiniTx   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The write path: a flusher posts pages, the batch region fills, a drain
//! writes every staged image to the staging medium and fsyncs it, and
//! only then are the asynchronous home writes issued. Their completions
//! release staging slots; the last one syncs every tablespace and reopens
//! the region.
//!
//! The startup path: [`load_staged_pages`] pulls both staging blocks off
//! the system tablespace, [`repair`] rewrites torn or zeroed home pages
//! from them, and [`Doublewrite::init`] detects (or first-boot creates)
//! the on-disk area.
//!
//! ## Quick Start
//!
//! ```ignore
//! use dblwr::{Config, Doublewrite};
//!
//! // startup, before accepting writes:
//! let staged = dblwr::load_staged_pages(&sys_file)?;
//! dblwr::repair(&staged, &io, &spaces, &oracle)?;
//!
//! let dblwr = Doublewrite::init(ports, Config::default())?;
//!
//! // steady state, from the flusher threads:
//! dblwr.post_batch(&handle)?;
//! dblwr.flush_buffered()?;
//! dblwr.write_single(&hot_handle, true)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and runtime configuration
//! - [`page`]: frame layout, LSN stamps, the default page oracle
//! - [`ports`]: collaborator traits and [`PageHandle`]
//! - [`header`]: the on-disk doublewrite header codec
//! - `bootstrap`: first-boot allocation of the staging blocks
//! - `staging`: the in-memory slot state machine
//! - `backend` / [`ssd`]: where staged images become durable
//! - `dblwr`: the orchestrator
//! - [`recovery`]: startup loader and torn-page repairer

#[macro_use]
mod macros;

mod backend;
mod bootstrap;
mod dblwr;
mod error;
mod staging;
mod sync;

pub mod config;
pub mod header;
pub mod page;
pub mod ports;
pub mod recovery;
pub mod ssd;

pub use config::{Config, SsdCacheConfig};
pub use dblwr::{Doublewrite, StatsSnapshot};
pub use error::DblwrError;
pub use header::DoublewriteHeader;
pub use page::CrcPageOracle;
pub use ports::{
    BufferPool, Checkpoint, Completion, FileIo, FsFile, HandleState, MiniTx, PageHandle,
    PageOracle, Ports, RawFile, SysSpace, Tablespaces,
};
pub use recovery::{load_staged_pages, repair, RepairSummary, StagedPages};
pub use ssd::SsdCache;
