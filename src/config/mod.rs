//! # dblwr Configuration Module
//!
//! Compile-time constants live in [`constants`]; the runtime knobs of the
//! subsystem live in [`Config`]. The split keeps the on-disk layout values
//! (page size, block geometry, magics) apart from per-deployment choices
//! (batch region size, SSD cache), which are validated once at init.

pub mod constants;
pub use constants::*;

use std::path::PathBuf;

use eyre::{ensure, Result};

/// Runtime configuration of the doublewrite subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    /// When false, staging is bypassed entirely: posts become direct
    /// target writes and `flush_buffered` degrades to a cross-tablespace
    /// sync.
    pub enabled: bool,
    /// Number of staging slots reserved for batched flushing (`K`).
    /// Must satisfy `0 < K < SLOT_COUNT`.
    pub batch_slots: usize,
    /// Optional SSD staging backend replacing the on-tablespace blocks
    /// for normal-sized pages.
    pub ssd_cache: Option<SsdCacheConfig>,
}

/// Configuration of the optional SSD staging ring.
#[derive(Debug, Clone)]
pub struct SsdCacheConfig {
    /// Ring capacity in pages.
    pub size: usize,
    /// Raw file or device backing the ring. Must accept page-aligned
    /// positioned reads and writes.
    pub path: PathBuf,
    /// When true, pages staged into the ring are not written to their
    /// home tablespaces until eviction write-back (the ring replaces the
    /// target-write step). When false, home writes are issued right after
    /// ring staging and the ring only replaces the staging blocks.
    pub defer_target_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_slots: DEFAULT_BATCH_SLOTS,
            ssd_cache: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.batch_slots > 0 && self.batch_slots < SLOT_COUNT,
            "batch_slots {} out of range: need at least one batch slot and one single-page slot ({} total)",
            self.batch_slots,
            SLOT_COUNT
        );
        if let Some(ssd) = &self.ssd_cache {
            ensure!(ssd.size > 0, "ssd cache size must be non-zero");
        }
        Ok(())
    }

    /// Slots available to single-page flushes.
    pub fn single_slots(&self) -> usize {
        SLOT_COUNT - self.batch_slots
    }
}
