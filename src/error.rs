//! Boundary errors of the doublewrite subsystem.
//!
//! These are the failures an embedding engine's startup path is expected
//! to match on. Everything else flows through `eyre` with context, and the
//! two intentionally-fatal conditions (a page failing validation on its
//! way to disk, a completion for an unknown handle) panic after dumping
//! diagnostics rather than surfacing here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DblwrError {
    /// Bootstrap needs `(2B + E/2 + 100)` pages of buffer pool to create
    /// the staging area without starving itself.
    #[error(
        "cannot create doublewrite area: buffer pool holds {actual} bytes, \
         {required} required; increase the buffer pool size"
    )]
    BootstrapInsufficientBuffer { required: usize, actual: usize },

    /// The system tablespace could not supply the segment or pages for the
    /// staging blocks.
    #[error("cannot create doublewrite area: out of space in the system tablespace")]
    BootstrapOutOfSpace,

    /// Both the data-file page and its staged twin are corrupt; nothing
    /// can restore the page.
    #[error(
        "page {page_no} of tablespace {space} is corrupt and so is its staged copy; \
         the page cannot be recovered (force_recovery=6 skips doublewrite repair)"
    )]
    StagedAndTargetCorrupt { space: u32, page_no: u32 },

    /// A staged page addresses a location beyond the current size of its
    /// tablespace. Benign: logged and skipped by the repairer.
    #[error("staged page {page_no} lies outside tablespace {space} bounds")]
    RecoveryOutOfBounds { space: u32, page_no: u32 },

    /// A staged page belongs to a tablespace that is no longer mounted.
    /// Benign: logged and skipped by the repairer.
    #[error("staged page {page_no} belongs to unknown tablespace {space}")]
    RecoveryUnknownTablespace { space: u32, page_no: u32 },
}
