//! Error kinds shared across the pipeline.
//!
//! Per-row and per-shard problems are handled where they occur (defaulted or
//! counted); these variants classify everything that crosses a component
//! boundary. The engine maps an error's kind onto the run's failure policy:
//! `Config`/`Resource` abort the run, `Transport` aborts only at listing
//! level, `Load` never aborts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing integration, bad schedule, bad URL. Fatal at run start.
    #[error("configuration error: {0}")]
    Config(String),

    /// FTP connect/timeout/permission failures.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed row or numeric that could not be defaulted.
    #[error("parse error: {0}")]
    Parse(String),

    /// Bulk loader exit != 0 or HTTP 4xx/5xx from the search store.
    #[error("load error: {0}")]
    Load(String),

    /// A second concurrent run was attempted for the same integration.
    #[error("sync already running for integration {0}")]
    AlreadyRunning(String),

    /// The process died mid-run; reconstructed by startup recovery.
    #[error("sync interrupted: {0}")]
    Interrupted(String),

    /// Out of disk for the scratch directory and similar local failures.
    #[error("resource error: {0}")]
    Resource(String),
}

impl SyncError {
    /// Whether this error aborts the whole run when raised at run level.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Load(_) | SyncError::Parse(_))
    }
}
