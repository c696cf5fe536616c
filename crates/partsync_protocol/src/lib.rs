//! PartSync protocol types
//!
//! Canonical data model shared by the scheduler (control plane) and the
//! pipeline engine (data plane). Everything that crosses a crate boundary or
//! is persisted lives here: integration records, part listings, sync history
//! shapes, progress payloads, and the canonical default values.

pub mod defaults;
pub mod error;
pub mod types;

pub use error::SyncError;
pub use types::{
    FileOutcome, FileStatus, FtpConfig, Integration, IntegrationKind, IntegrationStats,
    IntegrationStatus, LastSync, PartListing, ProgressUpdate, RecordCounters, RequestStatus,
    SyncFrequency, SyncPhase, SyncSchedule, SyncStatus, TriggerSource,
};
