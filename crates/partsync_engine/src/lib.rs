//! PartSync pipeline engine.
//!
//! One run: clean scratch -> FTP fetch -> (transform || primary load ||
//! search load) -> finalize. The engine owns the scratch directory for the
//! duration of a run and reports progress through a throttled callback; all
//! lifecycle writes go through the history store.

pub mod config;
pub mod ftp;
pub mod pipeline;
pub mod primary;
pub mod progress;
pub mod scratch;
pub mod search;
pub mod transform;

pub use config::{EngineConfig, PoolLimits};
pub use ftp::{FetchReport, FtpFetcher};
pub use pipeline::{RunOutcome, SyncPipeline};
pub use primary::PrimaryStore;
pub use progress::{ProgressCallback, ProgressThrottle};
pub use search::SearchStore;
pub use transform::{transform_file, TransformContext, TransformOutput};
