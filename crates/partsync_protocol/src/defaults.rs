//! Canonical default values shared across the scheduler and engine.

/// Maximum concurrent FTP downloads.
pub const FTP_PARALLEL: usize = 30;
/// Download attempts per file before recording a failure.
pub const FTP_RETRIES: u32 = 3;
/// Per-attempt FTP timeout (seconds).
pub const FTP_TIMEOUT_SECS: u64 = 60;
/// Linear backoff unit between FTP attempts (seconds).
pub const FTP_BACKOFF_SECS: u64 = 1;

/// Maximum concurrent CSV transform workers (also bounded by core count).
pub const TRANSFORM_PARALLEL: usize = 24;

/// Shards loaded into the primary store in parallel.
pub const MONGO_CONCURRENT: usize = 4;
/// Insertion workers handed to the external bulk loader per shard.
pub const MONGO_WORKERS: usize = 6;
/// Batch size for the in-process fallback bulk insert.
pub const MONGO_FALLBACK_BATCH: usize = 50_000;
/// Primary store connection timeout (seconds).
pub const MONGO_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Primary collection name.
pub const PARTS_COLLECTION: &str = "parts";

/// Concurrent search-shard bulk streams.
pub const ES_BULK_CONCURRENT: usize = 8;
/// Action/document pairs per bulk POST (two body lines each).
pub const ES_CHUNK_PAIRS: usize = 15_000;
/// In-flight chunk POSTs within a single shard stream.
pub const ES_CHUNKS_IN_FLIGHT: usize = 4;
/// Per-chunk bulk HTTP timeout (seconds).
pub const ES_BULK_TIMEOUT_SECS: u64 = 300;
/// Default search alias name.
pub const DEFAULT_SEARCH_ALIAS: &str = "automotive_parts";

/// Default remote file-name glob.
pub const DEFAULT_FILE_GLOB: &str = "*.csv";
/// Default FTP control port.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Default currency code for listings without one.
pub const DEFAULT_CURRENCY: &str = "AED";
/// Default stock label for listings without one.
pub const DEFAULT_STOCK: &str = "unknown";
/// Default weight unit for listings without one.
pub const DEFAULT_WEIGHT_UNIT: &str = "kg";

/// A non-terminal run older than this is stale ("stuck sync").
pub const STUCK_SYNC_SECS: i64 = 3_600;
/// Grace period added to the schedule interval before a sync counts overdue.
pub const OVERDUE_GRACE_SECS: i64 = 2 * 3_600;
/// Scheduler health-check cadence (seconds).
pub const HEALTH_CHECK_SECS: u64 = 300;
/// Delay before startup recovery runs (seconds).
pub const STARTUP_RECOVERY_DELAY_SECS: u64 = 30;
/// Stagger between recovery triggers (seconds).
pub const RECOVERY_STAGGER_SECS: u64 = 1;
/// Sync history retention horizon (days).
pub const HISTORY_RETENTION_DAYS: i64 = 90;

/// Error summary stamped onto stale runs, verbatim.
pub const STALE_SYNC_SUMMARY: &str = "Sync stale - marked as interrupted";

/// Minimum interval between throttled progress emissions (milliseconds).
pub const PROGRESS_THROTTLE_MS: u64 = 2_000;
