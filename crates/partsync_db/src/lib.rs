//! PartSync state store.
//!
//! Integrations, sync history, and the inter-process sync-request queue live
//! in one SQLite database accessed through sqlx. Timestamps are stored as
//! RFC 3339 UTC text with millisecond precision so that string comparison
//! orders the same way as time comparison.

pub mod history;
pub mod integrations;
pub mod models;
pub mod requests;
pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

pub use history::{RunSummary, StatusStats, SyncHistoryStore};
pub use integrations::IntegrationStore;
pub use models::{SyncHistoryRecord, SyncRequest};
pub use requests::{QueueStats, SyncRequestQueue};

/// Open (and create if missing) the state database at the given URL.
///
/// Accepts `sqlite:` URLs or bare filesystem paths; `sqlite::memory:` works
/// for tests.
pub async fn open(url: &str) -> Result<Pool<Sqlite>> {
    let url = if url.starts_with("sqlite:") {
        url.to_string()
    } else {
        format!("sqlite://{}", url)
    };

    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("Invalid state store URL: {}", url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open state store: {}", url))?;

    schema::init_schema(&pool).await?;
    Ok(pool)
}

/// Format a timestamp the way every table stores it.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// In-memory pool for tests. A single connection, because every new
/// `:memory:` connection is a fresh empty database.
pub async fn memory_pool() -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory state store")?;
    schema::init_schema(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> Pool<Sqlite> {
    memory_pool().await.unwrap()
}
