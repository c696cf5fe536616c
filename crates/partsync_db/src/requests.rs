//! Inter-process sync-request queue.
//!
//! Used when `SYNC_USE_WORKER` routes runs to an out-of-process worker:
//! the scheduler writes a pending row, a worker claims it atomically via
//! UPDATE ... WHERE, updates progress while running, then flips it terminal.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use partsync_protocol::defaults::STUCK_SYNC_SECS;
use partsync_protocol::types::{ProgressUpdate, TriggerSource};
use partsync_protocol::SyncError;
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

use crate::fmt_ts;
use crate::models::{SyncRequest, SyncRequestRow};

#[derive(Clone)]
pub struct SyncRequestQueue {
    pool: Pool<Sqlite>,
}

impl SyncRequestQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Enqueue a request. A pre-existing non-terminal row for the same
    /// integration aborts the submission.
    pub async fn submit(
        &self,
        integration_id: &str,
        source: TriggerSource,
        sync_history_id: &str,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM sync_requests
            WHERE integration_id = ? AND status IN ('pending','processing')
            LIMIT 1
            "#,
        )
        .bind(integration_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = existing {
            tx.commit().await?;
            warn!(
                integration = integration_id,
                request = existing,
                "sync request already queued"
            );
            return Err(SyncError::AlreadyRunning(integration_id.to_string()).into());
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_requests (integration_id, status, created_at, source, sync_history_id)
            VALUES (?, 'pending', ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(integration_id)
        .bind(fmt_ts(Utc::now()))
        .bind(source.as_str())
        .bind(sync_history_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(integration = integration_id, request = id, "sync request queued");
        Ok(id)
    }

    /// Atomically claim the oldest pending request, flipping it to
    /// `processing`. Returns None when the queue is empty.
    pub async fn claim(&self) -> Result<Option<SyncRequest>> {
        let mut tx = self.pool.begin().await?;

        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM sync_requests
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            tx.commit().await?;
            return Ok(None);
        };

        let affected = sqlx::query(
            r#"
            UPDATE sync_requests
            SET status = 'processing', claimed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            // Another worker claimed it between the select and the update.
            tx.commit().await?;
            return Ok(None);
        }

        let row: SyncRequestRow = sqlx::query_as("SELECT * FROM sync_requests WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(row.into_domain()?))
    }

    pub async fn update_progress(&self, id: i64, progress: &ProgressUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE sync_requests SET progress_json = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(serde_json::to_string(progress)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sync_requests SET status = 'done', completed_at = ? WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_requests SET status = 'failed', completed_at = ?, error = ? WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark non-terminal requests older than the stuck-sync threshold as
    /// `stale`. Runs at scheduler startup and on each health tick.
    pub async fn mark_stale(&self) -> Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - Duration::seconds(STUCK_SYNC_SECS);

        let affected = sqlx::query(
            r#"
            UPDATE sync_requests
            SET status = 'stale', completed_at = ?
            WHERE status IN ('pending','processing') AND created_at < ?
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            warn!(count = affected, "marked stale sync requests");
        }
        Ok(affected)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'done') as done,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'stale') as stale
            FROM sync_requests
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    pub stale: i64,
}
