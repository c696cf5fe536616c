//! Sync history: one durable lifecycle record per run.
//!
//! The store owns every status transition. The engine reports progress and
//! outcomes; it never writes rows directly, so an interrupted process can be
//! reconstructed from here alone.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use partsync_protocol::defaults::{HISTORY_RETENTION_DAYS, STALE_SYNC_SUMMARY, STUCK_SYNC_SECS};
use partsync_protocol::types::{
    FileOutcome, Integration, ProgressUpdate, RecordCounters, SyncStatus, TriggerSource,
};
use partsync_protocol::SyncError;
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};
use uuid::Uuid;

use crate::fmt_ts;
use crate::models::{SyncHistoryRecord, SyncHistoryRow};

/// Final numbers handed over when a run completes.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub records: RecordCounters,
    pub indexed_records: i64,
    pub files: Vec<FileOutcome>,
}

/// Per-status aggregate over a lookback window.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusStats {
    pub status: SyncStatus,
    pub count: i64,
    pub avg_duration_ms: f64,
    pub total_records: i64,
}

#[derive(Clone)]
pub struct SyncHistoryStore {
    pool: Pool<Sqlite>,
}

impl SyncHistoryStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create a `pending`/`queued` record for a new run.
    ///
    /// At most one non-terminal record may exist per integration. When one
    /// already does, a `cancelled` record is written for the rejected
    /// attempt and `SyncError::AlreadyRunning` is returned.
    pub async fn create(
        &self,
        integration: &Integration,
        triggered_by: TriggerSource,
    ) -> Result<SyncHistoryRecord> {
        let mut tx = self.pool.begin().await?;

        let running: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM sync_history
            WHERE integration_id = ? AND status IN ('pending','running')
            LIMIT 1
            "#,
        )
        .bind(&integration.id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        if let Some(running_id) = running {
            // Record the rejected attempt, then refuse it.
            sqlx::query(
                r#"
                INSERT INTO sync_history (
                    id, integration_id, integration_name, integration_kind,
                    status, phase, triggered_by, started_at, completed_at,
                    duration_ms, error_summary
                )
                VALUES (?, ?, ?, ?, 'cancelled', 'done', ?, ?, ?, 0, ?)
                "#,
            )
            .bind(&id)
            .bind(&integration.id)
            .bind(&integration.name)
            .bind(integration.kind.as_str())
            .bind(triggered_by.as_str())
            .bind(fmt_ts(now))
            .bind(fmt_ts(now))
            .bind(format!("Sync already in progress (run {})", running_id))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            warn!(
                integration = %integration.id,
                running = %running_id,
                "rejected concurrent sync"
            );
            return Err(SyncError::AlreadyRunning(integration.id.clone()).into());
        }

        sqlx::query(
            r#"
            INSERT INTO sync_history (
                id, integration_id, integration_name, integration_kind,
                status, phase, triggered_by, started_at
            )
            VALUES (?, ?, ?, ?, 'pending', 'queued', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&integration.id)
        .bind(&integration.name)
        .bind(integration.kind.as_str())
        .bind(triggered_by.as_str())
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let record = self
            .get(&id)
            .await?
            .context("History record vanished after insert")?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SyncHistoryRecord>> {
        let row: Option<SyncHistoryRow> =
            sqlx::query_as("SELECT * FROM sync_history WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(SyncHistoryRow::into_domain).transpose()
    }

    /// pending -> running.
    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_history SET status = 'running' WHERE id = ? AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Coalesce a throttled engine emission into the record.
    pub async fn update_progress(&self, id: &str, progress: &ProgressUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_history SET
                phase = ?,
                records_processed = MAX(records_processed, ?),
                records_inserted = MAX(records_inserted, ?)
            WHERE id = ? AND status IN ('pending','running')
            "#,
        )
        .bind(progress.phase.as_str())
        .bind(progress.records_processed)
        .bind(progress.records_inserted)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the per-file outcome list.
    pub async fn set_files(&self, id: &str, files: &[FileOutcome]) -> Result<()> {
        sqlx::query("UPDATE sync_history SET files_json = ? WHERE id = ?")
            .bind(serde_json::to_string(files)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append one line to the error log.
    pub async fn append_error(&self, id: &str, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let errors_json: Option<String> =
            sqlx::query_scalar("SELECT errors_json FROM sync_history WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(errors_json) = errors_json else {
            tx.commit().await?;
            return Ok(());
        };

        let mut errors: Vec<String> = serde_json::from_str(&errors_json).unwrap_or_default();
        errors.push(message.to_string());

        sqlx::query("UPDATE sync_history SET errors_json = ? WHERE id = ?")
            .bind(serde_json::to_string(&errors)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Terminal transition to `completed` with final counters.
    pub async fn mark_completed(&self, id: &str, summary: &RunSummary) -> Result<()> {
        let (now, duration_ms) = self.terminal_timing(id).await?;

        sqlx::query(
            r#"
            UPDATE sync_history SET
                status = 'completed',
                phase = 'done',
                completed_at = ?,
                duration_ms = ?,
                files_json = ?,
                records_total = ?,
                records_processed = ?,
                records_inserted = ?,
                records_updated = ?,
                records_skipped = ?,
                records_failed = ?,
                indexed_records = ?
            WHERE id = ? AND status IN ('pending','running')
            "#,
        )
        .bind(fmt_ts(now))
        .bind(duration_ms)
        .bind(serde_json::to_string(&summary.files)?)
        .bind(summary.records.total)
        .bind(summary.records.processed)
        .bind(summary.records.inserted)
        .bind(summary.records.updated)
        .bind(summary.records.skipped)
        .bind(summary.records.failed)
        .bind(summary.indexed_records)
        .bind(id)
        .execute(&self.pool)
        .await?;

        info!(record = id, records = summary.records.processed, "sync completed");
        Ok(())
    }

    /// Terminal transition to `failed` with an error summary.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.append_error(id, error).await?;
        let (now, duration_ms) = self.terminal_timing(id).await?;

        sqlx::query(
            r#"
            UPDATE sync_history SET
                status = 'failed', phase = 'done', completed_at = ?,
                duration_ms = ?, error_summary = ?
            WHERE id = ? AND status IN ('pending','running')
            "#,
        )
        .bind(fmt_ts(now))
        .bind(duration_ms)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition to `cancelled`, for runs rejected before they
    /// did any work (e.g. a concurrent run already holds the integration).
    pub async fn mark_cancelled(&self, id: &str, reason: &str) -> Result<()> {
        let (now, duration_ms) = self.terminal_timing(id).await?;

        sqlx::query(
            r#"
            UPDATE sync_history SET
                status = 'cancelled', phase = 'done', completed_at = ?,
                duration_ms = ?, error_summary = ?
            WHERE id = ? AND status IN ('pending','running')
            "#,
        )
        .bind(fmt_ts(now))
        .bind(duration_ms)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition to `interrupted`, used by recovery paths.
    pub async fn mark_interrupted(&self, id: &str, reason: &str) -> Result<()> {
        let (now, duration_ms) = self.terminal_timing(id).await?;

        sqlx::query(
            r#"
            UPDATE sync_history SET
                status = 'interrupted', phase = 'done', completed_at = ?,
                duration_ms = ?, error_summary = ?
            WHERE id = ? AND status IN ('pending','running')
            "#,
        )
        .bind(fmt_ts(now))
        .bind(duration_ms)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-transition every non-terminal record older than the stuck-sync
    /// threshold to `interrupted`. Idempotent: once nothing is stale, this
    /// is a no-op. Returns the number of records transitioned.
    pub async fn mark_stale_as_interrupted(&self) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(STUCK_SYNC_SECS);

        let affected = sqlx::query(
            r#"
            UPDATE sync_history SET
                status = 'interrupted',
                phase = 'done',
                completed_at = ?1,
                duration_ms = CAST((julianday(?1) - julianday(started_at)) * 86400000.0 AS INTEGER),
                error_summary = ?2
            WHERE status IN ('pending','running') AND started_at < ?3
            "#,
        )
        .bind(fmt_ts(now))
        .bind(STALE_SYNC_SUMMARY)
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            warn!(count = affected, "marked stale syncs as interrupted");
        }
        Ok(affected)
    }

    /// The unique non-terminal record for an integration, if any.
    pub async fn running_for(&self, integration_id: &str) -> Result<Option<SyncHistoryRecord>> {
        let row: Option<SyncHistoryRow> = sqlx::query_as(
            r#"
            SELECT * FROM sync_history
            WHERE integration_id = ? AND status IN ('pending','running')
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncHistoryRow::into_domain).transpose()
    }

    pub async fn recent_by_integration(
        &self,
        integration_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncHistoryRecord>> {
        let rows: Vec<SyncHistoryRow> = sqlx::query_as(
            r#"
            SELECT * FROM sync_history
            WHERE integration_id = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(integration_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncHistoryRow::into_domain).collect()
    }

    /// Aggregate runs by status over the last `days` days.
    pub async fn stats(&self, integration_id: &str, days: i64) -> Result<Vec<StatusStats>> {
        let cutoff = Utc::now() - Duration::days(days);

        let rows: Vec<(String, i64, Option<f64>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), AVG(duration_ms), SUM(records_processed)
            FROM sync_history
            WHERE integration_id = ? AND started_at >= ?
            GROUP BY status
            "#,
        )
        .bind(integration_id)
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count, avg, total)| {
                Ok(StatusStats {
                    status: status.parse::<SyncStatus>().map_err(anyhow::Error::msg)?,
                    count,
                    avg_duration_ms: avg.unwrap_or(0.0),
                    total_records: total.unwrap_or(0),
                })
            })
            .collect()
    }

    /// Drop records past the retention horizon. Returns rows deleted.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(HISTORY_RETENTION_DAYS);
        let affected = sqlx::query("DELETE FROM sync_history WHERE started_at < ?")
            .bind(fmt_ts(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected > 0 {
            info!(count = affected, "purged expired sync history");
        }
        Ok(affected)
    }

    /// completed_at / duration pair for a terminal transition, clamped so
    /// `duration_ms >= 0` even against a skewed clock.
    async fn terminal_timing(&self, id: &str) -> Result<(DateTime<Utc>, i64)> {
        let started_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT started_at FROM sync_history WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let now = Utc::now();
        let duration_ms = started_at
            .map(|started| (now - started).num_milliseconds().max(0))
            .unwrap_or(0);
        Ok((now, duration_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use partsync_protocol::types::{FileStatus, IntegrationKind, SyncPhase};

    fn sample_integration(id: &str) -> Integration {
        Integration {
            id: id.to_string(),
            name: "Supplier".to_string(),
            kind: IntegrationKind::Ftp,
            ftp: None,
            schedule: Default::default(),
            status: Default::default(),
            last_sync: None,
            stats: Default::default(),
        }
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let store = SyncHistoryStore::new(test_pool().await);
        let integration = sample_integration("i1");

        let record = store
            .create(&integration, TriggerSource::Manual)
            .await
            .unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.phase, SyncPhase::Queued);

        store.mark_running(&record.id).await.unwrap();

        let summary = RunSummary {
            records: RecordCounters {
                total: 3,
                processed: 2,
                inserted: 2,
                skipped: 1,
                ..Default::default()
            },
            indexed_records: 2,
            files: vec![FileOutcome {
                name: "parts_DS1_part01.csv".to_string(),
                status: FileStatus::Processed,
                records: 2,
                error: None,
            }],
        };
        store.mark_completed(&record.id, &summary).await.unwrap();

        let finished = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(finished.status, SyncStatus::Completed);
        assert_eq!(finished.records.processed, 2);
        assert_eq!(finished.indexed_records, 2);
        assert_eq!(finished.files.len(), 1);

        // duration_ms = completed_at - started_at, never negative.
        let completed_at = finished.completed_at.unwrap();
        assert!(completed_at >= finished.started_at);
        let expected = (completed_at - finished.started_at).num_milliseconds();
        assert_eq!(finished.duration_ms.unwrap(), expected.max(0));
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected_as_cancelled() {
        let store = SyncHistoryStore::new(test_pool().await);
        let integration = sample_integration("i1");

        let first = store
            .create(&integration, TriggerSource::Scheduler)
            .await
            .unwrap();

        let err = store
            .create(&integration, TriggerSource::Manual)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));

        // Invariant: exactly one non-terminal record.
        let running = store.running_for("i1").await.unwrap().unwrap();
        assert_eq!(running.id, first.id);

        let recent = store.recent_by_integration("i1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent
            .iter()
            .any(|r| r.status == SyncStatus::Cancelled && r.id != first.id));
    }

    #[tokio::test]
    async fn stale_runs_are_interrupted_idempotently() {
        let pool = test_pool().await;
        let store = SyncHistoryStore::new(pool.clone());
        let integration = sample_integration("i1");

        let record = store
            .create(&integration, TriggerSource::Scheduler)
            .await
            .unwrap();
        store.mark_running(&record.id).await.unwrap();

        // Backdate the run to two hours ago.
        let old = fmt_ts(Utc::now() - Duration::hours(2));
        sqlx::query("UPDATE sync_history SET started_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&record.id)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(store.mark_stale_as_interrupted().await.unwrap(), 1);

        let stale = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stale.status, SyncStatus::Interrupted);
        assert_eq!(stale.error_summary.as_deref(), Some(STALE_SYNC_SUMMARY));
        assert!(stale.completed_at.is_some());
        assert!(stale.duration_ms.unwrap() >= 2 * 3_600 * 1_000);

        // Idempotent: nothing left to transition.
        assert_eq!(store.mark_stale_as_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_runs_survive_the_stale_sweep() {
        let store = SyncHistoryStore::new(test_pool().await);
        let record = store
            .create(&sample_integration("i1"), TriggerSource::Scheduler)
            .await
            .unwrap();
        store.mark_running(&record.id).await.unwrap();

        assert_eq!(store.mark_stale_as_interrupted().await.unwrap(), 0);
        let still = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(still.status, SyncStatus::Running);
    }

    #[tokio::test]
    async fn stats_aggregates_by_status() {
        let store = SyncHistoryStore::new(test_pool().await);
        let integration = sample_integration("i1");

        for records in [10i64, 20] {
            let record = store
                .create(&integration, TriggerSource::Scheduler)
                .await
                .unwrap();
            store.mark_running(&record.id).await.unwrap();
            let summary = RunSummary {
                records: RecordCounters {
                    total: records,
                    processed: records,
                    inserted: records,
                    ..Default::default()
                },
                ..Default::default()
            };
            store.mark_completed(&record.id, &summary).await.unwrap();
        }

        let failed = store
            .create(&integration, TriggerSource::Manual)
            .await
            .unwrap();
        store.mark_running(&failed.id).await.unwrap();
        store.mark_failed(&failed.id, "listing failed").await.unwrap();

        let mut stats = store.stats("i1", 7).await.unwrap();
        stats.sort_by_key(|s| s.status.as_str());

        let completed = stats
            .iter()
            .find(|s| s.status == SyncStatus::Completed)
            .unwrap();
        assert_eq!(completed.count, 2);
        assert_eq!(completed.total_records, 30);

        let failures = stats
            .iter()
            .find(|s| s.status == SyncStatus::Failed)
            .unwrap();
        assert_eq!(failures.count, 1);
    }

    #[tokio::test]
    async fn failed_runs_carry_summary_and_log() {
        let store = SyncHistoryStore::new(test_pool().await);
        let record = store
            .create(&sample_integration("i1"), TriggerSource::Api)
            .await
            .unwrap();
        store.mark_running(&record.id).await.unwrap();
        store.append_error(&record.id, "file x failed").await.unwrap();
        store.mark_failed(&record.id, "fatal: disk full").await.unwrap();

        let failed = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.error_summary.as_deref(), Some("fatal: disk full"));
        assert_eq!(
            failed.errors,
            vec!["file x failed".to_string(), "fatal: disk full".to_string()]
        );
    }
}
