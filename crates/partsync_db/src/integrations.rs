//! Integration records: read side plus the narrow write surface the
//! pipeline owns (status transitions, lastSync snapshot, stats counters).

use anyhow::{Context, Result};
use chrono::Utc;
use partsync_protocol::types::{Integration, IntegrationKind, IntegrationStatus, LastSync};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use crate::fmt_ts;
use crate::models::IntegrationRow;

#[derive(Clone)]
pub struct IntegrationStore {
    pool: Pool<Sqlite>,
}

impl IntegrationStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert or replace a full integration record.
    ///
    /// The CRUD collaborator owns everything except `status`, `lastSync`,
    /// and `stats`; this write path exists for it and for tests.
    pub async fn upsert(&self, integration: &Integration) -> Result<()> {
        let ftp_json = integration
            .ftp
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let schedule_json = serde_json::to_string(&integration.schedule)?;
        let last_sync_json = integration
            .last_sync
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO integrations (
                id, name, kind, ftp_json, schedule_json, status, last_sync_json,
                total_syncs, successful_syncs, failed_syncs, total_records,
                last_sync_records, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                ftp_json = excluded.ftp_json,
                schedule_json = excluded.schedule_json,
                status = excluded.status,
                last_sync_json = excluded.last_sync_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&integration.id)
        .bind(&integration.name)
        .bind(integration.kind.as_str())
        .bind(&ftp_json)
        .bind(&schedule_json)
        .bind(integration.status.as_str())
        .bind(&last_sync_json)
        .bind(integration.stats.total_syncs)
        .bind(integration.stats.successful_syncs)
        .bind(integration.stats.failed_syncs)
        .bind(integration.stats.total_records)
        .bind(integration.stats.last_sync_records)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert integration {}", integration.id))?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Integration>> {
        let row: Option<IntegrationRow> =
            sqlx::query_as("SELECT * FROM integrations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(IntegrationRow::into_domain).transpose()
    }

    /// All integrations with an enabled schedule, regardless of whether the
    /// last run left them active, inactive, or in error.
    pub async fn list_schedulable(&self) -> Result<Vec<Integration>> {
        let rows: Vec<IntegrationRow> = sqlx::query_as(
            "SELECT * FROM integrations WHERE status IN ('active','inactive','error')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut integrations = Vec::new();
        for row in rows {
            let integration = row.into_domain()?;
            if integration.schedule.enabled {
                integrations.push(integration);
            }
        }
        Ok(integrations)
    }

    /// Integrations currently marked `syncing`, for stuck-sync detection.
    pub async fn list_syncing(&self) -> Result<Vec<Integration>> {
        let rows: Vec<IntegrationRow> =
            sqlx::query_as("SELECT * FROM integrations WHERE status = 'syncing'")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(IntegrationRow::into_domain).collect()
    }

    /// The first FTP integration with an enabled schedule; CLI default.
    pub async fn first_enabled_ftp(&self) -> Result<Option<Integration>> {
        let candidates = self.list_schedulable().await?;
        Ok(candidates
            .into_iter()
            .find(|i| i.kind == IntegrationKind::Ftp && i.ftp.is_some()))
    }

    /// Compare-and-swap status transition. Returns false when the row was
    /// not in any of the expected source states, so a concurrent UI edit
    /// cannot be clobbered.
    pub async fn set_status_cas(
        &self,
        id: &str,
        from: &[IntegrationStatus],
        to: IntegrationStatus,
    ) -> Result<bool> {
        let placeholders = vec!["?"; from.len()].join(",");
        let sql = format!(
            "UPDATE integrations SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let affected = query.execute(&self.pool).await?.rows_affected();
        debug!(integration = id, to = %to, swapped = affected > 0, "status transition");
        Ok(affected > 0)
    }

    /// Unconditional status write, for recovery paths.
    pub async fn set_status(&self, id: &str, to: IntegrationStatus) -> Result<()> {
        sqlx::query("UPDATE integrations SET status = ?, updated_at = ? WHERE id = ?")
            .bind(to.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a finished run: lastSync snapshot plus stats counters, updated
    /// atomically in SQL so concurrent edits never lose increments.
    pub async fn record_run(&self, id: &str, last: &LastSync, success: bool) -> Result<()> {
        let last_sync_json = serde_json::to_string(last)?;
        let (success_inc, failure_inc) = if success { (1i64, 0i64) } else { (0, 1) };

        sqlx::query(
            r#"
            UPDATE integrations SET
                last_sync_json = ?,
                total_syncs = total_syncs + 1,
                successful_syncs = successful_syncs + ?,
                failed_syncs = failed_syncs + ?,
                total_records = total_records + ?,
                last_sync_records = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&last_sync_json)
        .bind(success_inc)
        .bind(failure_inc)
        .bind(last.records)
        .bind(last.records)
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
