//! State store schema (DDL).

use anyhow::{Context, Result};
use sqlx::{Pool, Sqlite};

/// Create all state tables and indexes if they do not exist.
pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS integrations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'ftp',
            ftp_json TEXT,
            schedule_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active','inactive','error','syncing')),
            last_sync_json TEXT,
            total_syncs INTEGER NOT NULL DEFAULT 0,
            successful_syncs INTEGER NOT NULL DEFAULT 0,
            failed_syncs INTEGER NOT NULL DEFAULT 0,
            total_records INTEGER NOT NULL DEFAULT 0,
            last_sync_records INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_integrations_status ON integrations(status);

        CREATE TABLE IF NOT EXISTS sync_history (
            id TEXT PRIMARY KEY,
            integration_id TEXT NOT NULL,
            integration_name TEXT NOT NULL,
            integration_kind TEXT NOT NULL DEFAULT 'ftp',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','running','completed','failed','interrupted','cancelled')),
            phase TEXT NOT NULL DEFAULT 'queued',
            triggered_by TEXT NOT NULL DEFAULT 'manual',
            started_at TEXT NOT NULL,
            completed_at TEXT,
            duration_ms INTEGER,
            files_json TEXT NOT NULL DEFAULT '[]',
            records_total INTEGER NOT NULL DEFAULT 0,
            records_processed INTEGER NOT NULL DEFAULT 0,
            records_inserted INTEGER NOT NULL DEFAULT 0,
            records_updated INTEGER NOT NULL DEFAULT 0,
            records_skipped INTEGER NOT NULL DEFAULT 0,
            records_failed INTEGER NOT NULL DEFAULT 0,
            indexed_records INTEGER NOT NULL DEFAULT 0,
            errors_json TEXT NOT NULL DEFAULT '[]',
            error_summary TEXT
        );
        CREATE INDEX IF NOT EXISTS ix_history_integration
            ON sync_history(integration_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS ix_history_status ON sync_history(status);
        CREATE INDEX IF NOT EXISTS ix_history_started ON sync_history(started_at);

        CREATE TABLE IF NOT EXISTS sync_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            integration_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','processing','stale','done','failed')),
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            completed_at TEXT,
            source TEXT NOT NULL DEFAULT 'api',
            sync_history_id TEXT,
            progress_json TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS ix_requests_status ON sync_requests(status, created_at);
        CREATE INDEX IF NOT EXISTS ix_requests_integration ON sync_requests(integration_id);
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to initialize state store schema")?;

    Ok(())
}
