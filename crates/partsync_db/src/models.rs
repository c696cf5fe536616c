//! Row types for the state store.
//!
//! Rows keep enum columns as TEXT and JSON columns as serialized strings;
//! conversion to the protocol types happens at the boundary so bad data
//! surfaces as an error instead of a panic.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use partsync_protocol::types::{
    FileOutcome, FtpConfig, Integration, IntegrationKind, IntegrationStats, IntegrationStatus,
    LastSync, RecordCounters, RequestStatus, SyncPhase, SyncSchedule, SyncStatus, TriggerSource,
};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct IntegrationRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub ftp_json: Option<String>,
    pub schedule_json: String,
    pub status: String,
    pub last_sync_json: Option<String>,
    pub total_syncs: i64,
    pub successful_syncs: i64,
    pub failed_syncs: i64,
    pub total_records: i64,
    pub last_sync_records: i64,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRow {
    pub fn into_domain(self) -> Result<Integration> {
        let ftp: Option<FtpConfig> = match self.ftp_json.as_deref() {
            Some(json) if !json.is_empty() => Some(
                serde_json::from_str(json)
                    .with_context(|| format!("Bad ftp config for integration {}", self.id))?,
            ),
            _ => None,
        };
        let schedule: SyncSchedule = serde_json::from_str(&self.schedule_json)
            .with_context(|| format!("Bad schedule for integration {}", self.id))?;
        let last_sync: Option<LastSync> = match self.last_sync_json.as_deref() {
            Some(json) if !json.is_empty() => Some(
                serde_json::from_str(json)
                    .with_context(|| format!("Bad lastSync for integration {}", self.id))?,
            ),
            _ => None,
        };

        Ok(Integration {
            kind: self
                .kind
                .parse::<IntegrationKind>()
                .map_err(anyhow::Error::msg)?,
            status: self
                .status
                .parse::<IntegrationStatus>()
                .map_err(anyhow::Error::msg)?,
            id: self.id,
            name: self.name,
            ftp,
            schedule,
            last_sync,
            stats: IntegrationStats {
                total_syncs: self.total_syncs,
                successful_syncs: self.successful_syncs,
                failed_syncs: self.failed_syncs,
                total_records: self.total_records,
                last_sync_records: self.last_sync_records,
            },
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncHistoryRow {
    pub id: String,
    pub integration_id: String,
    pub integration_name: String,
    pub integration_kind: String,
    pub status: String,
    pub phase: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub files_json: String,
    pub records_total: i64,
    pub records_processed: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub records_skipped: i64,
    pub records_failed: i64,
    pub indexed_records: i64,
    pub errors_json: String,
    pub error_summary: Option<String>,
}

/// One durable lifecycle record per run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncHistoryRecord {
    pub id: String,
    pub integration_id: String,
    pub integration_name: String,
    pub integration_kind: IntegrationKind,
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub triggered_by: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub files: Vec<FileOutcome>,
    pub records: RecordCounters,
    pub indexed_records: i64,
    pub errors: Vec<String>,
    pub error_summary: Option<String>,
}

impl SyncHistoryRow {
    pub fn into_domain(self) -> Result<SyncHistoryRecord> {
        let files: Vec<FileOutcome> = serde_json::from_str(&self.files_json)
            .with_context(|| format!("Bad files list on history record {}", self.id))?;
        let errors: Vec<String> = serde_json::from_str(&self.errors_json)
            .with_context(|| format!("Bad error log on history record {}", self.id))?;

        Ok(SyncHistoryRecord {
            status: self
                .status
                .parse::<SyncStatus>()
                .map_err(anyhow::Error::msg)?,
            phase: self.phase.parse::<SyncPhase>().map_err(anyhow::Error::msg)?,
            triggered_by: self
                .triggered_by
                .parse::<TriggerSource>()
                .map_err(anyhow::Error::msg)?,
            integration_kind: self
                .integration_kind
                .parse::<IntegrationKind>()
                .map_err(anyhow::Error::msg)?,
            id: self.id,
            integration_id: self.integration_id,
            integration_name: self.integration_name,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            files,
            records: RecordCounters {
                total: self.records_total,
                processed: self.records_processed,
                inserted: self.records_inserted,
                updated: self.records_updated,
                skipped: self.records_skipped,
                failed: self.records_failed,
            },
            indexed_records: self.indexed_records,
            errors,
            error_summary: self.error_summary,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncRequestRow {
    pub id: i64,
    pub integration_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source: String,
    pub sync_history_id: Option<String>,
    pub progress_json: Option<String>,
    pub error: Option<String>,
}

/// Queue entry for the out-of-process worker mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub id: i64,
    pub integration_id: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source: TriggerSource,
    pub sync_history_id: Option<String>,
    pub progress: Option<Value>,
    pub error: Option<String>,
}

impl SyncRequestRow {
    pub fn into_domain(self) -> Result<SyncRequest> {
        let progress = match self.progress_json.as_deref() {
            Some(json) if !json.is_empty() => Some(
                serde_json::from_str(json)
                    .with_context(|| format!("Bad progress on sync request {}", self.id))?,
            ),
            _ => None,
        };

        Ok(SyncRequest {
            status: self
                .status
                .parse::<RequestStatus>()
                .map_err(anyhow::Error::msg)?,
            source: self
                .source
                .parse::<TriggerSource>()
                .map_err(anyhow::Error::msg)?,
            id: self.id,
            integration_id: self.integration_id,
            created_at: self.created_at,
            claimed_at: self.claimed_at,
            completed_at: self.completed_at,
            sync_history_id: self.sync_history_id,
            progress,
            error: self.error,
        })
    }
}
