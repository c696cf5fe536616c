//! Canonical data model for integrations, listings, and sync lifecycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::defaults;

// ============================================================================
// Integration
// ============================================================================

/// Transport used to pull catalog files. Only `ftp` is exercised by the
/// pipeline; the other kinds are carried for the CRUD collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    #[default]
    Ftp,
    Api,
    Sheets,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Ftp => "ftp",
            IntegrationKind::Api => "api",
            IntegrationKind::Sheets => "sheets",
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntegrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ftp" => Ok(IntegrationKind::Ftp),
            "api" => Ok(IntegrationKind::Api),
            "sheets" => Ok(IntegrationKind::Sheets),
            _ => Err(format!("invalid integration kind: '{}'", s)),
        }
    }
}

/// Integration lifecycle status. Mutated by the pipeline only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    #[default]
    Active,
    Inactive,
    Error,
    Syncing,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Active => "active",
            IntegrationStatus::Inactive => "inactive",
            IntegrationStatus::Error => "error",
            IntegrationStatus::Syncing => "syncing",
        }
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(IntegrationStatus::Active),
            "inactive" => Ok(IntegrationStatus::Inactive),
            "error" => Ok(IntegrationStatus::Error),
            "syncing" => Ok(IntegrationStatus::Syncing),
            _ => Err(format!("invalid integration status: '{}'", s)),
        }
    }
}

/// FTP connection settings for one integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Implicit TLS on the control connection.
    #[serde(default)]
    pub secure: bool,
    /// Remote directory holding the catalog files.
    #[serde(default)]
    pub remote_path: String,
    /// File-name glob applied to the directory listing.
    #[serde(default = "default_file_glob")]
    pub file_glob: String,
}

fn default_ftp_port() -> u16 {
    defaults::DEFAULT_FTP_PORT
}

fn default_file_glob() -> String {
    defaults::DEFAULT_FILE_GLOB.to_string()
}

/// How often an integration syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SyncFrequency {
    #[default]
    Manual,
    Hourly,
    #[serde(alias = "everyNhours", alias = "every_n_hours")]
    EveryNHours,
    Daily,
    Weekly,
    Monthly,
}

impl SyncFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFrequency::Manual => "manual",
            SyncFrequency::Hourly => "hourly",
            SyncFrequency::EveryNHours => "everyNHours",
            SyncFrequency::Daily => "daily",
            SyncFrequency::Weekly => "weekly",
            SyncFrequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for SyncFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Schedule configuration for one integration.
///
/// `days_of_week` uses 0 = Sunday .. 6 = Saturday. `time_of_day` is "HH:MM"
/// in the configured timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncSchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub frequency: SyncFrequency,
    /// Hour step for `everyNHours`, clamped to 1..=12.
    #[serde(default)]
    pub every_hours: Option<u8>,
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    #[serde(default)]
    pub day_of_month: Option<u8>,
    /// IANA timezone name; UTC when absent or unparseable.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl SyncSchedule {
    /// Nominal interval between runs, used by the overdue scan.
    /// `None` for manual schedules, which are never due.
    pub fn interval(&self) -> Option<Duration> {
        match self.frequency {
            SyncFrequency::Manual => None,
            SyncFrequency::Hourly => Some(Duration::hours(1)),
            SyncFrequency::EveryNHours => {
                let n = self.every_hours.unwrap_or(1).clamp(1, 12);
                Some(Duration::hours(n as i64))
            }
            SyncFrequency::Daily => Some(Duration::days(1)),
            SyncFrequency::Weekly => Some(Duration::weeks(1)),
            SyncFrequency::Monthly => Some(Duration::days(30)),
        }
    }
}

/// Advisory snapshot of the most recent run, denormalized onto the
/// integration row for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSync {
    pub date: DateTime<Utc>,
    pub status: SyncStatus,
    pub duration_ms: i64,
    pub records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Running counters kept per integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStats {
    pub total_syncs: i64,
    pub successful_syncs: i64,
    pub failed_syncs: i64,
    pub total_records: i64,
    pub last_sync_records: i64,
}

/// A named source of part listings and how often to pull it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    pub name: String,
    pub kind: IntegrationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftp: Option<FtpConfig>,
    #[serde(default)]
    pub schedule: SyncSchedule,
    #[serde(default)]
    pub status: IntegrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<LastSync>,
    #[serde(default)]
    pub stats: IntegrationStats,
}

// ============================================================================
// Part listing
// ============================================================================

/// One catalog row: a `(partNumber, supplier, source file)` triple with its
/// attributes. Field names on the wire match the primary-store documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartListing {
    pub part_number: String,
    pub description: String,
    pub brand: String,
    pub supplier: String,
    pub category: String,
    pub subcategory: String,
    pub stock: String,
    pub stock_code: String,
    pub price: f64,
    pub currency: String,
    pub quantity: i32,
    pub min_order_qty: i32,
    pub weight: f64,
    pub weight_unit: String,
    pub volume: f64,
    pub delivery_days: i32,
    pub integration_id: String,
    pub integration_name: String,
    pub file_name: String,
    pub imported_at: DateTime<Utc>,
}

// ============================================================================
// Sync lifecycle
// ============================================================================

/// Run status state machine: pending -> running -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Interrupted => "interrupted",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed
                | SyncStatus::Failed
                | SyncStatus::Interrupted
                | SyncStatus::Cancelled
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "interrupted" => Ok(SyncStatus::Interrupted),
            "cancelled" => Ok(SyncStatus::Cancelled),
            _ => Err(format!("invalid sync status: '{}'", s)),
        }
    }
}

/// Where inside a run the engine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Queued,
    Connecting,
    Downloading,
    Pipeline,
    Draining,
    Finalizing,
    Done,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Queued => "queued",
            SyncPhase::Connecting => "connecting",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Pipeline => "pipeline",
            SyncPhase::Draining => "draining",
            SyncPhase::Finalizing => "finalizing",
            SyncPhase::Done => "done",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(SyncPhase::Queued),
            "connecting" => Ok(SyncPhase::Connecting),
            "downloading" => Ok(SyncPhase::Downloading),
            "pipeline" => Ok(SyncPhase::Pipeline),
            "draining" => Ok(SyncPhase::Draining),
            "finalizing" => Ok(SyncPhase::Finalizing),
            "done" => Ok(SyncPhase::Done),
            _ => Err(format!("invalid sync phase: '{}'", s)),
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Scheduler,
    #[default]
    Manual,
    Api,
    StartupRecovery,
    System,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduler => "scheduler",
            TriggerSource::Manual => "manual",
            TriggerSource::Api => "api",
            TriggerSource::StartupRecovery => "startup-recovery",
            TriggerSource::System => "system",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduler" => Ok(TriggerSource::Scheduler),
            "manual" => Ok(TriggerSource::Manual),
            "api" => Ok(TriggerSource::Api),
            "startup-recovery" => Ok(TriggerSource::StartupRecovery),
            "system" => Ok(TriggerSource::System),
            _ => Err(format!("invalid trigger source: '{}'", s)),
        }
    }
}

/// Per-file outcome recorded onto the history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Downloaded,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub name: String,
    pub status: FileStatus,
    #[serde(default)]
    pub records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Record counters accumulated over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounters {
    pub total: i64,
    pub processed: i64,
    pub inserted: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
}

/// Inter-process sync-request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Pending,
    Processing,
    Stale,
    Done,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Stale => "stale",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Stale | RequestStatus::Done | RequestStatus::Failed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "stale" => Ok(RequestStatus::Stale),
            "done" => Ok(RequestStatus::Done),
            "failed" => Ok(RequestStatus::Failed),
            _ => Err(format!("invalid request status: '{}'", s)),
        }
    }
}

// ============================================================================
// Progress reporting
// ============================================================================

/// Throttled progress payload emitted by the engine.
///
/// The field set is a stable contract with the history store and the UI
/// collaborator. `estimated` marks payloads whose inserted count is an
/// approximation rather than an observed total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub message: String,
    pub files_total: i64,
    pub files_processed: i64,
    pub records_processed: i64,
    pub records_inserted: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub elapsed_ms: i64,
    #[serde(default)]
    pub estimated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_source_round_trips_kebab_case() {
        let json = serde_json::to_string(&TriggerSource::StartupRecovery).unwrap();
        assert_eq!(json, "\"startup-recovery\"");
        let back: TriggerSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TriggerSource::StartupRecovery);
        assert_eq!(
            "startup-recovery".parse::<TriggerSource>().unwrap(),
            TriggerSource::StartupRecovery
        );
    }

    #[test]
    fn schedule_interval_follows_frequency() {
        let mut schedule = SyncSchedule {
            frequency: SyncFrequency::Manual,
            ..Default::default()
        };
        assert!(schedule.interval().is_none());

        schedule.frequency = SyncFrequency::Daily;
        assert_eq!(schedule.interval(), Some(Duration::days(1)));

        schedule.frequency = SyncFrequency::EveryNHours;
        schedule.every_hours = Some(6);
        assert_eq!(schedule.interval(), Some(Duration::hours(6)));

        // Out-of-range steps clamp instead of rejecting the schedule.
        schedule.every_hours = Some(40);
        assert_eq!(schedule.interval(), Some(Duration::hours(12)));
    }

    #[test]
    fn sync_status_terminality() {
        assert!(!SyncStatus::Pending.is_terminal());
        assert!(!SyncStatus::Running.is_terminal());
        assert!(SyncStatus::Completed.is_terminal());
        assert!(SyncStatus::Interrupted.is_terminal());
        assert!(SyncStatus::Cancelled.is_terminal());
    }

    #[test]
    fn part_listing_serializes_camel_case() {
        let listing = PartListing {
            part_number: "BP-001".to_string(),
            description: "Front Pad".to_string(),
            brand: "Bosch".to_string(),
            supplier: "AutoZone".to_string(),
            category: String::new(),
            subcategory: String::new(),
            stock: "unknown".to_string(),
            stock_code: "DS1".to_string(),
            price: 45.5,
            currency: "AED".to_string(),
            quantity: 12,
            min_order_qty: 1,
            weight: 0.0,
            weight_unit: "kg".to_string(),
            volume: 0.0,
            delivery_days: 0,
            integration_id: "i1".to_string(),
            integration_name: "Supplier".to_string(),
            file_name: "parts_DS1_part01.csv".to_string(),
            imported_at: Utc::now(),
        };

        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["partNumber"], "BP-001");
        assert_eq!(value["minOrderQty"], 1);
        assert_eq!(value["stockCode"], "DS1");
        assert!(value.get("importedAt").is_some());
    }
}
