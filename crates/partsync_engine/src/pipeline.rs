//! Pipeline engine: one end-to-end sync run.
//!
//! Phases: Clean -> Fetch -> (Transform || PrimaryLoad || SearchLoad) ->
//! Finalize. The FTP download completes before transform starts; from then
//! on the stages overlap. The transformer fans out per-file workers, and
//! every finished file is handed to both loader pools through bounded
//! queues; a poison sentinel per consumer ends each queue.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use partsync_db::{IntegrationStore, RunSummary, SyncHistoryStore};
use partsync_protocol::types::{
    FileOutcome, FileStatus, Integration, IntegrationStatus, LastSync, ProgressUpdate,
    RecordCounters, SyncPhase, SyncStatus, TriggerSource,
};
use partsync_protocol::SyncError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::ftp::{DownloadedFile, FtpFetcher};
use crate::primary::PrimaryStore;
use crate::progress::{ProgressCallback, ProgressThrottle};
use crate::scratch::ScratchGuard;
use crate::search::SearchStore;
use crate::transform::{transform_file, TransformContext};

/// Final numbers for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub history_id: String,
    pub records_processed: i64,
    pub records_skipped: i64,
    pub records_failed: i64,
    pub primary_inserted: i64,
    pub search_indexed: i64,
    pub files_total: i64,
    pub files_failed: i64,
    pub duration_ms: i64,
    pub files: Vec<FileOutcome>,
}

impl RunOutcome {
    pub fn rate_per_sec(&self) -> f64 {
        if self.duration_ms <= 0 {
            return 0.0;
        }
        self.records_processed as f64 / (self.duration_ms as f64 / 1000.0)
    }
}

/// Counters shared between the transform driver and the loader pools.
#[derive(Default)]
struct RunCounters {
    files_processed: AtomicI64,
    records_processed: AtomicI64,
    records_skipped: AtomicI64,
    records_failed: AtomicI64,
    mongo_files_done: AtomicI64,
    mongo_inserted: AtomicI64,
    search_indexed: AtomicI64,
}

type ShardQueue = Arc<Mutex<mpsc::Receiver<Option<(PathBuf, u64)>>>>;

pub struct SyncPipeline {
    config: EngineConfig,
    integrations: IntegrationStore,
    history: SyncHistoryStore,
}

impl SyncPipeline {
    pub fn new(
        config: EngineConfig,
        integrations: IntegrationStore,
        history: SyncHistoryStore,
    ) -> Self {
        Self {
            config,
            integrations,
            history,
        }
    }

    /// Run one sync for an integration: create the history record, execute,
    /// and finalize both the record and the integration row on every path.
    pub async fn run(
        &self,
        integration_id: &str,
        triggered_by: TriggerSource,
        progress: ProgressCallback,
    ) -> Result<RunOutcome> {
        let integration = self
            .integrations
            .get(integration_id)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("integration {} not found", integration_id))
            })?;

        let record = self.history.create(&integration, triggered_by).await?;
        info!(
            integration = integration_id,
            record = %record.id,
            source = %triggered_by,
            "sync run starting"
        );

        self.execute(&integration, &record.id, progress).await
    }

    /// Execute a run against an already-created history record, finalizing
    /// the record and the integration row on every path. Used directly by
    /// queue workers, whose record was created at submission time.
    pub async fn execute(
        &self,
        integration: &Integration,
        record_id: &str,
        progress: ProgressCallback,
    ) -> Result<RunOutcome> {
        let integration_id = integration.id.as_str();
        let record = self
            .history
            .get(record_id)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("history record {} not found", record_id))
            })?;

        match self.run_once(integration, &record.id, progress).await {
            Ok(mut outcome) => {
                outcome.history_id = record.id.clone();

                let summary = RunSummary {
                    records: RecordCounters {
                        total: outcome.records_processed + outcome.records_skipped,
                        processed: outcome.records_processed,
                        inserted: outcome.primary_inserted,
                        updated: 0,
                        skipped: outcome.records_skipped,
                        failed: outcome.records_failed,
                    },
                    indexed_records: outcome.search_indexed,
                    files: outcome.files.clone(),
                };
                self.history.mark_completed(&record.id, &summary).await?;

                let finished = self.history.get(&record.id).await?;
                outcome.duration_ms = finished
                    .as_ref()
                    .and_then(|r| r.duration_ms)
                    .unwrap_or(outcome.duration_ms);

                self.integrations
                    .set_status(integration_id, IntegrationStatus::Active)
                    .await?;
                self.integrations
                    .record_run(
                        integration_id,
                        &LastSync {
                            date: Utc::now(),
                            status: SyncStatus::Completed,
                            duration_ms: outcome.duration_ms,
                            records: outcome.records_processed,
                            error: None,
                        },
                        true,
                    )
                    .await?;

                info!(
                    integration = integration_id,
                    records = outcome.records_processed,
                    inserted = outcome.primary_inserted,
                    indexed = outcome.search_indexed,
                    duration_ms = outcome.duration_ms,
                    "sync run completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let summary = format!("{e:#}");
                error!(integration = integration_id, error = %summary, "sync run failed");

                let rejected = matches!(
                    e.downcast_ref::<SyncError>(),
                    Some(SyncError::AlreadyRunning(_))
                );
                if rejected {
                    // The run never owned the integration; leave its status
                    // and stats untouched.
                    self.history.mark_cancelled(&record.id, &summary).await?;
                } else {
                    self.history.mark_failed(&record.id, &summary).await?;
                    self.integrations
                        .set_status(integration_id, IntegrationStatus::Error)
                        .await?;
                    self.integrations
                        .record_run(
                            integration_id,
                            &LastSync {
                                date: Utc::now(),
                                status: SyncStatus::Failed,
                                duration_ms: 0,
                                records: 0,
                                error: Some(summary),
                            },
                            false,
                        )
                        .await?;
                }
                Err(e)
            }
        }
    }

    async fn run_once(
        &self,
        integration: &Integration,
        record_id: &str,
        progress: ProgressCallback,
    ) -> Result<RunOutcome> {
        let run_started = Instant::now();
        let limits = &self.config.limits;

        let ftp_config = integration
            .ftp
            .clone()
            .ok_or_else(|| SyncError::Config(format!("integration {} has no FTP config", integration.id)))?;

        // Phase: Clean. The guard also covers every early-exit path below.
        let scratch = ScratchGuard::create(self.config.scratch_root.join(&integration.id))?;

        let owned = self
            .integrations
            .set_status_cas(
                &integration.id,
                &[
                    IntegrationStatus::Active,
                    IntegrationStatus::Inactive,
                    IntegrationStatus::Error,
                ],
                IntegrationStatus::Syncing,
            )
            .await?;
        if !owned {
            return Err(SyncError::AlreadyRunning(integration.id.clone()).into());
        }

        self.history.mark_running(record_id).await?;
        let mut throttle = ProgressThrottle::new(progress);
        let mut reporter = Reporter {
            record_id: record_id.to_string(),
            history: self.history.clone(),
            started: run_started,
        };
        reporter
            .emit(
                &mut throttle,
                SyncPhase::Connecting,
                "connecting to stores",
                None,
                0,
                true,
            )
            .await;

        // Phase: Connecting. Primary is mandatory; search degrades.
        let primary = Arc::new(PrimaryStore::connect(&self.config).await?);
        let search_store = SearchStore::new(&self.config)?;
        let imported_at = Utc::now();
        let run_index = search_store.run_index_name(imported_at);

        let search = match search_store.health().await {
            Ok(()) => {
                search_store.create_run_index(&run_index).await?;
                Some(Arc::new(search_store))
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "search store unreachable; run continues primary-only");
                self.history
                    .append_error(record_id, &format!("search store unavailable: {e:#}"))
                    .await?;
                None
            }
        };

        primary.drop_collection().await?;

        // Phase: Downloading. The full fetch lands before transform starts.
        reporter
            .emit(
                &mut throttle,
                SyncPhase::Downloading,
                "downloading catalog files",
                None,
                0,
                true,
            )
            .await;

        let fetcher = FtpFetcher::new(
            ftp_config,
            limits.ftp_parallel,
            limits.ftp_retries,
            Duration::from_secs(limits.ftp_timeout_secs),
        );
        let fetch = fetcher.fetch_all(&scratch.downloads_dir()).await?;

        let mut files: Vec<FileOutcome> = Vec::new();
        for failure in &fetch.failed {
            self.history
                .append_error(
                    record_id,
                    &format!("download failed: {}: {}", failure.name, failure.reason),
                )
                .await?;
            files.push(FileOutcome {
                name: failure.name.clone(),
                status: FileStatus::Failed,
                records: 0,
                error: Some(failure.reason.clone()),
            });
        }

        let files_total = fetch.downloaded.len() as i64;
        let counters = Arc::new(RunCounters::default());
        let mut shard_errors: Vec<String> = Vec::new();

        // Phase: Pipeline. Bounded queues, poison sentinel per consumer.
        let mongo_workers = limits.mongo_concurrent.max(1);
        let search_workers = if search.is_some() {
            limits.es_bulk_concurrent.max(1)
        } else {
            0
        };

        let (mongo_tx, mongo_rx) = mpsc::channel::<Option<(PathBuf, u64)>>(mongo_workers * 2);
        let mongo_rx: ShardQueue = Arc::new(Mutex::new(mongo_rx));
        let load_errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::new();
        for _ in 0..mongo_workers {
            let rx = mongo_rx.clone();
            let primary = primary.clone();
            let counters = counters.clone();
            let load_errors = load_errors.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(Some((shard, records))) => {
                            match primary.load_shard(&shard, records).await {
                                Ok(inserted) => {
                                    counters
                                        .mongo_inserted
                                        .fetch_add(inserted as i64, Ordering::Relaxed);
                                    counters.mongo_files_done.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    warn!(shard = %shard.display(), error = %format!("{e:#}"), "primary shard load failed");
                                    counters
                                        .records_failed
                                        .fetch_add(records as i64, Ordering::Relaxed);
                                    load_errors.lock().await.push(format!(
                                        "primary load failed for {}: {e:#}",
                                        shard.display()
                                    ));
                                }
                            }
                        }
                        Some(None) | None => break,
                    }
                }
            }));
        }

        let search_tx = if let Some(search) = &search {
            let (tx, rx) = mpsc::channel::<Option<(PathBuf, u64)>>(search_workers * 2);
            let rx: ShardQueue = Arc::new(Mutex::new(rx));
            for _ in 0..search_workers {
                let rx = rx.clone();
                let search = search.clone();
                let counters = counters.clone();
                let load_errors = load_errors.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        let item = { rx.lock().await.recv().await };
                        match item {
                            Some(Some((shard, _records))) => {
                                match search.ingest_shard(&shard).await {
                                    Ok(indexed) => {
                                        counters
                                            .search_indexed
                                            .fetch_add(indexed as i64, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        warn!(shard = %shard.display(), error = %format!("{e:#}"), "search shard ingest failed");
                                        load_errors.lock().await.push(format!(
                                            "search ingest failed for {}: {e:#}",
                                            shard.display()
                                        ));
                                    }
                                }
                            }
                            Some(None) | None => break,
                        }
                    }
                }));
            }
            Some(tx)
        } else {
            None
        };

        reporter
            .emit(
                &mut throttle,
                SyncPhase::Pipeline,
                "transforming and loading",
                None,
                files_total,
                true,
            )
            .await;

        // Single transformer, bounded per-file fan-out.
        let ctx = TransformContext {
            integration_id: integration.id.clone(),
            integration_name: integration.name.clone(),
            run_index: run_index.clone(),
            imported_at,
        };
        let shards_dir = scratch.shards_dir();
        let transform_parallel = limits.effective_transform_parallel();

        let mut transforms = stream::iter(fetch.downloaded.clone().into_iter().map(|file: DownloadedFile| {
            let path = file.path;
            let name = file.name;
            let ctx = ctx.clone();
            let shards_dir = shards_dir.clone();
            async move {
                let result = tokio::task::spawn_blocking(move || {
                    transform_file(&path, &shards_dir, &ctx)
                })
                .await;
                (name, result)
            }
        }))
        .buffer_unordered(transform_parallel);

        while let Some((name, joined)) = transforms.next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(anyhow::Error::new(join_error)),
            };

            match result {
                Ok(output) => {
                    counters.files_processed.fetch_add(1, Ordering::Relaxed);
                    counters
                        .records_processed
                        .fetch_add(output.records as i64, Ordering::Relaxed);
                    counters
                        .records_skipped
                        .fetch_add(output.skipped as i64, Ordering::Relaxed);
                    files.push(FileOutcome {
                        name: name.clone(),
                        status: FileStatus::Processed,
                        records: output.records as i64,
                        error: None,
                    });

                    mongo_tx
                        .send(Some((output.primary_shard, output.records)))
                        .await
                        .context("primary queue closed")?;
                    if let Some(tx) = &search_tx {
                        tx.send(Some((output.search_shard, output.records)))
                            .await
                            .context("search queue closed")?;
                    }
                }
                Err(e) => {
                    warn!(file = %name, error = %format!("{e:#}"), "transform failed");
                    shard_errors.push(format!("transform failed for {}: {e:#}", name));
                    files.push(FileOutcome {
                        name: name.clone(),
                        status: FileStatus::Failed,
                        records: 0,
                        error: Some(format!("{e:#}")),
                    });
                }
            }

            let estimated = estimate_inserted(&counters, files_total);
            reporter
                .emit_with_counters(
                    &mut throttle,
                    SyncPhase::Pipeline,
                    "transforming and loading",
                    Some(name),
                    files_total,
                    &counters,
                    estimated,
                    false,
                )
                .await;
        }

        // Transformer done: poison each pool once per consumer.
        for _ in 0..mongo_workers {
            mongo_tx
                .send(None)
                .await
                .context("primary queue closed")?;
        }
        drop(mongo_tx);
        if let Some(tx) = &search_tx {
            for _ in 0..search_workers {
                tx.send(None).await.context("search queue closed")?;
            }
        }
        drop(search_tx);

        reporter
            .emit_with_counters(
                &mut throttle,
                SyncPhase::Draining,
                "draining loader queues",
                None,
                files_total,
                &counters,
                estimate_inserted(&counters, files_total),
                true,
            )
            .await;

        for worker in workers {
            worker.await.context("loader worker panicked")?;
        }

        for message in load_errors.lock().await.drain(..) {
            shard_errors.push(message);
        }
        for message in &shard_errors {
            self.history.append_error(record_id, message).await?;
        }

        // Phase: Finalizing. Exact count, indexes, alias swap, cleanup.
        reporter
            .emit_with_counters(
                &mut throttle,
                SyncPhase::Finalizing,
                "building indexes and promoting alias",
                None,
                files_total,
                &counters,
                estimate_inserted(&counters, files_total),
                true,
            )
            .await;

        let primary_inserted = match primary.estimated_count().await {
            Ok(count) => count as i64,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "primary count failed; using loader totals");
                counters.mongo_inserted.load(Ordering::Relaxed)
            }
        };

        for failed_index in primary.build_indexes().await {
            self.history
                .append_error(record_id, &format!("index build failed: {}", failed_index))
                .await?;
        }

        if let Some(search) = &search {
            let displaced = search.promote(&run_index).await?;
            search.cleanup_old_indexes(&displaced).await;
        }

        self.history.set_files(record_id, &files).await?;

        let outcome = RunOutcome {
            history_id: record_id.to_string(),
            records_processed: counters.records_processed.load(Ordering::Relaxed),
            records_skipped: counters.records_skipped.load(Ordering::Relaxed),
            records_failed: counters.records_failed.load(Ordering::Relaxed),
            primary_inserted,
            search_indexed: counters.search_indexed.load(Ordering::Relaxed),
            files_total,
            files_failed: files
                .iter()
                .filter(|f| f.status == FileStatus::Failed)
                .count() as i64,
            duration_ms: run_started.elapsed().as_millis() as i64,
            files,
        };

        reporter
            .emit(
                &mut throttle,
                SyncPhase::Done,
                "sync finished",
                None,
                files_total,
                true,
            )
            .await;

        // Phase: Clean (again, explicitly, so removal errors surface).
        scratch.cleanup()?;
        Ok(outcome)
    }
}

/// Until the real count lands, inserted is approximated from how many
/// shards have finished loading. Payloads built from it say so.
fn estimate_inserted(counters: &RunCounters, files_total: i64) -> i64 {
    if files_total == 0 {
        return 0;
    }
    let done = counters.mongo_files_done.load(Ordering::Relaxed);
    let processed = counters.records_processed.load(Ordering::Relaxed);
    (done * processed) / files_total
}

/// Builds progress payloads and mirrors emitted ones onto the history row.
struct Reporter {
    record_id: String,
    history: SyncHistoryStore,
    started: Instant,
}

impl Reporter {
    #[allow(clippy::too_many_arguments)]
    async fn emit_with_counters(
        &mut self,
        throttle: &mut ProgressThrottle,
        phase: SyncPhase,
        message: &str,
        current_file: Option<String>,
        files_total: i64,
        counters: &RunCounters,
        estimated_inserted: i64,
        force: bool,
    ) {
        let update = ProgressUpdate {
            status: SyncStatus::Running,
            phase,
            message: message.to_string(),
            files_total,
            files_processed: counters.files_processed.load(Ordering::Relaxed),
            records_processed: counters.records_processed.load(Ordering::Relaxed),
            records_inserted: estimated_inserted,
            current_file,
            elapsed_ms: self.started.elapsed().as_millis() as i64,
            estimated: true,
        };

        if throttle.emit(update.clone(), force) {
            if let Err(e) = self.history.update_progress(&self.record_id, &update).await {
                warn!(error = %format!("{e:#}"), "progress persist failed");
            }
        }
    }

    async fn emit(
        &mut self,
        throttle: &mut ProgressThrottle,
        phase: SyncPhase,
        message: &str,
        current_file: Option<String>,
        files_total: i64,
        force: bool,
    ) {
        let update = ProgressUpdate {
            status: SyncStatus::Running,
            phase,
            message: message.to_string(),
            files_total,
            current_file,
            elapsed_ms: self.started.elapsed().as_millis() as i64,
            ..Default::default()
        };

        if throttle.emit(update.clone(), force) {
            if let Err(e) = self.history.update_progress(&self.record_id, &update).await {
                warn!(error = %format!("{e:#}"), "progress persist failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_estimate_scales_with_finished_shards() {
        let counters = RunCounters::default();
        counters.records_processed.store(1000, Ordering::Relaxed);
        counters.mongo_files_done.store(0, Ordering::Relaxed);
        assert_eq!(estimate_inserted(&counters, 10), 0);

        counters.mongo_files_done.store(5, Ordering::Relaxed);
        assert_eq!(estimate_inserted(&counters, 10), 500);

        counters.mongo_files_done.store(10, Ordering::Relaxed);
        assert_eq!(estimate_inserted(&counters, 10), 1000);

        assert_eq!(estimate_inserted(&counters, 0), 0);
    }

    #[test]
    fn rate_is_records_per_second() {
        let outcome = RunOutcome {
            records_processed: 5000,
            duration_ms: 2000,
            ..Default::default()
        };
        assert!((outcome.rate_per_sec() - 2500.0).abs() < f64::EPSILON);

        let zero = RunOutcome::default();
        assert_eq!(zero.rate_per_sec(), 0.0);
    }
}
