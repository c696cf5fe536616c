//! Scheduler: per-integration cron timers, startup recovery, health ticks.
//!
//! Each enabled integration gets its own cancellable timer task that sleeps
//! until the next cron fire in the integration's timezone and then triggers
//! a sync. Recovery work (stale sweeps, stuck integrations, overdue runs)
//! happens once shortly after startup and again on every health tick.

use anyhow::Result;
use chrono::Utc;
use partsync_db::{IntegrationStore, SyncHistoryStore, SyncRequestQueue};
use partsync_engine::{ProgressCallback, SyncPipeline};
use partsync_protocol::defaults::{
    HEALTH_CHECK_SECS, RECOVERY_STAGGER_SECS, STARTUP_RECOVERY_DELAY_SECS, STUCK_SYNC_SECS,
};
use partsync_protocol::types::{Integration, IntegrationStatus, TriggerSource};
use partsync_protocol::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cron::{is_sync_due, next_fire};

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Route runs through the sync-request queue instead of running the
    /// engine in-process.
    pub use_worker: bool,
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
    pipeline: SyncPipeline,
    integrations: IntegrationStore,
    history: SyncHistoryStore,
    requests: SyncRequestQueue,
    use_worker: bool,
}

impl Scheduler {
    pub fn new(
        pipeline: SyncPipeline,
        integrations: IntegrationStore,
        history: SyncHistoryStore,
        requests: SyncRequestQueue,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                pipeline,
                integrations,
                history,
                requests,
                use_worker: config.use_worker,
            }),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        }
    }

    /// Register timer tasks for every schedulable integration and spawn the
    /// recovery, health, and (in worker mode) queue-drain loops.
    pub async fn start(&mut self, immediate_recovery: bool) -> Result<()> {
        let integrations = self.inner.integrations.list_schedulable().await?;
        info!(count = integrations.len(), "scheduler starting");

        for integration in integrations {
            self.spawn_timer(integration);
        }

        // Startup recovery, once, after a settle delay.
        {
            let inner = self.inner.clone();
            let mut shutdown = self.shutdown_rx.clone();
            let delay = if immediate_recovery {
                Duration::ZERO
            } else {
                Duration::from_secs(STARTUP_RECOVERY_DELAY_SECS)
            };
            self.tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = inner.startup_recovery().await {
                            warn!(error = %format!("{e:#}"), "startup recovery failed");
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            }));
        }

        // Health tick, forever.
        {
            let inner = self.inner.clone();
            let mut shutdown = self.shutdown_rx.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await; // immediate first tick is uninteresting
                loop {
                    tokio::select! {
                        _ = tick.tick() => inner.health_tick().await,
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        if self.inner.use_worker {
            let inner = self.inner.clone();
            let mut shutdown = self.shutdown_rx.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let drained = match inner.drain_queue_once().await {
                        Ok(drained) => drained,
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "queue drain failed");
                            false
                        }
                    };
                    if !drained {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.changed() => break,
                        }
                    } else if *shutdown.borrow() {
                        break;
                    }
                }
            }));
        }

        Ok(())
    }

    fn spawn_timer(&mut self, integration: Integration) {
        let Some(first) = next_fire(&integration.schedule, Utc::now()) else {
            debug!(integration = %integration.id, "manual schedule; no timer");
            return;
        };
        info!(
            integration = %integration.id,
            next = %first.to_rfc3339(),
            "timer registered"
        );

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let Some(next) = next_fire(&integration.schedule, Utc::now()) else {
                    break;
                };
                let delay = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        inner
                            .trigger_sync(&integration.id, TriggerSource::Scheduler)
                            .await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Stop timers and loops, then run one final stale sweep so nothing is
    /// left half-claimed.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Err(e) = self.inner.requests.mark_stale().await {
            warn!(error = %format!("{e:#}"), "final stale sweep failed");
        }
        info!("scheduler stopped");
    }
}

impl SchedulerInner {
    /// Kick off a run, either in-process or through the request queue.
    /// Rejections (a run already active) are expected and only logged.
    async fn trigger_sync(&self, integration_id: &str, source: TriggerSource) {
        info!(integration = integration_id, source = %source, "triggering sync");

        let result = if self.use_worker {
            self.enqueue_request(integration_id, source).await
        } else {
            let progress: ProgressCallback = Arc::new(|_update| {});
            self.pipeline
                .run(integration_id, source, progress)
                .await
                .map(|outcome| {
                    debug!(
                        integration = integration_id,
                        records = outcome.records_processed,
                        "triggered run finished"
                    );
                })
        };

        if let Err(e) = result {
            if matches!(
                e.downcast_ref::<SyncError>(),
                Some(SyncError::AlreadyRunning(_))
            ) {
                debug!(integration = integration_id, "sync already active; skipped");
            } else {
                warn!(
                    integration = integration_id,
                    error = %format!("{e:#}"),
                    "trigger failed"
                );
            }
        }
    }

    async fn enqueue_request(&self, integration_id: &str, source: TriggerSource) -> Result<()> {
        let integration = self
            .integrations
            .get(integration_id)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("integration {} not found", integration_id))
            })?;

        let record = self.history.create(&integration, source).await?;
        if let Err(e) = self
            .requests
            .submit(integration_id, source, &record.id)
            .await
        {
            // The queue already holds a request; release the record.
            self.history
                .mark_cancelled(&record.id, "Sync request already queued")
                .await?;
            return Err(e);
        }
        Ok(())
    }

    /// Claim and execute one queued request. Returns false when the queue
    /// was empty.
    async fn drain_queue_once(&self) -> Result<bool> {
        let Some(request) = self.requests.claim().await? else {
            return Ok(false);
        };

        let Some(integration) = self.integrations.get(&request.integration_id).await? else {
            self.requests
                .fail(request.id, "integration no longer exists")
                .await?;
            return Ok(true);
        };

        let record_id = match request.sync_history_id.clone() {
            Some(id) => id,
            None => self
                .history
                .create(&integration, request.source)
                .await?
                .id,
        };

        // Progress persists are detached: they must never block the run.
        let requests = self.requests.clone();
        let request_id = request.id;
        let progress: ProgressCallback = Arc::new(move |update| {
            let requests = requests.clone();
            tokio::spawn(async move {
                if let Err(e) = requests.update_progress(request_id, &update).await {
                    debug!(error = %format!("{e:#}"), "request progress persist failed");
                }
            });
        });

        match self.pipeline.execute(&integration, &record_id, progress).await {
            Ok(_) => self.requests.complete(request.id).await?,
            Err(e) => {
                self.requests
                    .fail(request.id, &format!("{e:#}"))
                    .await?
            }
        }
        Ok(true)
    }

    /// One-time recovery pass: sweep stale state, then re-trigger every
    /// integration that is mid-"syncing" or overdue, staggered.
    async fn startup_recovery(&self) -> Result<()> {
        info!("startup recovery running");

        self.history.mark_stale_as_interrupted().await?;
        self.requests.mark_stale().await?;
        self.history.purge_expired().await?;

        let now = Utc::now();
        let mut candidates: Vec<String> = Vec::new();

        for integration in self.integrations.list_syncing().await? {
            candidates.push(integration.id);
        }
        for integration in self.integrations.list_schedulable().await? {
            if is_sync_due(&integration, now) && !candidates.contains(&integration.id) {
                candidates.push(integration.id);
            }
        }

        info!(count = candidates.len(), "recovery candidates");
        for integration_id in candidates {
            if let Some(residual) = self.history.running_for(&integration_id).await? {
                self.history
                    .mark_interrupted(&residual.id, "Interrupted by scheduler restart")
                    .await?;
            }
            self.integrations
                .set_status(&integration_id, IntegrationStatus::Active)
                .await?;

            self.trigger_sync(&integration_id, TriggerSource::StartupRecovery)
                .await;
            tokio::time::sleep(Duration::from_secs(RECOVERY_STAGGER_SECS)).await;
        }

        Ok(())
    }

    /// Periodic health work: stale sweeps, stuck-sync detection, overdue
    /// scan, history retention. Every step is independent; one failing must
    /// not starve the others.
    async fn health_tick(&self) {
        debug!("health tick");

        if let Err(e) = self.history.mark_stale_as_interrupted().await {
            warn!(error = %format!("{e:#}"), "stale history sweep failed");
        }
        if let Err(e) = self.requests.mark_stale().await {
            warn!(error = %format!("{e:#}"), "stale request sweep failed");
        }
        if let Err(e) = self.history.purge_expired().await {
            warn!(error = %format!("{e:#}"), "history purge failed");
        }

        // Stuck syncs: integration says "syncing" but its last run is old.
        match self.integrations.list_syncing().await {
            Ok(syncing) => {
                let now = Utc::now();
                for integration in syncing {
                    let stuck = integration
                        .last_sync
                        .as_ref()
                        .map(|last| {
                            now - last.date
                                > chrono::Duration::seconds(STUCK_SYNC_SECS)
                        })
                        .unwrap_or(false);
                    if !stuck {
                        continue;
                    }

                    warn!(integration = %integration.id, "stuck sync detected");
                    if let Ok(Some(residual)) =
                        self.history.running_for(&integration.id).await
                    {
                        let _ = self
                            .history
                            .mark_interrupted(&residual.id, "Stuck sync detected")
                            .await;
                    }
                    if let Err(e) = self
                        .integrations
                        .set_status(&integration.id, IntegrationStatus::Error)
                        .await
                    {
                        warn!(error = %format!("{e:#}"), "stuck status reset failed");
                    }
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "stuck scan failed"),
        }

        // Overdue scan.
        match self.integrations.list_schedulable().await {
            Ok(schedulable) => {
                let now = Utc::now();
                for integration in schedulable {
                    if is_sync_due(&integration, now) {
                        self.trigger_sync(&integration.id, TriggerSource::Scheduler)
                            .await;
                    }
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "overdue scan failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partsync_engine::EngineConfig;
    use partsync_protocol::types::{
        Integration, IntegrationKind, IntegrationStats, LastSync, RequestStatus, SyncFrequency,
        SyncSchedule, SyncStatus,
    };

    async fn scheduler_on_memory_db() -> Scheduler {
        let pool = partsync_db::memory_pool().await.unwrap();
        let integrations = IntegrationStore::new(pool.clone());
        let history = SyncHistoryStore::new(pool.clone());
        let requests = SyncRequestQueue::new(pool.clone());
        let pipeline = SyncPipeline::new(
            EngineConfig::default(),
            integrations.clone(),
            history.clone(),
        );
        Scheduler::new(
            pipeline,
            integrations,
            history,
            requests,
            SchedulerConfig { use_worker: true },
        )
    }

    fn daily_integration(id: &str, last_sync: Option<LastSync>) -> Integration {
        Integration {
            id: id.to_string(),
            name: format!("Supplier {}", id),
            kind: IntegrationKind::Ftp,
            ftp: None,
            schedule: SyncSchedule {
                enabled: true,
                frequency: SyncFrequency::Daily,
                time_of_day: Some("02:00".to_string()),
                ..Default::default()
            },
            status: IntegrationStatus::Active,
            last_sync,
            stats: IntegrationStats::default(),
        }
    }

    #[tokio::test]
    async fn startup_recovery_enqueues_exactly_one_overdue_run() {
        let scheduler = scheduler_on_memory_db().await;
        let inner = scheduler.inner.clone();

        // Daily schedule, last synced 27 hours ago: past interval + grace.
        inner
            .integrations
            .upsert(&daily_integration(
                "overdue",
                Some(LastSync {
                    date: Utc::now() - chrono::Duration::hours(27),
                    status: SyncStatus::Completed,
                    duration_ms: 1000,
                    records: 10,
                    error: None,
                }),
            ))
            .await
            .unwrap();

        inner.startup_recovery().await.unwrap();

        let request = inner.requests.claim().await.unwrap().unwrap();
        assert_eq!(request.integration_id, "overdue");
        assert_eq!(request.source, TriggerSource::StartupRecovery);
        assert_eq!(request.status, RequestStatus::Processing);
        assert!(request.sync_history_id.is_some());

        // Exactly one run was enqueued.
        assert!(inner.requests.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_recovery_resets_syncing_integrations() {
        let scheduler = scheduler_on_memory_db().await;
        let inner = scheduler.inner.clone();

        let mut stuck = daily_integration("stuck", None);
        stuck.status = IntegrationStatus::Syncing;
        inner.integrations.upsert(&stuck).await.unwrap();

        // Residual record from the interrupted process.
        let record = inner
            .history
            .create(&daily_integration("stuck", None), TriggerSource::Scheduler)
            .await
            .unwrap();
        inner.history.mark_running(&record.id).await.unwrap();

        inner.startup_recovery().await.unwrap();

        let residual = inner.history.get(&record.id).await.unwrap().unwrap();
        assert_eq!(residual.status, SyncStatus::Interrupted);

        let integration = inner.integrations.get("stuck").await.unwrap().unwrap();
        assert_eq!(integration.status, IntegrationStatus::Active);

        // With the residual record closed, the recovery run was enqueued.
        let request = inner.requests.claim().await.unwrap().unwrap();
        assert_eq!(request.integration_id, "stuck");
        assert_eq!(request.source, TriggerSource::StartupRecovery);
    }

    #[tokio::test]
    async fn fresh_integrations_are_not_retriggered() {
        let scheduler = scheduler_on_memory_db().await;
        let inner = scheduler.inner.clone();

        inner
            .integrations
            .upsert(&daily_integration(
                "fresh",
                Some(LastSync {
                    date: Utc::now() - chrono::Duration::hours(1),
                    status: SyncStatus::Completed,
                    duration_ms: 1000,
                    records: 10,
                    error: None,
                }),
            ))
            .await
            .unwrap();

        inner.startup_recovery().await.unwrap();
        assert!(inner.requests.claim().await.unwrap().is_none());
    }
}
