//! PartSync scheduler daemon.
//!
//! Registers cron timers for every enabled integration, recovers stuck and
//! overdue syncs, and keeps history tidy. Runs until SIGINT/SIGTERM.
//!
//! Usage:
//!     partsync-scheduler --db sqlite:/var/lib/partsync/state.db

use clap::Parser;
use partsync_db::{IntegrationStore, SyncHistoryStore, SyncRequestQueue};
use partsync_engine::{EngineConfig, SyncPipeline};
use partsync_scheduler::{Scheduler, SchedulerConfig};

#[derive(Parser, Debug)]
#[command(name = "partsync-scheduler", about = "PartSync sync scheduler daemon")]
struct Args {
    /// State store URL (sqlite:path or a bare filesystem path)
    #[arg(long, env = "PARTSYNC_DB")]
    db: Option<String>,

    /// Route runs through the sync-request queue for out-of-process workers
    #[arg(long, env = "SYNC_USE_WORKER")]
    use_worker: bool,

    /// Run startup recovery immediately instead of after the settle delay
    #[arg(long)]
    immediate_recovery: bool,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = partsync_logging::init_logging(partsync_logging::LogConfig {
        app_name: "partsync-scheduler",
        verbose: args.verbose,
    })?;

    let db_url = args.db.unwrap_or_else(default_db_url);
    tracing::info!("Starting PartSync scheduler");
    tracing::info!("  State store: {}", db_url);

    let pool = partsync_db::open(&db_url).await?;
    let integrations = IntegrationStore::new(pool.clone());
    let history = SyncHistoryStore::new(pool.clone());
    let requests = SyncRequestQueue::new(pool.clone());

    let engine_config = EngineConfig::from_env();
    let pipeline = SyncPipeline::new(
        engine_config,
        integrations.clone(),
        history.clone(),
    );

    let mut scheduler = Scheduler::new(
        pipeline,
        integrations,
        history,
        requests,
        SchedulerConfig {
            use_worker: args.use_worker,
        },
    );
    scheduler.start(args.immediate_recovery).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    scheduler.shutdown().await;

    Ok(())
}

fn default_db_url() -> String {
    format!(
        "sqlite:{}",
        partsync_logging::partsync_home()
            .join("partsync.db")
            .display()
    )
}
