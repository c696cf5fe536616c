//! turbo-sync: one-shot catalog sync.
//!
//! Runs the full pipeline for one integration (the first enabled FTP
//! integration when none is named) and prints a JSON summary on stdout.
//! Exit code 0 on success, non-zero on failure or interruption.
//!
//! Usage:
//!     turbo-sync [INTEGRATION_ID] [--db sqlite:/path/state.db]

use anyhow::{Context, Result};
use clap::Parser;
use partsync_db::{IntegrationStore, SyncHistoryStore};
use partsync_engine::{EngineConfig, ProgressCallback, SyncPipeline};
use partsync_protocol::types::TriggerSource;
use serde_json::json;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "turbo-sync", about = "Bulk-sync one part catalog integration")]
struct Args {
    /// Integration to sync; defaults to the first enabled FTP integration
    integration_id: Option<String>,

    /// State store URL (sqlite:path or a bare filesystem path)
    #[arg(long, env = "PARTSYNC_DB")]
    db: Option<String>,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = partsync_logging::init_logging(partsync_logging::LogConfig {
        app_name: "turbo-sync",
        verbose: args.verbose,
    })?;

    let db_url = args.db.unwrap_or_else(default_db_url);
    let pool = partsync_db::open(&db_url).await?;
    let integrations = IntegrationStore::new(pool.clone());
    let history = SyncHistoryStore::new(pool.clone());

    let integration_id = match args.integration_id {
        Some(id) => id,
        None => integrations
            .first_enabled_ftp()
            .await?
            .map(|i| i.id)
            .context("no enabled FTP integration found")?,
    };

    let pipeline = SyncPipeline::new(
        EngineConfig::from_env(),
        integrations,
        history,
    );
    let progress: ProgressCallback = Arc::new(|update| {
        tracing::info!(
            phase = %update.phase,
            files_processed = update.files_processed,
            files_total = update.files_total,
            records = update.records_processed,
            "{}",
            update.message
        );
    });

    tokio::select! {
        result = pipeline.run(&integration_id, TriggerSource::Manual, progress) => {
            match result {
                Ok(outcome) => {
                    println!(
                        "{}",
                        json!({
                            "success": true,
                            "records": outcome.records_processed,
                            "duration_ms": outcome.duration_ms,
                            "rate_per_sec": outcome.rate_per_sec(),
                        })
                    );
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "sync failed");
                    println!(
                        "{}",
                        json!({
                            "success": false,
                            "records": 0,
                            "duration_ms": 0,
                            "rate_per_sec": 0.0,
                        })
                    );
                    std::process::exit(1);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            // Dropping the run future unwinds the scratch guard; history is
            // reconciled by the scheduler's next startup recovery.
            tracing::warn!("interrupted; scratch cleaned up");
            std::process::exit(130);
        }
    }
}

fn default_db_url() -> String {
    format!(
        "sqlite:{}",
        partsync_logging::partsync_home()
            .join("partsync.db")
            .display()
    )
}
