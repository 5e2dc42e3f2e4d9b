use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use nursing_sync::api::HttpSyncApi;
use nursing_sync::config;
use nursing_sync::db;
use nursing_sync::model::{OutboxPayload, OutboxRecord};
use nursing_sync::outbox::OutboxStore;
use nursing_sync::sync::{SyncEngine, SyncOptions};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and operate the local outbox")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print pending and failed counts
    Status,
    /// List pending records, or failed ones with --failed
    List {
        #[arg(long)]
        failed: bool,
    },
    /// Queue a payload given as JSON, e.g. '{"kind":"inventory_usage",...}'
    Enqueue { payload: String },
    /// Move failed records back to pending (all of them when no ids are given)
    RetryFailed { ids: Vec<Uuid> },
    /// Run drain passes against the sync server
    Drain {
        /// Keep draining until nothing is pending, waiting out backoff
        #[arg(long)]
        until_empty: bool,
    },
}

fn print_record(rec: &OutboxRecord) {
    println!(
        "{}  {:<16} {:<8} attempts={} created={}{}",
        rec.id,
        rec.kind,
        rec.sync_state.as_str(),
        rec.attempt_count,
        rec.created_at.to_rfc3339(),
        rec.last_error
            .as_deref()
            .map(|e| format!("  error: {}", e))
            .unwrap_or_default()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.outbox_database_url()).await?;
    db::run_client_migrations(&pool).await?;
    let store = OutboxStore::open(pool).await?;

    match args.command {
        Command::Status => {
            let counts = store.counts();
            println!("{} pending", counts.pending);
            println!("{} items need attention", counts.failed);
        }
        Command::List { failed } => {
            let records = if failed {
                store.list_failed().await?
            } else {
                store.list_pending().await?
            };
            for rec in &records {
                print_record(rec);
            }
        }
        Command::Enqueue { payload } => {
            let payload: OutboxPayload =
                serde_json::from_str(&payload).context("payload is not a valid outbox payload")?;
            let rec = store.enqueue(payload).await?;
            print_record(&rec);
        }
        Command::RetryFailed { ids } => {
            let moved = if ids.is_empty() {
                store.retry_failed(None).await?
            } else {
                store.retry_failed(Some(ids.as_slice())).await?
            };
            println!("{} records queued for retry", moved);
        }
        Command::Drain { until_empty } => {
            let api = Arc::new(HttpSyncApi::from_config(&cfg)?);
            let opts = SyncOptions::from_config(&cfg);
            let wait = opts.poll_interval.max(Duration::from_secs(1));
            let engine = SyncEngine::new(store.clone(), api, opts);
            loop {
                let report = engine.sync_pending_data().await?;
                let counts = store.counts();
                info!(
                    synced = report.synced + report.duplicates,
                    failed = report.failed,
                    requeued = report.requeued,
                    pending = counts.pending,
                    "drain pass"
                );
                if !until_empty || counts.pending == 0 {
                    break;
                }
                warn!(pending = counts.pending, "records still pending; waiting for backoff");
                tokio::time::sleep(wait).await;
            }
            let counts = store.counts();
            println!("{} pending, {} need attention", counts.pending, counts.failed);
        }
    }
    Ok(())
}
