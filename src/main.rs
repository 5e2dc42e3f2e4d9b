use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use nursing_sync::api::HttpSyncApi;
use nursing_sync::config;
use nursing_sync::connectivity::ConnectivityMonitor;
use nursing_sync::db;
use nursing_sync::outbox::OutboxStore;
use nursing_sync::sync::{SyncEngine, SyncOptions};
use nursing_sync::tracker::{FileGeolocator, LocationTracker};

#[derive(Debug, Parser)]
#[command(author, version, about = "Field agent: offline outbox, sync and location tracking")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let api = Arc::new(HttpSyncApi::from_config(&cfg)?);
    let engine = SyncEngine::new(store.clone(), api.clone(), SyncOptions::from_config(&cfg));
    let monitor = ConnectivityMonitor::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let counts = store.counts();
    info!(
        device_id = %cfg.app.device_id,
        pending = counts.pending,
        failed = counts.failed,
        "field agent starting"
    );

    let probe_interval = Duration::from_millis(cfg.sync.poll_interval_ms);
    let monitor_task = {
        let monitor = monitor.clone();
        let probe = api.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(probe, probe_interval, shutdown).await })
    };

    let engine_task = {
        let engine = engine.clone();
        let connectivity = monitor.subscribe();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(connectivity, shutdown).await })
    };

    let practitioner_id = Uuid::parse_str(&cfg.tracking.practitioner_id)
        .context("tracking.practitioner_id must be a UUID")?;
    let tracker = LocationTracker::new(
        practitioner_id,
        Arc::new(FileGeolocator::new(&cfg.tracking.fix_path)),
        api,
    );
    if cfg.tracking.update_interval_ms > 0 {
        tracker.start_tracking(Duration::from_millis(cfg.tracking.update_interval_ms));
    } else {
        info!("periodic location tracking disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tracker.stop_tracking();
    let _ = shutdown_tx.send(true);

    for (name, task) in [("connectivity monitor", monitor_task), ("sync engine", engine_task)] {
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(?err, task = name, "task panicked"),
            Err(_) => warn!(task = name, "task did not stop in time"),
        }
    }

    let counts = store.counts();
    info!(pending = counts.pending, failed = counts.failed, "field agent stopped");
    Ok(())
}
