use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use nursing_sync::config;
use nursing_sync::db;
use nursing_sync::server::{http, ServerState};

#[derive(Debug, Parser)]
#[command(author, version, about = "Serve batch sync, location and assignment endpoints")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides server.bind)
    #[arg(long)]
    bind: Option<String>,

    /// Server database (overrides server.database_url)
    #[arg(long)]
    database_url: Option<String>,
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

    let database_url = args
        .database_url
        .clone()
        .unwrap_or_else(|| cfg.server.database_url.clone());
    let pool = db::init_pool(&database_url).await?;
    db::run_server_migrations(&pool).await?;

    let bind = args.bind.clone().unwrap_or_else(|| cfg.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!(%bind, auth = cfg.server.api_token.is_some(), "sync server listening");

    let app = http::router(ServerState::from_config(pool, &cfg));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
