//! Engram Server Binary
//!
//! REST surface for the engram adaptive memory engine. Configuration comes
//! from `ENGRAM_*` environment variables; `--host`/`--port`/`--db` override
//! the bind address and database path. Background maintenance (inferred-
//! memory TTL pruning, metrics flush) runs on a dedicated worker fed by a
//! bounded channel plus a fixed interval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engram_core::EngineConfig;
use engram_server::config::ApiConfig;
use engram_server::routes::{router, AppState};
use engram_server::service::ApiService;

#[derive(Debug, Parser)]
#[command(name = "engram-server", version, about = "Adaptive memory engine REST server")]
struct Cli {
    /// Bind host (overrides ENGRAM_API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides ENGRAM_API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path (overrides ENGRAM_SQLITE_PATH)
    #[arg(long)]
    db: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut api_config = ApiConfig::from_env().context("invalid api configuration")?;
    if let Some(host) = cli.host {
        api_config.bind_host = host;
    }
    if let Some(port) = cli.port {
        api_config.bind_port = port;
    }
    let mut engine_config = EngineConfig::from_env().context("invalid engine configuration")?;
    if let Some(db) = cli.db {
        engine_config.sqlite_path = db;
    }

    let maintenance_interval = api_config.maintenance_interval_seconds.max(1);
    let addr: SocketAddr = format!("{}:{}", api_config.bind_host, api_config.bind_port)
        .parse()
        .context("invalid bind address")?;

    let service = Arc::new(
        ApiService::new(api_config, engine_config)
            .map_err(|error| anyhow::anyhow!("service init failed: {error}"))?,
    );

    // Maintenance worker: bounded channel for request-path ticks, interval
    // as the floor cadence
    let (maintenance_tx, mut maintenance_rx) = mpsc::channel::<()>(64);
    let worker_service = service.clone();
    let worker = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(maintenance_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                received = maintenance_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            worker_service.engine().run_maintenance();
        }
    });

    let state = AppState {
        service: service.clone(),
        maintenance: maintenance_tx,
    };
    let app = router(state);

    info!("engram server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind failed")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("engram server shutting down");
    worker.abort();
    service.engine().close();
    Ok(())
}

/// Graceful shutdown on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "ctrl-c listener failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => warn!(%error, "sigterm listener failed"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}
