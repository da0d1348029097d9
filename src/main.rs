//! modelyard - container control plane for on-host inference engines.
//!
//! Boots the store, runs the startup reconciliation pass (importing any
//! containers orphaned by a previous run), and serves the control API
//! until SIGTERM/SIGINT.

use anyhow::{Context, Result};
use clap::Parser;
use modelyard::Config;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelyard")]
#[command(about = "Container control plane for on-host inference engines")]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Database path (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Skip the startup orphan-import pass
    #[arg(long)]
    no_auto_import: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // LOG_LEVEL drives filtering; daemon CLI chatter sits under the
    // "docker" target (e.g. LOG_LEVEL=info,docker=debug).
    let filter = if args.verbose {
        EnvFilter::new("modelyard=debug,tower_http=debug,docker=debug")
    } else {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("starting modelyard");

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if args.no_auto_import {
        config.auto_import = false;
    }

    // Metrics exporter, if enabled.
    if config.metrics_port != 0 {
        if let Some(handle) = modelyard::telemetry::install() {
            let addr = format!("0.0.0.0:{}", config.metrics_port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind metrics to {addr}"))?;
            info!(addr = %addr, "serving metrics");
            tokio::spawn(async move {
                let app = axum::Router::new().route(
                    "/metrics",
                    axum::routing::get(move || {
                        let handle = handle.clone();
                        async move { handle.render() }
                    }),
                );
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "metrics server error");
                }
            });
        }
    }

    // A store that cannot come up is fatal: exit non-zero.
    let (app, state) = modelyard::build_app(config.clone())
        .await
        .context("failed to build application")?;

    // Realign with the daemon before taking traffic.
    if config.auto_import {
        match state.reconciler.reconcile(None, true).await {
            Ok(report) => {
                if !report.imported.is_empty() {
                    info!(
                        imported = report.imported.len(),
                        "startup reconciliation imported orphaned containers"
                    );
                }
            }
            Err(e) => warn!(error = %e, "startup reconciliation failed"),
        }
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(addr = %addr, "listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down cleanly");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT so axum can drain in-flight handlers.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
