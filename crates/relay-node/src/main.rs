//! # Relay Node
//!
//! The main entry point for running an Agent Relay daemon.

use anyhow::Result;
use clap::Parser;
use relay_node::config::DaemonConfig;
use relay_node::http::{create_router, AppState};
use relay_node::metrics::RelayMetrics;
use relay_node::orchestrator::{NullSpawner, Orchestrator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Agent Relay - messaging substrate for coding-agent fleets
#[derive(Parser, Debug)]
#[command(name = "relay-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, default_value = "127.0.0.1:8790")]
    http_addr: SocketAddr,

    /// Workspace directory served by the default daemon
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Do not auto-start daemons for known workspaces
    #[arg(long)]
    no_auto_start: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Agent Relay");

    let config = DaemonConfig::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let metrics = RelayMetrics::new();
    let orchestrator = Arc::new(Orchestrator::load(
        config,
        metrics.clone(),
        Arc::new(NullSpawner),
        !args.no_auto_start,
    )?);

    // First boot: register the launch workspace.
    if orchestrator.workspaces().is_empty() {
        let workspace = args.workspace.canonicalize().unwrap_or(args.workspace.clone());
        let name = workspace
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        orchestrator.add_workspace(&name, &workspace)?;
    }
    orchestrator.start_daemons().await;

    if let Some(daemon) = orchestrator.active_daemon() {
        tracing::info!(socket = %daemon.socket_path().display(), "agent socket ready");
    }

    let state = AppState {
        orchestrator: orchestrator.clone(),
        metrics,
    };
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(args.http_addr).await?;
    tracing::info!(addr = %args.http_addr, "HTTP server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    tracing::info!("Agent Relay running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    server.abort();
    orchestrator.shutdown().await;

    Ok(())
}
