//! troupe - multi-agent session orchestration daemon.
//!
//! Supervises one worker subprocess per active agent session and routes
//! messages between UI clients (WebSocket) and those subprocesses. Clients
//! connect to `ws://host:port/ws`; see `troupe-protocol` for the message
//! types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::get};
use clap::Parser;
use log::{info, warn};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use troupe::config::{self, AppConfig};
use troupe::orchestrator::continuation::SignalHeuristic;
use troupe::orchestrator::context::NullResolver;
use troupe::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorEvent};
use troupe::session::MemoryStore;
use troupe::supervisor::{ProcessSpawner, SupervisorConfig};
use troupe::ws::{AppState, WsHub, ws_handler};

#[derive(Debug, Parser)]
#[command(name = "troupe", about = "Multi-agent session orchestration daemon", version)]
struct Cli {
    /// Path to the config file (default: ~/.config/troupe/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the worker runtime binary.
    #[arg(long)]
    worker_binary: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_or_init(cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(worker_binary) = cli.worker_binary {
        config.worker.binary = worker_binary;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.clone()),
    )
    .init();

    info!("starting troupe v{}", env!("CARGO_PKG_VERSION"));
    run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
    let hub = Arc::new(WsHub::new());
    let store = Arc::new(MemoryStore::new());
    let spawner = Arc::new(ProcessSpawner::new(SupervisorConfig {
        worker_binary: config.worker.binary.clone(),
    }));

    let (orchestrator, handle) = Orchestrator::new(
        OrchestratorConfig::from_app(&config),
        spawner,
        store,
        Arc::new(NullResolver),
        Box::new(SignalHeuristic::new()),
        Arc::clone(&hub),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run());

    let state = AppState {
        hub: Arc::clone(&hub),
        orchestrator: handle.clone(),
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("listening on ws://{}/ws", addr);

    let shutdown_handle = handle.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("shutdown signal received, stopping workers...");
        if shutdown_handle.send(OrchestratorEvent::Shutdown).await.is_err() {
            warn!("orchestrator already stopped");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    let _ = orchestrator_task.await;
    info!("shutdown complete");
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
