use std::sync::Arc;

use broker_core::broadcast::{Engine, NoFilters};
use broker_core::clock::Clock;
use broker_core::Storage;
use broker_server::storage::MemoryStorage;
use broker_server::{build_router, spawn_broadcast_loop, AppState};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A zero-configuration realtime state broker.
#[derive(Parser, Debug)]
#[command(name = "broker-server", version, about)]
struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,

    /// Log level passed to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Bearer token required on every request. Unset disables auth
    /// entirely (the zero-configuration default).
    #[arg(long, env = "AUTH_TOKEN")]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log_level))
        .init();

    let clock = Clock::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    clock.spawn_corrector(stop_rx);

    let storage = Arc::new(MemoryStorage::new(clock.clone()));
    let events = storage.watch();
    let engine = Arc::new(Engine::new(clock, Arc::new(NoFilters)));

    let broadcast_loop = spawn_broadcast_loop(events, engine.clone());

    let state = AppState::new(storage, engine.clone(), cli.auth_token);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %cli.bind_addr, "broker listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("shutting down: closing connections and stopping background tasks");
    engine.close_all().await;
    let _ = stop_tx.send(true);
    broadcast_loop.abort();
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown, mirroring the teacher's `services/server/src/main.rs`.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
