//! Dogfight Server - authoritative real-time sync for multiplayer combat
//!
//! This is the main entry point. It wires:
//! - WebSocket connections for inputs, snapshots and combat
//! - The fixed-rate tick broadcaster
//! - Connection arbitration across processes
//! - Match stats persistence and ranking

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dogfight_server::app::{match_store_for, AppState};
use dogfight_server::config::Config;
use dogfight_server::http::build_router;
use dogfight_server::session::LocalBus;
use dogfight_server::store::{stats::run_ranking_job, MemoryStore};
use dogfight_server::util::time::init_server_time;

/// How often expired side-store entries are dropped
const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Dogfight Server");
    info!(
        addr = %config.server_addr,
        process_id = %config.process_id,
        tick_rate_hz = config.tick_rate_hz,
        persistence = config.persistence.is_some(),
        "Configuration loaded"
    );

    // Collaborators
    let side_store = MemoryStore::new();
    let bus = Arc::new(LocalBus::new());
    let match_store = match_store_for(&config);

    // Create application state
    let (state, broadcaster) = AppState::new(
        config.clone(),
        Arc::new(side_store.clone()),
        bus,
        match_store.clone(),
    );

    // Spawn the tick loop
    tokio::spawn(broadcaster.run());

    // Connection arbitration
    state.sessions.spawn_bus_listener();
    state.sessions.spawn_sweeper(config.sweep_interval);

    // Side store housekeeping
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STORE_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = side_store.purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired side-store entries");
            }
        }
    });

    // Ranking aggregation
    tokio::spawn(run_ranking_job(match_store, config.ranking_interval));

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws?player_id=<id>", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
