//! World Engine Server - persistent-world scheduling and movement engine
//!
//! This is the main entry point for the engine. It handles:
//! - HTTP endpoints for sending, previewing and cancelling troop movements
//! - Training, building and quest queues per village
//! - The tick trigger that applies every due job exactly once
//! - A PostgREST store backend, or an in-memory world for local runs

mod app;
mod config;
mod error;
mod http;
mod jobs;
mod rally;
mod scheduler;
mod store;
mod util;
mod world;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::game::GameConfig;
use crate::config::{Config, LogFormat};
use crate::http::build_router;
use crate::store::{MemoryStore, PostgrestClient, PostgrestStore, WorldSeed, WorldStore};
use crate::util::time::{init_server_time, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level, config.log_format);

    // Initialize server time tracking
    init_server_time();

    info!("Starting World Engine Server");
    info!("Server address: {}", config.server_addr);

    let game = match &config.game_config_path {
        Some(path) => GameConfig::from_file(path)?,
        None => GameConfig::default(),
    };
    info!(
        units = game.units.len(),
        buildings = game.buildings.len(),
        quests = game.quests.len(),
        server_speed = game.globals.server_speed,
        "Game data loaded"
    );

    let store = open_store(&config, &game)?;

    // Create application state
    let state = AppState::new(config.clone(), game, store, Arc::new(SystemClock));

    // Spawn the built-in tick trigger
    if config.tick_interval_secs > 0 {
        let tick_state = state.clone();
        let period = Duration::from_secs(config.tick_interval_secs);
        tokio::spawn(async move {
            run_tick_loop(tick_state, period).await;
        });
    } else {
        info!("Built-in tick trigger disabled; waiting for POST /tick");
    }

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Pick the remote store when configured, otherwise seed an in-memory world
fn open_store(config: &Config, game: &GameConfig) -> anyhow::Result<Arc<dyn WorldStore>> {
    if let Some(remote) = &config.store {
        info!(url = %remote.url, "Using PostgREST store");
        return Ok(Arc::new(PostgrestStore::new(PostgrestClient::new(remote))));
    }

    let memory = MemoryStore::new();
    match &config.world_seed_path {
        Some(path) => {
            let seed = WorldSeed::load(path)?;
            seed.validate(game)?;
            let villages = seed.apply(&memory);
            info!(villages, path = %path.display(), "Seeded in-memory world");
        }
        None => warn!("No STORE_URL or WORLD_SEED_PATH set; starting with an empty world"),
    }
    Ok(Arc::new(memory))
}

/// Periodic sweep of due jobs
async fn run_tick_loop(state: AppState, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs(), "Tick loop started");

    loop {
        interval.tick().await;

        // The scheduler logs its own report
        if let Err(e) = state.scheduler.tick().await {
            error!(error = %e, "Tick aborted");
        }

        state.limiter.prune();
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
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
