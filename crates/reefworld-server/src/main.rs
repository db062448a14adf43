//! reefworld-server — the world server process: WebSocket sessions, the
//! HTTP side channel, background sweeps, and debounced persistence around
//! the world state aggregate.

mod server;
mod sweeps;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info};

use reefworld_core::config::Config;
use reefworld_core::persist;
use reefworld_core::registry::AgentRegistry;
use reefworld_core::world::WorldState;

use server::session::Shared;
use server::{now_ms, AppState};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let config = match Config::load_from_dir(&cwd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!(
            "Cannot create data directory {}: {}",
            config.data_dir.display(),
            e
        );
        std::process::exit(1);
    }

    let world_path = config.world_state_path();
    let world = WorldState::load(&world_path, now_ms());
    let registry = AgentRegistry::load(&config.registry_path());

    let (saver, flush_task) = persist::saver(
        world_path.clone(),
        Duration::from_millis(config.save_debounce_ms),
    );

    let state = Arc::new(AppState {
        shared: Mutex::new(Shared::new(world)),
        registry: Mutex::new(registry),
        saver,
        config: config.clone(),
    });

    // The flush task snapshots the aggregate under the state lock; disk
    // failures are logged inside and retried on the next mark.
    let state_for_flush = Arc::clone(&state);
    tokio::spawn(flush_task.run(move || {
        let state = Arc::clone(&state_for_flush);
        async move {
            let shared = state.shared.lock().await;
            match serde_json::to_string(&shared.world) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    error!("Failed to serialize world state: {}", e);
                    None
                }
            }
        }
    }));

    sweeps::spawn(Arc::clone(&state));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind port");

    info!("Reefworld server running on port {}", config.port);
    info!("WebSocket: ws://localhost:{}/ws", config.port);
    info!(
        "Auction sweep: {} days inactive -> listed",
        config.auction_inactive_days
    );

    // Graceful shutdown on Ctrl+C with one final synchronous save — the
    // debounced writer may still be mid-window.
    let state_for_shutdown = Arc::clone(&state);
    let shutdown = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received, saving world state...");
        let shared = state_for_shutdown.shared.lock().await;
        if let Err(e) = shared.world.save_to(&world_path) {
            error!("Final save failed: {:#}", e);
        }
    };

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Server stopped.");
}
