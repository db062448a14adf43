//! Server wiring — shared state and the Axum router.

pub mod api;
pub mod handlers;
pub mod session;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use reefworld_core::config::Config;
use reefworld_core::persist::SaveHandle;
use reefworld_core::registry::AgentRegistry;

use session::Shared;

/// Shared application state. `shared` is the single-writer world lock;
/// every message handler and both sweeps mutate through it.
pub struct AppState {
    pub shared: Mutex<Shared>,
    pub registry: Mutex<AgentRegistry>,
    pub saver: SaveHandle,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::very_permissive();

    Router::new()
        .merge(api::routes())
        .merge(ws::routes())
        .layer(cors)
        .with_state(state)
}

/// Epoch milliseconds; the one clock the whole server runs on.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
