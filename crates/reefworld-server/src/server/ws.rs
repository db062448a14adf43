//! WebSocket transport — one task per connection owning both directions of
//! the socket. Inbound text is rate-limited, parsed at the boundary, and
//! applied under the state lock; outbound messages arrive through the
//! session's outbox channel.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use reefworld_core::protocol::{ClientMessage, ServerMessage};
use reefworld_core::verify::verify_legacy_agent;

use super::handlers::{self, Effects, IdentityDecision};
use super::session::{deliver, generate_connection_id, Session};
use super::{now_ms, AppState};

const MAX_MESSAGE_BYTES: usize = 64 * 1024;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let conn_id = generate_connection_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    info!("New connection: {}", conn_id);

    let welcome = {
        let mut shared = state.shared.lock().await;
        shared.sessions.insert(
            conn_id.clone(),
            Session::new(conn_id.clone(), now_ms(), tx),
        );
        handlers::welcome(&shared, &conn_id, &state.config)
    };
    if send(&mut socket, &welcome).await.is_err() {
        cleanup(&state, &conn_id).await;
        return;
    }

    // Fixed sliding window; everything over budget is dropped without a
    // reply so floods get no feedback.
    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        if send(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn_id, e);
                        break;
                    }
                };

                if window_start.elapsed().as_millis() as u64 > state.config.rate_limit_window_ms {
                    window_start = Instant::now();
                    window_count = 0;
                }
                window_count += 1;
                if window_count > state.config.rate_limit_max {
                    continue;
                }

                // Malformed JSON and unknown types are dropped, not
                // answered: no fingerprinting oracle for scanners.
                let msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Ignoring unparseable message from {}: {}", conn_id, e);
                        continue;
                    }
                };

                let effects = dispatch(&state, &conn_id, msg).await;
                if effects.dirty {
                    state.saver.mark_dirty();
                }
                if effects.close {
                    // Flush anything already queued (the rejection reply)
                    // before dropping the transport.
                    while let Ok(message) = rx.try_recv() {
                        if send(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }

    cleanup(&state, &conn_id).await;
}

/// Apply one parsed message and fan the results out. `identify` resolves
/// credentials first — the legacy-service call happens here, before the
/// state lock, bounded by the HTTP client timeout.
async fn dispatch(state: &Arc<AppState>, conn_id: &str, msg: ClientMessage) -> Effects {
    let now = now_ms();
    match msg {
        ClientMessage::Identify {
            role,
            api_key,
            legacy_api_key,
            agent_name,
            dev_bypass,
        } => {
            let decision = {
                let registry = state.registry.lock().await;
                handlers::resolve_identity(
                    &registry,
                    &state.config,
                    conn_id,
                    &role,
                    api_key.as_deref(),
                    legacy_api_key.as_deref(),
                    agent_name.as_deref(),
                    dev_bypass.as_deref(),
                )
            };
            let decision = match decision {
                IdentityDecision::NeedsLegacy(key) => {
                    handlers::decide_legacy(verify_legacy_agent(&state.config, &key).await)
                }
                decision => decision,
            };
            let mut shared = state.shared.lock().await;
            let effects = handlers::complete_identify(&mut shared, conn_id, decision, now);
            apply(&shared, effects)
        }
        msg => {
            let mut shared = state.shared.lock().await;
            let effects = handlers::handle(&mut shared, &state.config, conn_id, msg, now);
            apply(&shared, effects)
        }
    }
}

/// Deliver a handler's messages against the just-mutated state and hand the
/// residual flags back to the socket loop.
fn apply(shared: &super::session::Shared, effects: Effects) -> Effects {
    let Effects {
        messages,
        dirty,
        close,
    } = effects;
    deliver(shared, messages);
    Effects {
        messages: Vec::new(),
        dirty,
        close,
    }
}

async fn cleanup(state: &Arc<AppState>, conn_id: &str) {
    let mut shared = state.shared.lock().await;
    let effects = handlers::disconnect(&mut shared, conn_id, now_ms());
    let effects = apply(&shared, effects);
    drop(shared);
    if effects.dirty {
        state.saver.mark_dirty();
    }
    info!("Disconnected: {}", conn_id);
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("Failed to serialize outbound message: {}", e);
            Ok(())
        }
    }
}
