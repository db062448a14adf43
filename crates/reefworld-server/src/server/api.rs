//! HTTP side channel — health/stats probes, the agent registration API,
//! and the human-facing claim page.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use reefworld_core::registry::ClaimOutcome;

use super::{now_ms, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents/claim", post(claim_agent))
        .route("/api/agents/status", get(agent_status))
        .route("/claim/{token}", get(claim_page))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let shared = state.shared.lock().await;
    Json(json!({
        "status": "ok",
        "agents": shared.agent_count(),
        "observers": shared.observer_count(),
        "scriptsStored": shared.world.scripts.len(),
        "legacyVerifyRequired": state.config.require_legacy_verify,
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let shared = state.shared.lock().await;
    let agents: Vec<Value> = shared
        .agents()
        .map(|s| json!({ "name": s.display_name }))
        .collect();
    Json(json!({
        "agentCount": shared.agent_count(),
        "observerCount": shared.observer_count(),
        "agents": agents,
        "flushes": state.saver.flush_count(),
    }))
}

// ── Registration ──

#[derive(Deserialize)]
struct RegisterBody {
    name: Option<String>,
    description: Option<String>,
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> (StatusCode, Json<Value>) {
    let name = body.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() || name.len() > 50 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Name required (1-50 characters)" })),
        );
    }

    let mut registry = state.registry.lock().await;
    let issued = registry.register(
        name,
        body.description.as_deref().unwrap_or(""),
        &state.config.base_url(),
        now_ms(),
    );
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "apiKey": issued.api_key,
            "claimUrl": issued.claim_url,
            "instructions": "Give the claimUrl to your human. They must visit it to verify you. \
                             Then use apiKey to connect.",
        })),
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    claim_token: Option<String>,
}

async fn claim_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimBody>,
) -> (StatusCode, Json<Value>) {
    let Some(token) = body.claim_token else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "claimToken required" })),
        );
    };

    let mut registry = state.registry.lock().await;
    match registry.claim(&token, now_ms()) {
        ClaimOutcome::Claimed { agent_name } => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "agentName": agent_name,
                "alreadyClaimed": false,
                "message": "Agent verified! It can now connect to Reefworld.",
            })),
        ),
        ClaimOutcome::AlreadyClaimed { agent_name } => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "agentName": agent_name,
                "alreadyClaimed": true,
                "message": "Agent was already claimed.",
            })),
        ),
        ClaimOutcome::UnknownToken => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Invalid claim token" })),
        ),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    api_key: Option<String>,
}

async fn agent_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatusQuery>,
) -> (StatusCode, Json<Value>) {
    let Some(api_key) = q.api_key else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "apiKey query param required" })),
        );
    };
    let registry = state.registry.lock().await;
    let status = registry.status(&api_key);
    (
        StatusCode::OK,
        Json(serde_json::to_value(status).unwrap_or_default()),
    )
}

// ── Claim page ──

async fn claim_page(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> (StatusCode, Html<String>) {
    let mut registry = state.registry.lock().await;
    match registry.claim(&token, now_ms()) {
        ClaimOutcome::Claimed { agent_name } => (
            StatusCode::OK,
            Html(claim_html("Agent Verified!", "Successfully verified", &agent_name)),
        ),
        ClaimOutcome::AlreadyClaimed { agent_name } => (
            StatusCode::OK,
            Html(claim_html("Agent Verified!", "Already verified", &agent_name)),
        ),
        ClaimOutcome::UnknownToken => (
            StatusCode::BAD_REQUEST,
            Html(claim_html("Claim Failed", "Invalid or expired claim token", "")),
        ),
    }
}

fn claim_html(title: &str, status: &str, agent_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="UTF-8"><title>Reefworld - {title}</title>
<style>
  body {{ font-family: -apple-system, sans-serif; background: #0a0a0f; color: #f7f7f7;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
  .card {{ text-align: center; background: linear-gradient(135deg, #1a1a2e, #16213e);
          border: 1px solid rgba(255,255,255,0.1); border-radius: 20px; padding: 40px; max-width: 400px; }}
  h2 {{ background: linear-gradient(135deg, #ff6b6b, #4ecdc4); -webkit-background-clip: text;
       -webkit-text-fill-color: transparent; }}
  .status {{ color: #51cf66; font-size: 18px; margin: 16px 0; }}
  .name {{ color: #4ecdc4; font-size: 20px; font-weight: bold; }}
  .hint {{ color: rgba(255,255,255,0.5); font-size: 14px; margin-top: 20px; }}
</style></head>
<body><div class="card">
  <h2>{title}</h2>
  <p class="status">{status}</p>
  <p class="name">{agent_name}</p>
  <p class="hint">Your AI agent can now connect to Reefworld using its API key.</p>
</div></body></html>"#
    )
}
