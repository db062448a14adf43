//! Message handlers — one function per inbound type, each a plain function
//! of (state, session, message) to outbound messages. No handler touches a
//! socket, so the whole dispatch table is testable without a live
//! connection; `ws.rs` delivers whatever comes back.

use rand::Rng;
use serde_json::Value;
use tracing::info;

use reefworld_core::config::Config;
use reefworld_core::economy::LAND_PRICE;
use reefworld_core::error::DomainError;
use reefworld_core::protocol::{
    ChannelInfo, ClientMessage, FriendInfo, LobsterDraft, PeerRef, ServerMessage,
    WelcomeInstructions, WorldSnapshot, ZoneAction, ZoneDraft,
};
use reefworld_core::registry::{AgentRegistry, Verification};
use reefworld_core::types::{
    AuctionIsland, BlockPos, ChatEntry, GridCell, LastPosition, LeaderboardCategory, Lobster,
    Role, ScriptEntry,
};
use reefworld_core::verify::LegacyOutcome;

use super::session::{Shared, Target};

const MAX_CHAT_LEN: usize = 500;
const MAX_OBSERVER_CHAT_LEN: usize = 200;
const MAX_BLOCK_TYPE_LEN: usize = 30;
const SNAPSHOT_SCRIPTS: usize = 100;
const SNAPSHOT_CHAT: usize = 50;

/// What a handler wants done: messages to fan out, whether the world
/// changed (schedules a debounced flush), and whether to drop the
/// connection afterwards.
#[derive(Debug, Default)]
pub struct Effects {
    pub messages: Vec<(Target, ServerMessage)>,
    pub dirty: bool,
    pub close: bool,
}

impl Effects {
    fn reply(conn_id: &str, message: ServerMessage) -> Self {
        Self {
            messages: vec![(Target::Conn(conn_id.to_string()), message)],
            ..Default::default()
        }
    }

    fn push(&mut self, target: Target, message: ServerMessage) {
        self.messages.push((target, message));
    }

    fn push_reply(&mut self, conn_id: &str, message: ServerMessage) {
        self.push(Target::Conn(conn_id.to_string()), message);
    }
}

/// Truncate to at most `max` bytes without splitting a character.
fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

pub fn welcome(shared: &Shared, conn_id: &str, config: &Config) -> ServerMessage {
    ServerMessage::Welcome {
        client_id: conn_id.to_string(),
        message: "Welcome to Reefworld!".to_string(),
        instructions: WelcomeInstructions {
            for_agents: "Send {type: \"identify\", role: \"agent\", apiKey: \"your_key\"}"
                .to_string(),
            for_humans: "Send {type: \"identify\", role: \"observer\"} (read-only access)"
                .to_string(),
        },
        agent_count: shared.agent_count(),
        legacy_verify_required: config.require_legacy_verify,
    }
}

// ── Identity ──

/// The outcome of credential resolution, applied by `complete_identify`.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityDecision {
    Agent {
        persistent_id: String,
        name: String,
        verified: bool,
    },
    Observer,
    /// `auth_failed`, with a claim hint where the caller can self-remediate.
    Rejected {
        error: String,
        claim_token: Option<String>,
        claim_url: Option<String>,
        close: bool,
    },
    /// `error` with a hint; the caller sent something unusable.
    Refused { error: String, hint: String },
    /// Path (c): the caller must be checked against the legacy service.
    /// The socket task performs the HTTP call before taking the state lock.
    NeedsLegacy(String),
}

/// Resolve an identify request through the three paths in priority order:
/// self-issued key, operator bypass, legacy external service. First
/// success wins; a key failing one path is not retried against another.
pub fn resolve_identity(
    registry: &AgentRegistry,
    config: &Config,
    conn_id: &str,
    role: &str,
    api_key: Option<&str>,
    legacy_api_key: Option<&str>,
    agent_name: Option<&str>,
    dev_bypass: Option<&str>,
) -> IdentityDecision {
    match role {
        "agent" => {
            if let Some(key) = api_key {
                return match registry.verify(key) {
                    Verification::Valid(agent) => IdentityDecision::Agent {
                        persistent_id: agent.id,
                        name: agent.display_name,
                        verified: true,
                    },
                    Verification::Unclaimed {
                        agent_name,
                        claim_token,
                    } => IdentityDecision::Rejected {
                        error: format!(
                            "Agent '{}' not claimed yet. Have your human visit the claim link.",
                            agent_name
                        ),
                        claim_url: Some(format!("{}/claim/{}", config.base_url(), claim_token)),
                        claim_token: Some(claim_token),
                        close: false,
                    },
                    Verification::UnknownKey => IdentityDecision::Rejected {
                        error: "Invalid API key. Register at POST /api/agents/register"
                            .to_string(),
                        claim_token: None,
                        claim_url: None,
                        close: false,
                    },
                };
            }

            let bypass_ok = matches!(
                (config.dev_bypass_key.as_deref(), dev_bypass),
                (Some(secret), Some(presented)) if !secret.is_empty() && secret == presented
            );
            if bypass_ok {
                let name = agent_name
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        let tag: String =
                            conn_id.trim_start_matches("c_").chars().take(6).collect();
                        format!("DevLobster_{}", tag)
                    });
                info!("Dev bypass identify: {}", name);
                return IdentityDecision::Agent {
                    persistent_id: name.clone(),
                    name,
                    verified: true,
                };
            }

            if config.require_legacy_verify {
                return match legacy_api_key {
                    Some(key) => IdentityDecision::NeedsLegacy(key.to_string()),
                    None => IdentityDecision::Refused {
                        error: "API key required".to_string(),
                        hint: "Use apiKey or legacyApiKey to authenticate.".to_string(),
                    },
                };
            }

            IdentityDecision::Rejected {
                error: "API key required. Register at POST /api/agents/register".to_string(),
                claim_token: None,
                claim_url: None,
                close: false,
            }
        }
        "observer" => IdentityDecision::Observer,
        _ => IdentityDecision::Refused {
            error: "Invalid role".to_string(),
            hint: "Use role: \"agent\" (for AI) or role: \"observer\" (for humans)".to_string(),
        },
    }
}

/// Interpret the legacy service's answer. This is the only path that closes
/// the connection on rejection.
pub fn decide_legacy(result: anyhow::Result<LegacyOutcome>) -> IdentityDecision {
    match result {
        Ok(outcome) if outcome.valid => {
            let name = outcome.agent_name.unwrap_or_else(|| "Agent".to_string());
            IdentityDecision::Agent {
                persistent_id: outcome.persistent_id.unwrap_or_else(|| name.clone()),
                name,
                verified: true,
            }
        }
        Ok(outcome) => IdentityDecision::Rejected {
            error: outcome
                .error
                .unwrap_or_else(|| "Verification failed".to_string()),
            claim_token: None,
            claim_url: outcome.claim_url,
            close: true,
        },
        Err(e) => IdentityDecision::Rejected {
            error: format!("Verification service unavailable: {}", e),
            claim_token: None,
            claim_url: None,
            close: true,
        },
    }
}

/// Bind the session to its resolved identity and announce it.
pub fn complete_identify(
    shared: &mut Shared,
    conn_id: &str,
    decision: IdentityDecision,
    now: i64,
) -> Effects {
    match decision {
        IdentityDecision::Agent {
            persistent_id,
            name,
            verified,
        } => {
            let Some(session) = shared.sessions.get_mut(conn_id) else {
                return Effects::default();
            };
            session.role = Some(Role::Agent);
            session.persistent_id = Some(persistent_id.clone());
            session.display_name = name.clone();
            session.verified = verified;
            shared.world.touch_activity(&persistent_id, now);
            let restored = shared.world.restore_zones_for(&persistent_id, now);

            let mut effects = Effects {
                dirty: true,
                ..Default::default()
            };
            effects.push_reply(
                conn_id,
                ServerMessage::AuthSuccess {
                    role: Role::Agent,
                    client_id: conn_id.to_string(),
                    persistent_id: Some(persistent_id),
                    agent_name: Some(name.clone()),
                    observer_name: None,
                    verified: Some(verified),
                    permissions: vec![
                        "build".to_string(),
                        "chat".to_string(),
                        "interact".to_string(),
                        "teleport".to_string(),
                    ],
                    message: None,
                },
            );
            effects.push_reply(
                conn_id,
                ServerMessage::WorldState {
                    state: Box::new(build_snapshot(shared, conn_id)),
                },
            );
            for zone in restored {
                effects.push(
                    Target::All,
                    ServerMessage::ZoneSync {
                        action: ZoneAction::Update,
                        zone,
                    },
                );
            }
            effects.push(
                Target::All,
                ServerMessage::AgentJoined {
                    agent_id: conn_id.to_string(),
                    agent_name: name.clone(),
                    verified,
                },
            );
            effects.push(
                Target::All,
                ServerMessage::AgentCount {
                    count: shared.agent_count(),
                },
            );
            info!("Agent entered world: {}", name);
            effects
        }
        IdentityDecision::Observer => {
            let name = format!("Observer_{}", rand::thread_rng().gen_range(1000..10000));
            let Some(session) = shared.sessions.get_mut(conn_id) else {
                return Effects::default();
            };
            session.role = Some(Role::Observer);
            session.display_name = name.clone();
            let mut effects = Effects::default();
            effects.push_reply(
                conn_id,
                ServerMessage::AuthSuccess {
                    role: Role::Observer,
                    client_id: conn_id.to_string(),
                    persistent_id: None,
                    agent_name: None,
                    observer_name: Some(name.clone()),
                    verified: None,
                    permissions: vec!["view".to_string(), "observer_chat".to_string()],
                    message: Some(
                        "You are observing Reefworld. Only AI agents can interact.".to_string(),
                    ),
                },
            );
            effects.push_reply(
                conn_id,
                ServerMessage::WorldState {
                    state: Box::new(build_snapshot(shared, conn_id)),
                },
            );
            effects.push(
                Target::All,
                ServerMessage::AgentCount {
                    count: shared.agent_count(),
                },
            );
            info!("Observer connected: {} ({})", name, conn_id);
            effects
        }
        IdentityDecision::Rejected {
            error,
            claim_token,
            claim_url,
            close,
        } => {
            let mut effects = Effects::reply(
                conn_id,
                ServerMessage::AuthFailed {
                    error,
                    claim_token,
                    claim_url,
                },
            );
            effects.close = close;
            effects
        }
        IdentityDecision::Refused { error, hint } => Effects::reply(
            conn_id,
            ServerMessage::Error {
                error,
                reason: None,
                hint: Some(hint),
            },
        ),
        IdentityDecision::NeedsLegacy(_) => {
            // The socket task resolves this variant before calling here.
            Effects::default()
        }
    }
}

// ── Dispatch ──

/// Handle any message other than `identify`. Role gating happens here, in
/// one place: refusals are always answered, never silently dropped.
pub fn handle(
    shared: &mut Shared,
    config: &Config,
    conn_id: &str,
    msg: ClientMessage,
    now: i64,
) -> Effects {
    let role = shared.sessions.get(conn_id).and_then(|s| s.role);

    match &msg {
        // Read-only views are open to every role.
        ClientMessage::GetWorldState
        | ClientMessage::GetAuctionIslands
        | ClientMessage::GetLeaderboard { .. } => {}
        ClientMessage::ObserverChat { .. } => {
            if role != Some(Role::Observer) {
                return Effects::reply(
                    conn_id,
                    ServerMessage::permission_denied(
                        "The observer side channel is for observers only.",
                    ),
                );
            }
        }
        _ => {
            if role != Some(Role::Agent) {
                return Effects::reply(
                    conn_id,
                    ServerMessage::permission_denied(
                        "Only AI agents can interact in this world. Humans may only observe.",
                    ),
                );
            }
        }
    }

    match msg {
        ClientMessage::Identify { .. } => Effects::default(), // handled by the socket task
        ClientMessage::Action { payload } => action(shared, config, conn_id, payload, now),
        ClientMessage::Chat { channel, text } => chat(shared, conn_id, channel, text, now),
        ClientMessage::ObserverChat { text } => observer_chat(shared, conn_id, text, now),
        ClientMessage::ZoneUpdate {
            action,
            zone,
            zone_id,
        } => zone_update(shared, conn_id, action, zone, zone_id, now),
        ClientMessage::LobsterSpawn { lobster } => lobster_spawn(shared, conn_id, lobster, now),
        ClientMessage::LobsterMove { x, y, z } => lobster_move(shared, conn_id, x, y, z, now),
        ClientMessage::BlockPlace {
            x,
            y,
            z,
            block_type,
        } => block_place(shared, config, conn_id, x, y, z, block_type, now),
        ClientMessage::BlockRemove { x, y, z } => block_remove(shared, conn_id, x, y, z, now),
        ClientMessage::Whisper { target_id, text } => whisper(shared, conn_id, target_id, text, now),
        ClientMessage::ChannelJoin { channel } => channel_join(shared, conn_id, channel),
        ClientMessage::ChannelLeave { channel } => channel_leave(shared, conn_id, channel),
        ClientMessage::ChannelList => channel_list(shared, conn_id),
        ClientMessage::FriendAdd { target_id } => friend_add(shared, conn_id, target_id, now),
        ClientMessage::FriendRemove { target_id } => friend_remove(shared, conn_id, target_id, now),
        ClientMessage::FriendList => friend_list(shared, conn_id),
        ClientMessage::GetWorldState => Effects::reply(
            conn_id,
            ServerMessage::WorldState {
                state: Box::new(build_snapshot(shared, conn_id)),
            },
        ),
        ClientMessage::GetAuctionIslands => Effects::reply(
            conn_id,
            ServerMessage::AuctionIslands {
                islands: shared.world.auction_islands(),
            },
        ),
        ClientMessage::GetLeaderboard { category } => {
            let category = category.unwrap_or(LeaderboardCategory::Visits);
            Effects::reply(
                conn_id,
                ServerMessage::LeaderboardData {
                    category,
                    rankings: shared.world.leaderboard(category),
                },
            )
        }
        ClientMessage::GetMyStats => {
            let (pid, ..) = agent_ctx(shared, conn_id);
            Effects::reply(conn_id, ServerMessage::MyStats(shared.world.my_stats(&pid)))
        }
        ClientMessage::IslandVisit { island_id } => island_visit(shared, conn_id, island_id, now),
        ClientMessage::IslandLike { island_id } => island_like(shared, conn_id, island_id, now),
        ClientMessage::GetBalance => {
            let (pid, ..) = agent_ctx(shared, conn_id);
            let wallet = shared.world.wallets.get(&pid).cloned().unwrap_or_default();
            Effects::reply(
                conn_id,
                ServerMessage::Balance {
                    balance: wallet.balance,
                    total_earned: wallet.total_earned,
                    total_spent: wallet.total_spent,
                },
            )
        }
        ClientMessage::BuyAuctionLand { island_id } => buy_land(shared, conn_id, island_id, now),
    }
}

/// Identity context of an agent session. Only called after the role gate,
/// so the fields are always bound.
fn agent_ctx(shared: &Shared, conn_id: &str) -> (String, String, bool, GridCell) {
    let session = shared.sessions.get(conn_id).expect("agent session exists");
    (
        session.persistent_id.clone().unwrap_or_default(),
        session.display_name.clone(),
        session.verified,
        session.grid_cell,
    )
}

// ── World mutation handlers ──

fn action(
    shared: &mut Shared,
    config: &Config,
    conn_id: &str,
    mut payload: Value,
    now: i64,
) -> Effects {
    let (pid, name, verified, cell) = agent_ctx(shared, conn_id);
    let mut effects = Effects::default();

    if let Some(Value::String(code)) = payload.get_mut("code") {
        *code = truncate_chars(code, config.max_code_length);
        if code.len() > 10 {
            shared.world.add_script(ScriptEntry {
                agent_id: pid,
                agent_name: name.clone(),
                verified,
                code: code.clone(),
                timestamp: now,
            });
            effects.dirty = true;
        }
    }

    let event = ServerMessage::Action {
        agent_id: conn_id.to_string(),
        agent_name: name,
        verified,
        payload,
    };
    effects.push(
        Target::Nearby {
            origin: cell,
            exclude: conn_id.to_string(),
        },
        event.clone(),
    );
    // The sender gets its own echo; nearby fan-out excludes it.
    effects.push_reply(conn_id, event);
    effects
}

fn chat(
    shared: &mut Shared,
    conn_id: &str,
    channel: Option<String>,
    text: String,
    now: i64,
) -> Effects {
    if text.is_empty() {
        return Effects::default();
    }
    let text = truncate_chars(&text, MAX_CHAT_LEN);
    let channel = channel.unwrap_or_else(|| "world".to_string());
    let (pid, name, ..) = agent_ctx(shared, conn_id);

    shared.world.append_chat(ChatEntry {
        channel: channel.clone(),
        from_id: pid,
        from_name: name.clone(),
        text: text.clone(),
        timestamp: now,
    });

    let message = ServerMessage::Chat {
        channel: channel.clone(),
        from: PeerRef {
            id: conn_id.to_string(),
            name,
        },
        text,
        timestamp: now,
    };
    let target = if channel == "world" {
        Target::AllAgentsExcept(conn_id.to_string())
    } else {
        Target::Channel {
            name: channel,
            exclude: Some(conn_id.to_string()),
        }
    };
    Effects {
        messages: vec![(target, message)],
        dirty: true,
        close: false,
    }
}

fn observer_chat(shared: &mut Shared, conn_id: &str, text: String, now: i64) -> Effects {
    if text.is_empty() {
        return Effects::default();
    }
    let session = shared.sessions.get(conn_id).expect("session exists");
    Effects {
        messages: vec![(
            Target::Observers,
            ServerMessage::ObserverChat {
                from: PeerRef {
                    id: conn_id.to_string(),
                    name: session.display_name.clone(),
                },
                text: truncate_chars(&text, MAX_OBSERVER_CHAT_LEN),
                timestamp: now,
            },
        )],
        ..Default::default()
    }
}

fn zone_update(
    shared: &mut Shared,
    conn_id: &str,
    action: ZoneAction,
    draft: Option<ZoneDraft>,
    zone_id: Option<String>,
    now: i64,
) -> Effects {
    let (pid, name, ..) = agent_ctx(shared, conn_id);

    let result = match action {
        ZoneAction::Create => match draft {
            Some(draft) => shared.world.claim_zone(&pid, &name, draft, now),
            None => Err(DomainError::ZoneNotFound),
        },
        ZoneAction::Update => match draft {
            Some(draft) => shared.world.update_zone(&pid, draft, now),
            None => Err(DomainError::ZoneNotFound),
        },
        ZoneAction::Delete => {
            let id = zone_id.or_else(|| draft.and_then(|d| d.id));
            match id {
                Some(id) => shared.world.delete_zone(&pid, &id, now),
                None => Err(DomainError::ZoneNotFound),
            }
        }
    };

    match result {
        Ok(zone) => {
            let mut effects = Effects {
                dirty: true,
                ..Default::default()
            };
            effects.push_reply(
                conn_id,
                ServerMessage::ZoneClaimResult {
                    success: true,
                    center: Some(zone.center),
                    zone: Some(zone.clone()),
                    error: None,
                },
            );
            effects.push(Target::All, ServerMessage::ZoneSync { action, zone });
            effects
        }
        Err(e) => Effects::reply(
            conn_id,
            ServerMessage::ZoneClaimResult {
                success: false,
                zone: None,
                center: None,
                error: Some(e.to_string()),
            },
        ),
    }
}

fn lobster_spawn(shared: &mut Shared, conn_id: &str, draft: LobsterDraft, now: i64) -> Effects {
    let (pid, name, ..) = agent_ctx(shared, conn_id);
    let lobster = Lobster {
        id: conn_id.to_string(),
        name: name.clone(),
        x: draft.x,
        y: draft.y,
        z: draft.z,
        color: draft.color.clone(),
    };
    shared.lobsters.insert(conn_id.to_string(), lobster.clone());

    let cell = GridCell::containing(draft.x, draft.z);
    if let Some(session) = shared.sessions.get_mut(conn_id) {
        session.grid_cell = cell;
    }
    shared.world.record_position(
        &pid,
        LastPosition {
            x: draft.x,
            y: draft.y,
            z: draft.z,
            color: draft.color,
            name,
        },
        now,
    );

    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };
    effects.push(
        Target::Nearby {
            origin: cell,
            exclude: conn_id.to_string(),
        },
        ServerMessage::LobsterSpawned {
            lobster: lobster.clone(),
        },
    );
    effects.push_reply(
        conn_id,
        ServerMessage::LobsterSync {
            lobsters: nearby_lobsters(shared, cell),
        },
    );
    effects
}

fn lobster_move(shared: &mut Shared, conn_id: &str, x: f64, y: f64, z: f64, now: i64) -> Effects {
    if !shared.lobsters.contains_key(conn_id) {
        return Effects::default();
    }
    let (pid, name, _, old_cell) = agent_ctx(shared, conn_id);
    let new_cell = GridCell::containing(x, z);

    {
        let lobster = shared.lobsters.get_mut(conn_id).expect("lobster exists");
        lobster.x = x;
        lobster.y = y;
        lobster.z = z;
    }
    if let Some(session) = shared.sessions.get_mut(conn_id) {
        session.grid_cell = new_cell;
    }
    shared.world.record_position(
        &pid,
        LastPosition {
            x,
            y,
            z,
            color: shared.lobsters[conn_id].color.clone(),
            name,
        },
        now,
    );

    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };

    // Crossing a cell boundary: exchange positions with agents that just
    // came into range, so distant peers don't appear to snap on approach.
    if new_cell != old_cell {
        for other in shared.agents() {
            if other.connection_id == conn_id {
                continue;
            }
            let Some(other_lobster) = shared.lobsters.get(&other.connection_id) else {
                continue;
            };
            let was_nearby = other.grid_cell.is_near(&old_cell);
            let is_nearby = other.grid_cell.is_near(&new_cell);
            if !was_nearby && is_nearby {
                effects.push_reply(
                    conn_id,
                    ServerMessage::LobsterMoved {
                        agent_id: other.connection_id.clone(),
                        x: other_lobster.x,
                        y: other_lobster.y,
                        z: other_lobster.z,
                    },
                );
                effects.push_reply(
                    &other.connection_id,
                    ServerMessage::LobsterMoved {
                        agent_id: conn_id.to_string(),
                        x,
                        y,
                        z,
                    },
                );
            }
        }
    }

    effects.push(
        Target::Nearby {
            origin: new_cell,
            exclude: conn_id.to_string(),
        },
        ServerMessage::LobsterMoved {
            agent_id: conn_id.to_string(),
            x,
            y,
            z,
        },
    );
    effects
}

fn nearby_lobsters(shared: &Shared, cell: GridCell) -> Vec<Lobster> {
    shared
        .lobsters
        .values()
        .filter(|l| GridCell::containing(l.x, l.z).is_near(&cell))
        .cloned()
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn block_place(
    shared: &mut Shared,
    config: &Config,
    conn_id: &str,
    x: f64,
    y: f64,
    z: f64,
    block_type: String,
    now: i64,
) -> Effects {
    if block_type.is_empty() || block_type.len() > MAX_BLOCK_TYPE_LEN {
        return Effects::default();
    }
    let (pid, name, ..) = agent_ctx(shared, conn_id);
    let pos = BlockPos::from_world(x, y, z);

    match shared
        .world
        .place_block(pos, block_type.clone(), config.max_blocks, now)
    {
        Ok(()) => {
            shared.world.track_contribution(&pid, &name, 1);
            Effects {
                messages: vec![(
                    Target::Nearby {
                        origin: GridCell::containing(x, z),
                        exclude: conn_id.to_string(),
                    },
                    ServerMessage::BlockPlaced {
                        x: pos.x,
                        y: pos.y,
                        z: pos.z,
                        block_type,
                        agent_id: conn_id.to_string(),
                    },
                )],
                dirty: true,
                close: false,
            }
        }
        Err(e) => Effects::reply(
            conn_id,
            ServerMessage::BlockPlaceFailed {
                error: e.to_string(),
            },
        ),
    }
}

fn block_remove(shared: &mut Shared, conn_id: &str, x: f64, y: f64, z: f64, now: i64) -> Effects {
    let pos = BlockPos::from_world(x, y, z);
    shared.world.remove_block(pos, now);
    Effects {
        messages: vec![(
            Target::Nearby {
                origin: GridCell::containing(x, z),
                exclude: conn_id.to_string(),
            },
            ServerMessage::BlockRemoved {
                x: pos.x,
                y: pos.y,
                z: pos.z,
                agent_id: conn_id.to_string(),
            },
        )],
        dirty: true,
        close: false,
    }
}

fn whisper(shared: &mut Shared, conn_id: &str, target_id: String, text: String, now: i64) -> Effects {
    if text.is_empty() {
        return Effects::default();
    }
    let (_, name, ..) = agent_ctx(shared, conn_id);

    let Some(target) = shared.find_agent(&target_id) else {
        return Effects::reply(
            conn_id,
            ServerMessage::error(DomainError::TargetOffline(target_id).to_string()),
        );
    };
    let mut effects = Effects::default();
    effects.push_reply(
        &target.connection_id,
        ServerMessage::Whisper {
            from: PeerRef {
                id: conn_id.to_string(),
                name,
            },
            text: truncate_chars(&text, MAX_CHAT_LEN),
            timestamp: now,
        },
    );
    effects.push_reply(
        conn_id,
        ServerMessage::WhisperSent {
            target_id: target.connection_id.clone(),
            target_name: target.display_name.clone(),
        },
    );
    effects
}

// ── Channels ──

fn channel_join(shared: &mut Shared, conn_id: &str, channel: String) -> Effects {
    let (_, name, ..) = agent_ctx(shared, conn_id);
    let channel = match reefworld_core::world::sanitize_channel_name(&channel) {
        Ok(channel) => channel,
        Err(e) => return Effects::reply(conn_id, ServerMessage::error(e.to_string())),
    };
    let member_count = shared.world.join_channel(&channel, conn_id);
    info!("{} joined #{} ({} members)", name, channel, member_count);

    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };
    effects.push_reply(
        conn_id,
        ServerMessage::ChannelJoined {
            channel: channel.clone(),
            member_count,
        },
    );
    effects.push(
        Target::Channel {
            name: channel.clone(),
            exclude: Some(conn_id.to_string()),
        },
        ServerMessage::ChannelUserJoined {
            channel,
            user: PeerRef {
                id: conn_id.to_string(),
                name,
            },
        },
    );
    effects
}

fn channel_leave(shared: &mut Shared, conn_id: &str, channel: String) -> Effects {
    let (_, name, ..) = agent_ctx(shared, conn_id);
    let channel = channel.to_lowercase();
    let was_member = shared.world.leave_channel(&channel, conn_id);

    let mut effects = Effects {
        dirty: was_member,
        ..Default::default()
    };
    if was_member {
        effects.push(
            Target::Channel {
                name: channel.clone(),
                exclude: Some(conn_id.to_string()),
            },
            ServerMessage::ChannelUserLeft {
                channel: channel.clone(),
                user: PeerRef {
                    id: conn_id.to_string(),
                    name,
                },
            },
        );
    }
    effects.push_reply(conn_id, ServerMessage::ChannelLeft { channel });
    effects
}

fn channel_list(shared: &Shared, conn_id: &str) -> Effects {
    let channels = shared
        .world
        .channels
        .iter()
        .map(|(name, members)| ChannelInfo {
            name: name.clone(),
            member_count: members.len(),
            joined: members.contains(conn_id),
        })
        .collect();
    Effects::reply(conn_id, ServerMessage::ChannelListResponse { channels })
}

// ── Friends ──

fn friend_add(shared: &mut Shared, conn_id: &str, target_id: String, now: i64) -> Effects {
    let (pid, name, ..) = agent_ctx(shared, conn_id);

    // Online targets resolve to their durable id; otherwise the caller is
    // trusted to have supplied a persistent id directly.
    let (friend_id, friend_name, online_conn) = match shared.find_agent(&target_id) {
        Some(target) => (
            target.persistent_id.clone().unwrap_or_default(),
            target.display_name.clone(),
            Some(target.connection_id.clone()),
        ),
        None => (target_id.clone(), target_id, None),
    };
    shared.world.add_friend(&pid, &friend_id, now);

    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };
    effects.push_reply(
        conn_id,
        ServerMessage::FriendAdded {
            friend_id,
            friend_name,
        },
    );
    if let Some(target_conn) = online_conn {
        effects.push_reply(
            &target_conn,
            ServerMessage::FriendRequest {
                from: PeerRef {
                    id: conn_id.to_string(),
                    name,
                },
            },
        );
    }
    effects
}

fn friend_remove(shared: &mut Shared, conn_id: &str, target_id: String, now: i64) -> Effects {
    let (pid, ..) = agent_ctx(shared, conn_id);
    let friend_id = shared
        .find_agent(&target_id)
        .and_then(|t| t.persistent_id.clone())
        .unwrap_or(target_id);
    shared.world.remove_friend(&pid, &friend_id, now);

    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };
    effects.push_reply(conn_id, ServerMessage::FriendRemoved { friend_id });
    effects
}

fn friend_list(shared: &Shared, conn_id: &str) -> Effects {
    let (pid, ..) = agent_ctx(shared, conn_id);
    let friends = shared
        .world
        .friends_of(&pid)
        .into_iter()
        .map(|friend_id| {
            let session = shared
                .agents()
                .find(|s| s.persistent_id.as_deref() == Some(friend_id.as_str()));
            FriendInfo {
                name: session
                    .map(|s| s.display_name.clone())
                    .unwrap_or_else(|| friend_id.clone()),
                online: session.is_some(),
                id: friend_id,
            }
        })
        .collect();
    Effects::reply(conn_id, ServerMessage::FriendListResponse { friends })
}

// ── Economy ──

fn island_visit(shared: &mut Shared, conn_id: &str, island_id: String, now: i64) -> Effects {
    let (pid, ..) = agent_ctx(shared, conn_id);
    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };
    if let Some(earned) = shared.world.record_visit(&pid, &island_id, now) {
        effects.push_reply(
            conn_id,
            ServerMessage::CoinReward {
                reason: "visit".to_string(),
                amount: earned.amount,
                balance: earned.balance,
            },
        );
    }
    effects
}

fn island_like(shared: &mut Shared, conn_id: &str, island_id: String, now: i64) -> Effects {
    let (pid, ..) = agent_ctx(shared, conn_id);
    match shared.world.record_like(&pid, &island_id, now) {
        Ok(liked) => Effects {
            messages: vec![(
                Target::Conn(conn_id.to_string()),
                ServerMessage::LikeResult {
                    success: true,
                    island_id: Some(island_id),
                    likes: Some(liked.likes),
                    reward: Some(liked.reward),
                    balance: Some(liked.balance),
                    error: None,
                },
            )],
            dirty: true,
            close: false,
        },
        Err(e) => Effects::reply(
            conn_id,
            ServerMessage::LikeResult {
                success: false,
                island_id: None,
                likes: None,
                reward: None,
                balance: None,
                error: Some(e.to_string()),
            },
        ),
    }
}

fn buy_land(shared: &mut Shared, conn_id: &str, island_id: String, now: i64) -> Effects {
    let (pid, name, ..) = agent_ctx(shared, conn_id);
    match shared.world.buy_zone(&pid, &name, &island_id, LAND_PRICE, now) {
        Ok((zone, balance)) => {
            let mut effects = Effects {
                dirty: true,
                ..Default::default()
            };
            effects.push_reply(
                conn_id,
                ServerMessage::BuyResult {
                    success: true,
                    island: Some(AuctionIsland::from(&zone)),
                    price: Some(LAND_PRICE),
                    balance: Some(balance),
                    error: None,
                },
            );
            effects.push(
                Target::All,
                ServerMessage::ZoneSync {
                    action: ZoneAction::Update,
                    zone: zone.clone(),
                },
            );
            effects.push(
                Target::All,
                ServerMessage::LandPurchased {
                    buyer: name,
                    island_name: zone.name,
                    price: LAND_PRICE,
                },
            );
            effects
        }
        Err(e) => Effects::reply(
            conn_id,
            ServerMessage::BuyResult {
                success: false,
                island: None,
                price: None,
                balance: None,
                error: Some(e.to_string()),
            },
        ),
    }
}

// ── Disconnect ──

/// Role-specific teardown after the transport closes. The session is gone
/// from every index by the time the returned messages are resolved.
pub fn disconnect(shared: &mut Shared, conn_id: &str, now: i64) -> Effects {
    let Some(session) = shared.sessions.remove(conn_id) else {
        return Effects::default();
    };
    if !session.is_agent() {
        return Effects::default();
    }

    shared.lobsters.remove(conn_id);

    let mut effects = Effects {
        dirty: true,
        ..Default::default()
    };
    for channel in shared.world.purge_connection(conn_id) {
        effects.push(
            Target::Channel {
                name: channel.clone(),
                exclude: None,
            },
            ServerMessage::ChannelUserLeft {
                channel,
                user: PeerRef {
                    id: conn_id.to_string(),
                    name: session.display_name.clone(),
                },
            },
        );
    }
    if let Some(pid) = &session.persistent_id {
        shared
            .world
            .accumulate_online(pid, now - session.connected_at, now);
    }
    effects.push(
        Target::All,
        ServerMessage::AgentLeft {
            agent_id: conn_id.to_string(),
            agent_name: session.display_name,
        },
    );
    effects.push(
        Target::All,
        ServerMessage::AgentCount {
            count: shared.agent_count(),
        },
    );
    effects
}

// ── Snapshots ──

/// The world snapshot for one session: observers see every lobster, agents
/// only those within the broadcast radius (distant state re-syncs on the
/// next request).
pub fn build_snapshot(shared: &Shared, conn_id: &str) -> WorldSnapshot {
    let session = shared.sessions.get(conn_id);
    let is_observer = session.map(|s| s.is_observer()).unwrap_or(true);
    let cell = session.map(|s| s.grid_cell).unwrap_or_default();
    let pid = session.and_then(|s| s.persistent_id.clone());

    let lobsters = if is_observer {
        shared.lobsters.values().cloned().collect()
    } else {
        nearby_lobsters(shared, cell)
    };

    WorldSnapshot {
        scripts: shared.world.recent_scripts(SNAPSHOT_SCRIPTS),
        islands: shared.world.zones.clone(),
        blocks: shared.world.blocks.clone(),
        recent_chat: shared.world.recent_chat(SNAPSHOT_CHAT),
        lobsters,
        channels: shared.world.channels.keys().cloned().collect(),
        friendships: pid
            .as_deref()
            .map(|pid| shared.world.friends_of(pid))
            .unwrap_or_default(),
        island_stats: serde_json::to_value(&shared.world.island_stats).unwrap_or_default(),
        agent_stats: serde_json::to_value(&shared.world.agent_stats).unwrap_or_default(),
        wallet: pid.and_then(|pid| shared.world.wallets.get(&pid).cloned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reefworld_core::economy::VISIT_REWARD;
    use reefworld_core::types::AuctionState;
    use reefworld_core::world::WorldState;
    use tokio::sync::mpsc;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn shared() -> Shared {
        Shared::new(WorldState::default())
    }

    fn connect(shared: &mut Shared, id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        shared
            .sessions
            .insert(id.to_string(), super::super::session::Session::new(id.to_string(), 0, tx));
        rx
    }

    fn agent(shared: &mut Shared, id: &str, name: &str, cell: (i64, i64)) {
        let effects = complete_identify(
            shared,
            id,
            IdentityDecision::Agent {
                persistent_id: format!("pid-{}", name),
                name: name.to_string(),
                verified: true,
            },
            0,
        );
        assert!(effects.dirty);
        shared.sessions.get_mut(id).unwrap().grid_cell = GridCell {
            x: cell.0,
            z: cell.1,
        };
    }

    fn observer(shared: &mut Shared, id: &str) {
        complete_identify(shared, id, IdentityDecision::Observer, 0);
    }

    fn targets_of(effects: &Effects) -> Vec<&Target> {
        effects.messages.iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Multi-byte character straddling the cut point is dropped whole.
        assert_eq!(truncate_chars("héllo", 2), "h");
    }

    #[test]
    fn test_observer_block_place_is_refused_and_world_unchanged() {
        let mut shared = shared();
        let _rx = connect(&mut shared, "c_o");
        observer(&mut shared, "c_o");

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_o",
            ClientMessage::BlockPlace {
                x: 1.0,
                y: 1.0,
                z: 1.0,
                block_type: "coral".into(),
            },
            10,
        );
        assert!(!effects.dirty);
        assert_eq!(effects.messages.len(), 1);
        assert!(matches!(
            &effects.messages[0],
            (Target::Conn(id), ServerMessage::Error { error, .. })
                if id == "c_o" && error == "Permission denied"
        ));
        assert!(shared.world.blocks.is_empty());
    }

    #[test]
    fn test_unidentified_session_is_refused() {
        let mut shared = shared();
        let _rx = connect(&mut shared, "c_x");
        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_x",
            ClientMessage::Chat {
                channel: None,
                text: "hi".into(),
            },
            10,
        );
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::Error { .. }
        ));
    }

    #[test]
    fn test_block_place_broadcasts_nearby_and_tracks_contribution() {
        let mut shared = shared();
        let _rx = connect(&mut shared, "c_a");
        agent(&mut shared, "c_a", "A", (0, 0));

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::BlockPlace {
                x: 10.0,
                y: 0.0,
                z: 10.0,
                block_type: "coral".into(),
            },
            10,
        );
        assert!(effects.dirty);
        assert!(matches!(
            &effects.messages[0],
            (Target::Nearby { exclude, .. }, ServerMessage::BlockPlaced { .. })
                if exclude == "c_a"
        ));
        assert_eq!(shared.world.agent_stats["pid-A"].contributions, 1);
    }

    #[test]
    fn test_broadcast_radius_scenario() {
        // A builds; adjacent C and the observer hear it, far-away B does
        // not — but B still sees the block in a requested snapshot.
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        let _rb = connect(&mut shared, "c_b");
        let _rc = connect(&mut shared, "c_c");
        let _ro = connect(&mut shared, "c_o");
        agent(&mut shared, "c_a", "A", (0, 0));
        agent(&mut shared, "c_b", "B", (5, 5));
        agent(&mut shared, "c_c", "C", (1, 1));
        observer(&mut shared, "c_o");

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::BlockPlace {
                x: 1.0,
                y: 0.0,
                z: 1.0,
                block_type: "coral".into(),
            },
            10,
        );
        let mut heard = super::super::session::recipients(&shared, &effects.messages[0].0);
        heard.sort();
        assert_eq!(heard, vec!["c_c".to_string(), "c_o".to_string()]);

        let snapshot = build_snapshot(&shared, "c_b");
        assert_eq!(snapshot.blocks.len(), 1);
    }

    #[test]
    fn test_identify_agent_restores_listed_zone() {
        let mut shared = shared();
        shared.world.touch_activity("pid-A", 0);
        shared
            .world
            .claim_zone(
                "pid-A",
                "A",
                ZoneDraft {
                    id: None,
                    name: "Cove".into(),
                    grid_position: Some(GridCell { x: 2, z: 2 }),
                    center: None,
                    tags: Vec::new(),
                },
                0,
            )
            .unwrap();
        let threshold = 30 * DAY_MS;
        assert_eq!(shared.world.sweep_inactive_zones(threshold + 1, threshold).len(), 1);

        let _rx = connect(&mut shared, "c_a");
        let effects = complete_identify(
            &mut shared,
            "c_a",
            IdentityDecision::Agent {
                persistent_id: "pid-A".into(),
                name: "A".into(),
                verified: true,
            },
            threshold + 2,
        );

        // auth_success, snapshot, the restored zone broadcast, joined, count.
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::AuthSuccess { role: Role::Agent, .. }
        ));
        assert!(effects
            .messages
            .iter()
            .any(|(t, m)| *t == Target::All && matches!(m, ServerMessage::ZoneSync { .. })));
        assert_eq!(
            shared.world.zones.iter().find(|z| z.name == "Cove").unwrap().auction,
            AuctionState::None
        );
    }

    #[test]
    fn test_identify_observer_gets_named_and_counted() {
        let mut shared = shared();
        let _rx = connect(&mut shared, "c_o");
        let effects = complete_identify(&mut shared, "c_o", IdentityDecision::Observer, 0);

        match &effects.messages[0].1 {
            ServerMessage::AuthSuccess {
                role: Role::Observer,
                observer_name: Some(name),
                ..
            } => assert!(name.starts_with("Observer_")),
            other => panic!("wrong first message: {:?}", other),
        }
        assert!(!effects.dirty);
        assert!(targets_of(&effects).contains(&&Target::All));
    }

    #[test]
    fn test_resolve_identity_prefers_registry_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AgentRegistry::load(&dir.path().join("agents.json"));
        let issued = registry.register("Clacker", "", "http://localhost:8080", 1);
        registry.claim(&issued.claim_token, 2);

        let mut config = Config::default();
        config.dev_bypass_key = Some("hunter2".into());

        // The self-issued key wins even when a bypass secret is also valid.
        let decision = resolve_identity(
            &registry,
            &config,
            "c_1",
            "agent",
            Some(&issued.api_key),
            None,
            Some("Ignored"),
            Some("hunter2"),
        );
        assert!(matches!(
            decision,
            IdentityDecision::Agent { verified: true, ref name, .. } if name == "Clacker"
        ));

        // Without a key the bypass applies.
        let decision = resolve_identity(
            &registry,
            &config,
            "c_1",
            "agent",
            None,
            None,
            Some("Crabby"),
            Some("hunter2"),
        );
        assert!(matches!(
            decision,
            IdentityDecision::Agent { ref persistent_id, .. } if persistent_id == "Crabby"
        ));

        // No credential at all is rejected with a registration hint.
        let decision =
            resolve_identity(&registry, &config, "c_1", "agent", None, None, None, None);
        assert!(matches!(
            decision,
            IdentityDecision::Rejected { close: false, .. }
        ));
    }

    #[test]
    fn test_resolve_identity_unclaimed_key_carries_claim_hint() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AgentRegistry::load(&dir.path().join("agents.json"));
        let issued = registry.register("Snapper", "", "http://localhost:8080", 1);

        let decision = resolve_identity(
            &registry,
            &Config::default(),
            "c_1",
            "agent",
            Some(&issued.api_key),
            None,
            None,
            None,
        );
        match decision {
            IdentityDecision::Rejected {
                claim_token: Some(token),
                claim_url: Some(url),
                close: false,
                ..
            } => {
                assert_eq!(token, issued.claim_token);
                assert!(url.ends_with(&issued.claim_token));
            }
            other => panic!("expected claim hint, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_rejection_closes_connection() {
        let decision = decide_legacy(Ok(LegacyOutcome {
            valid: false,
            error: Some("not claimed".into()),
            claim_url: Some("https://x/claim/1".into()),
            ..Default::default()
        }));
        assert!(matches!(decision, IdentityDecision::Rejected { close: true, .. }));

        let mut shared = shared();
        let _rx = connect(&mut shared, "c_a");
        let effects = complete_identify(&mut shared, "c_a", decision, 0);
        assert!(effects.close);
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::AuthFailed { .. }
        ));
    }

    #[test]
    fn test_world_chat_is_stored_and_routed_past_sender() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        agent(&mut shared, "c_a", "A", (0, 0));

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::Chat {
                channel: None,
                text: "hello reef".into(),
            },
            10,
        );
        assert!(effects.dirty);
        assert_eq!(
            effects.messages[0].0,
            Target::AllAgentsExcept("c_a".to_string())
        );
        assert_eq!(shared.world.chat_history.len(), 1);
        assert_eq!(shared.world.chat_history[0].from_id, "pid-A");
    }

    #[test]
    fn test_channel_join_chat_leave_cycle() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        let _rb = connect(&mut shared, "c_b");
        agent(&mut shared, "c_a", "A", (0, 0));
        agent(&mut shared, "c_b", "B", (0, 0));
        let config = Config::default();

        let effects = handle(
            &mut shared,
            &config,
            "c_a",
            ClientMessage::ChannelJoin {
                channel: "Reef Builders".into(),
            },
            1,
        );
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::ChannelJoined { channel, member_count: 1 } if channel == "reefbuilders"
        ));
        handle(
            &mut shared,
            &config,
            "c_b",
            ClientMessage::ChannelJoin {
                channel: "reefbuilders".into(),
            },
            2,
        );

        let effects = handle(
            &mut shared,
            &config,
            "c_a",
            ClientMessage::Chat {
                channel: Some("reefbuilders".into()),
                text: "anyone here?".into(),
            },
            3,
        );
        assert_eq!(
            effects.messages[0].0,
            Target::Channel {
                name: "reefbuilders".into(),
                exclude: Some("c_a".into())
            }
        );

        let effects = handle(
            &mut shared,
            &config,
            "c_b",
            ClientMessage::ChannelLeave {
                channel: "reefbuilders".into(),
            },
            4,
        );
        assert!(effects.dirty);
        let effects = handle(&mut shared, &config, "c_a", ClientMessage::ChannelList, 5);
        match &effects.messages[0].1 {
            ServerMessage::ChannelListResponse { channels } => {
                assert_eq!(channels.len(), 1);
                assert_eq!(channels[0].member_count, 1);
                assert!(channels[0].joined);
            }
            other => panic!("wrong reply: {:?}", other),
        }
    }

    #[test]
    fn test_whisper_resolves_by_name() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        let _rb = connect(&mut shared, "c_b");
        agent(&mut shared, "c_a", "A", (0, 0));
        agent(&mut shared, "c_b", "Barnacle", (9, 9));

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::Whisper {
                target_id: "barnacle".into(),
                text: "psst".into(),
            },
            1,
        );
        assert_eq!(effects.messages[0].0, Target::Conn("c_b".into()));
        assert!(matches!(
            &effects.messages[1].1,
            ServerMessage::WhisperSent { target_name, .. } if target_name == "Barnacle"
        ));

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::Whisper {
                target_id: "ghost".into(),
                text: "psst".into(),
            },
            2,
        );
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::Error { .. }
        ));
    }

    #[test]
    fn test_visit_reward_reaches_wire_once() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        let _rh = connect(&mut shared, "c_h");
        agent(&mut shared, "c_a", "A", (0, 0));
        agent(&mut shared, "c_h", "Host", (0, 0));
        let zone = shared
            .world
            .claim_zone(
                "pid-Host",
                "Host",
                ZoneDraft {
                    id: None,
                    name: "Host Reef".into(),
                    grid_position: Some(GridCell { x: 3, z: 3 }),
                    center: None,
                    tags: Vec::new(),
                },
                0,
            )
            .unwrap();

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::IslandVisit {
                island_id: zone.id.clone(),
            },
            10,
        );
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::CoinReward { amount, .. } if *amount == VISIT_REWARD
        ));

        // Same day, same island: counted but unrewarded.
        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::IslandVisit {
                island_id: zone.id.clone(),
            },
            20,
        );
        assert!(effects.messages.is_empty());
        assert_eq!(shared.world.island_stats[&zone.id].visits, 2);
    }

    #[test]
    fn test_lobster_spawn_and_move_update_grid_and_positions() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        agent(&mut shared, "c_a", "A", (0, 0));

        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::LobsterSpawn {
                lobster: LobsterDraft {
                    x: 100.0,
                    y: 0.0,
                    z: 100.0,
                    color: Some("#ff6b6b".into()),
                },
            },
            10,
        );
        assert!(effects.dirty);
        assert_eq!(
            shared.sessions["c_a"].grid_cell,
            GridCell { x: 1, z: 1 }
        );
        assert!(matches!(
            &effects.messages[1].1,
            ServerMessage::LobsterSync { lobsters } if lobsters.len() == 1
        ));

        handle(
            &mut shared,
            &Config::default(),
            "c_a",
            ClientMessage::LobsterMove {
                x: 300.0,
                y: 0.0,
                z: 300.0,
            },
            20,
        );
        assert_eq!(
            shared.sessions["c_a"].grid_cell,
            GridCell { x: 4, z: 4 }
        );
        // Durable last-seen position follows the live one.
        assert_eq!(shared.world.lobster_positions["pid-A"].x, 300.0);
    }

    #[test]
    fn test_grid_crossing_exchanges_positions() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        let _rb = connect(&mut shared, "c_b");
        agent(&mut shared, "c_a", "A", (0, 0));
        agent(&mut shared, "c_b", "B", (3, 3));
        let config = Config::default();

        handle(
            &mut shared,
            &config,
            "c_a",
            ClientMessage::LobsterSpawn {
                lobster: LobsterDraft {
                    x: 10.0,
                    y: 0.0,
                    z: 10.0,
                    color: None,
                },
            },
            1,
        );
        handle(
            &mut shared,
            &config,
            "c_b",
            ClientMessage::LobsterSpawn {
                lobster: LobsterDraft {
                    x: 200.0,
                    y: 0.0,
                    z: 200.0,
                    color: None,
                },
            },
            2,
        );

        // A moves into the cell adjacent to B: both get a position sync.
        let effects = handle(
            &mut shared,
            &config,
            "c_a",
            ClientMessage::LobsterMove {
                x: 150.0,
                y: 0.0,
                z: 150.0,
            },
            3,
        );
        let exchanged: Vec<_> = effects
            .messages
            .iter()
            .filter(|(t, m)| {
                matches!(m, ServerMessage::LobsterMoved { .. })
                    && matches!(t, Target::Conn(_))
            })
            .collect();
        assert_eq!(exchanged.len(), 2);
    }

    #[test]
    fn test_disconnect_cleans_up_agent() {
        let mut shared = shared();
        let _ra = connect(&mut shared, "c_a");
        let _rb = connect(&mut shared, "c_b");
        agent(&mut shared, "c_a", "A", (0, 0));
        agent(&mut shared, "c_b", "B", (0, 0));
        let config = Config::default();
        handle(
            &mut shared,
            &config,
            "c_a",
            ClientMessage::ChannelJoin {
                channel: "reef".into(),
            },
            1,
        );
        handle(
            &mut shared,
            &config,
            "c_b",
            ClientMessage::ChannelJoin {
                channel: "reef".into(),
            },
            2,
        );
        handle(
            &mut shared,
            &config,
            "c_a",
            ClientMessage::LobsterSpawn {
                lobster: LobsterDraft {
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    color: None,
                },
            },
            3,
        );

        let effects = disconnect(&mut shared, "c_a", 5000);
        assert!(effects.dirty);
        assert!(!shared.sessions.contains_key("c_a"));
        assert!(!shared.lobsters.contains_key("c_a"));
        assert!(!shared.world.channels["reef"].contains("c_a"));
        assert_eq!(shared.world.agent_activity["pid-A"].total_online_ms, 5000);
        assert!(effects
            .messages
            .iter()
            .any(|(_, m)| matches!(m, ServerMessage::AgentLeft { .. })));
        assert!(effects
            .messages
            .iter()
            .any(|(_, m)| matches!(m, ServerMessage::AgentCount { count: 1 })));
    }

    #[test]
    fn test_buy_land_round_trip_on_the_wire() {
        let mut shared = shared();
        shared.world.touch_activity("pid-Old", 0);
        let zone = shared
            .world
            .claim_zone(
                "pid-Old",
                "Old",
                ZoneDraft {
                    id: None,
                    name: "Old Cove".into(),
                    grid_position: Some(GridCell { x: 4, z: 4 }),
                    center: None,
                    tags: Vec::new(),
                },
                0,
            )
            .unwrap();
        let threshold = 30 * DAY_MS;
        shared.world.sweep_inactive_zones(threshold + 1, threshold);

        let _rb = connect(&mut shared, "c_b");
        agent(&mut shared, "c_b", "Buyer", (0, 0));

        // Broke buyer: refusal carries the shortfall, nothing changes.
        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_b",
            ClientMessage::BuyAuctionLand {
                island_id: zone.id.clone(),
            },
            threshold + 2,
        );
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::BuyResult { success: false, .. }
        ));

        shared
            .world
            .wallets
            .entry("pid-Buyer".into())
            .or_default()
            .balance = 500.0;
        let effects = handle(
            &mut shared,
            &Config::default(),
            "c_b",
            ClientMessage::BuyAuctionLand {
                island_id: zone.id.clone(),
            },
            threshold + 3,
        );
        assert!(matches!(
            &effects.messages[0].1,
            ServerMessage::BuyResult { success: true, balance: Some(b), .. } if *b == 100.0
        ));
        assert!(effects
            .messages
            .iter()
            .any(|(t, m)| *t == Target::All && matches!(m, ServerMessage::LandPurchased { .. })));
    }
}
