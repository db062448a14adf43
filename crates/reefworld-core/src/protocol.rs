//! Wire protocol — JSON messages with a mandatory `type` tag, one enum
//! variant per message type. Payloads are validated here at the boundary so
//! domain code never sees duck-typed maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::{
    AuctionIsland, BlockPos, ChatEntry, GridCell, LeaderboardCategory, LeaderboardRow, Lobster,
    MyStats, Position3, Role, ScriptEntry, Wallet, Zone,
};

// ── Inbound ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneAction {
    Create,
    Update,
    Delete,
}

/// Client-supplied zone fields for a claim/update. Ownership is assigned
/// server-side from the session, never taken from the draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub grid_position: Option<GridCell>,
    #[serde(default)]
    pub center: Option<Position3>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobsterDraft {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Identify {
        role: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        legacy_api_key: Option<String>,
        #[serde(default)]
        agent_name: Option<String>,
        #[serde(default)]
        dev_bypass: Option<String>,
    },
    Action {
        payload: Value,
    },
    Chat {
        #[serde(default)]
        channel: Option<String>,
        text: String,
    },
    ObserverChat {
        text: String,
    },
    ZoneUpdate {
        action: ZoneAction,
        #[serde(default)]
        zone: Option<ZoneDraft>,
        #[serde(default)]
        zone_id: Option<String>,
    },
    LobsterSpawn {
        lobster: LobsterDraft,
    },
    LobsterMove {
        x: f64,
        y: f64,
        z: f64,
    },
    BlockPlace {
        x: f64,
        y: f64,
        z: f64,
        block_type: String,
    },
    BlockRemove {
        x: f64,
        y: f64,
        z: f64,
    },
    Whisper {
        target_id: String,
        text: String,
    },
    ChannelJoin {
        channel: String,
    },
    ChannelLeave {
        channel: String,
    },
    ChannelList,
    FriendAdd {
        target_id: String,
    },
    FriendRemove {
        target_id: String,
    },
    FriendList,
    GetWorldState,
    GetAuctionIslands,
    GetLeaderboard {
        #[serde(default)]
        category: Option<LeaderboardCategory>,
    },
    GetMyStats,
    IslandVisit {
        island_id: String,
    },
    IslandLike {
        island_id: String,
    },
    GetBalance,
    BuyAuctionLand {
        island_id: String,
    },
}

// ── Outbound ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeInstructions {
    pub for_agents: String,
    pub for_humans: String,
}

/// Sender identity attached to chat/whisper/channel events. The `id` is the
/// session's connection id so clients can route by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub name: String,
    pub member_count: usize,
    pub joined: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendInfo {
    pub id: String,
    pub name: String,
    pub online: bool,
}

/// The snapshot sent in reply to `get_world_state` and after auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldSnapshot {
    pub scripts: Vec<ScriptEntry>,
    pub islands: Vec<Zone>,
    pub blocks: HashMap<BlockPos, String>,
    pub recent_chat: Vec<ChatEntry>,
    pub lobsters: Vec<Lobster>,
    pub channels: Vec<String>,
    pub friendships: Vec<String>,
    pub island_stats: Value,
    pub agent_stats: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet: Option<Wallet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        client_id: String,
        message: String,
        instructions: WelcomeInstructions,
        agent_count: usize,
        legacy_verify_required: bool,
    },
    AuthSuccess {
        role: Role,
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        persistent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        observer_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verified: Option<bool>,
        permissions: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    AuthFailed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        claim_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        claim_url: Option<String>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    WorldState {
        state: Box<WorldSnapshot>,
    },
    AgentJoined {
        agent_id: String,
        agent_name: String,
        verified: bool,
    },
    AgentLeft {
        agent_id: String,
        agent_name: String,
    },
    AgentCount {
        count: usize,
    },
    Action {
        agent_id: String,
        agent_name: String,
        verified: bool,
        payload: Value,
    },
    Chat {
        channel: String,
        from: PeerRef,
        text: String,
        timestamp: i64,
    },
    ObserverChat {
        from: PeerRef,
        text: String,
        timestamp: i64,
    },
    ZoneSync {
        action: ZoneAction,
        zone: Zone,
    },
    ZoneClaimResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        zone: Option<Zone>,
        #[serde(skip_serializing_if = "Option::is_none")]
        center: Option<Position3>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    IslandAuction {
        island: AuctionIsland,
    },
    LobsterSpawned {
        lobster: Lobster,
    },
    LobsterMoved {
        agent_id: String,
        x: f64,
        y: f64,
        z: f64,
    },
    LobsterSync {
        lobsters: Vec<Lobster>,
    },
    BlockPlaced {
        x: i64,
        y: i64,
        z: i64,
        block_type: String,
        agent_id: String,
    },
    BlockRemoved {
        x: i64,
        y: i64,
        z: i64,
        agent_id: String,
    },
    BlockPlaceFailed {
        error: String,
    },
    Whisper {
        from: PeerRef,
        text: String,
        timestamp: i64,
    },
    WhisperSent {
        target_id: String,
        target_name: String,
    },
    ChannelJoined {
        channel: String,
        member_count: usize,
    },
    ChannelLeft {
        channel: String,
    },
    ChannelUserJoined {
        channel: String,
        user: PeerRef,
    },
    ChannelUserLeft {
        channel: String,
        user: PeerRef,
    },
    ChannelListResponse {
        channels: Vec<ChannelInfo>,
    },
    FriendAdded {
        friend_id: String,
        friend_name: String,
    },
    FriendRemoved {
        friend_id: String,
    },
    FriendRequest {
        from: PeerRef,
    },
    FriendListResponse {
        friends: Vec<FriendInfo>,
    },
    AuctionIslands {
        islands: Vec<AuctionIsland>,
    },
    LeaderboardData {
        category: LeaderboardCategory,
        rankings: Vec<LeaderboardRow>,
    },
    MyStats(MyStats),
    CoinReward {
        reason: String,
        amount: f64,
        balance: f64,
    },
    LikeResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        island_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        likes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reward: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        balance: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Balance {
        balance: f64,
        total_earned: f64,
        total_spent: f64,
    },
    BuyResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        island: Option<AuctionIsland>,
        #[serde(skip_serializing_if = "Option::is_none")]
        price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        balance: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    LandPurchased {
        buyer: String,
        island_name: String,
        price: f64,
    },
    WeeklyRewardsDistributed {
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            reason: None,
            hint: None,
        }
    }

    pub fn permission_denied(reason: &str) -> Self {
        ServerMessage::Error {
            error: "Permission denied".to_string(),
            reason: Some(reason.to_string()),
            hint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_parses_with_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"identify","role":"agent","apiKey":"rw_abc","agentName":"Clacker"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Identify { role, api_key, agent_name, .. } => {
                assert_eq!(role, "agent");
                assert_eq!(api_key.as_deref(), Some("rw_abc"));
                assert_eq!(agent_name.as_deref(), Some("Clacker"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_block_place_parses() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"block_place","x":1.2,"y":3.0,"z":-4.9,"blockType":"kelp"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::BlockPlace { x, z, block_type, .. } => {
                assert_eq!(x, 1.2);
                assert_eq!(z, -4.9);
                assert_eq!(block_type, "kelp");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unit_variant_parses_from_bare_type() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_balance"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetBalance));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"set_weather"}"#).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_value(ServerMessage::AgentCount { count: 3 }).unwrap();
        assert_eq!(json["type"], "agent_count");
        assert_eq!(json["count"], 3);

        let json = serde_json::to_value(ServerMessage::CoinReward {
            reason: "visit".into(),
            amount: 0.1,
            balance: 1.5,
        })
        .unwrap();
        assert_eq!(json["type"], "coin_reward");
        assert_eq!(json["balance"], 1.5);
    }

    #[test]
    fn test_error_skips_empty_fields() {
        let json = serde_json::to_value(ServerMessage::error("nope")).unwrap();
        assert!(json.get("reason").is_none());
        assert!(json.get("hint").is_none());
    }

    #[test]
    fn test_auth_failed_carries_claim_hint() {
        let json = serde_json::to_value(ServerMessage::AuthFailed {
            error: "Agent not claimed yet".into(),
            claim_token: Some("tok123".into()),
            claim_url: Some("http://localhost:8080/claim/tok123".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "auth_failed");
        assert_eq!(json["claimToken"], "tok123");
    }
}
