//! The world state aggregate — every durable entity in one versioned
//! document, loaded on boot and flushed through the debounced saver.
//!
//! Mutations are applied by whichever task holds the server's state lock;
//! nothing in here spawns or awaits, so each operation is atomic with
//! respect to every other.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DomainError;
use crate::types::{
    AgentActivity, AgentStats, BlockPos, ChatEntry, GridCell, IslandStats, LastPosition,
    ScriptEntry, Wallet, Zone,
};

/// Schema version of the persisted document.
pub const SCHEMA_VERSION: u32 = 5;

/// Chat ring buffer: prune down to KEEP once MAX is exceeded.
pub const CHAT_HISTORY_MAX: usize = 1000;
pub const CHAT_HISTORY_KEEP: usize = 500;

/// Script log bounds.
pub const SCRIPTS_MAX: usize = 10_000;
pub const SCRIPTS_KEEP: usize = 5000;

pub const SPAWN_ZONE_ID: &str = "spawn";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldState {
    pub version: u32,
    pub scripts: Vec<ScriptEntry>,
    pub zones: Vec<Zone>,
    pub blocks: HashMap<BlockPos, String>,
    pub chat_history: Vec<ChatEntry>,
    /// Channel name -> member connection ids.
    pub channels: HashMap<String, HashSet<String>>,
    /// Persistent id -> friend ids.
    pub friendships: HashMap<String, HashSet<String>>,
    /// Persistent id -> last known position.
    pub lobster_positions: HashMap<String, LastPosition>,
    pub agent_activity: HashMap<String, AgentActivity>,
    pub island_stats: HashMap<String, IslandStats>,
    pub agent_stats: HashMap<String, AgentStats>,
    pub wallets: HashMap<String, Wallet>,
    pub last_weekly_reward: i64,
    pub last_update: i64,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            scripts: Vec::new(),
            zones: Vec::new(),
            blocks: HashMap::new(),
            chat_history: Vec::new(),
            channels: HashMap::new(),
            friendships: HashMap::new(),
            lobster_positions: HashMap::new(),
            agent_activity: HashMap::new(),
            island_stats: HashMap::new(),
            agent_stats: HashMap::new(),
            wallets: HashMap::new(),
            last_weekly_reward: 0,
            last_update: 0,
        }
    }
}

impl WorldState {
    /// Load the persisted document, or start fresh when it is missing or
    /// unreadable. Unknown-to-old fields fall back to defaults, so documents
    /// written by earlier versions keep loading.
    pub fn load(path: &Path, now: i64) -> Self {
        let mut state = if path.is_file() {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<WorldState>(&content) {
                    Ok(state) => {
                        info!(
                            "Loaded world state: {} zones, {} blocks, {} wallets",
                            state.zones.len(),
                            state.blocks.len(),
                            state.wallets.len()
                        );
                        state
                    }
                    Err(e) => {
                        warn!("World state unreadable ({}), starting fresh", e);
                        WorldState::default()
                    }
                },
                Err(e) => {
                    warn!("Failed to read world state ({}), starting fresh", e);
                    WorldState::default()
                }
            }
        } else {
            info!("No world state on disk, starting fresh");
            WorldState::default()
        };
        state.version = SCHEMA_VERSION;
        state.ensure_spawn_zone(now);
        state
    }

    /// Serialize and write the document, atomically via a temp-file rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let doc = serde_json::to_string(self).context("Failed to serialize world state")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, doc)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// The designated spawn parcel exists from first boot and is never
    /// auctioned.
    fn ensure_spawn_zone(&mut self, now: i64) {
        if self.zones.iter().any(|z| z.is_spawn) {
            return;
        }
        let grid = GridCell { x: 0, z: 0 };
        self.zones.push(Zone {
            id: SPAWN_ZONE_ID.to_string(),
            name: "Spawn Island".to_string(),
            grid_position: grid,
            center: grid.center(),
            owner_id: None,
            owner_name: None,
            created_at: now,
            is_spawn: true,
            is_protected: true,
            auction: Default::default(),
            auction_started_at: None,
            tags: Vec::new(),
        });
    }

    // ── Blocks ──

    pub fn place_block(
        &mut self,
        pos: BlockPos,
        block_type: String,
        max_blocks: usize,
        now: i64,
    ) -> Result<(), DomainError> {
        if !self.blocks.contains_key(&pos) && self.blocks.len() >= max_blocks {
            return Err(DomainError::BlockLimitReached);
        }
        self.blocks.insert(pos, block_type);
        self.last_update = now;
        Ok(())
    }

    pub fn remove_block(&mut self, pos: BlockPos, now: i64) {
        self.blocks.remove(&pos);
        self.last_update = now;
    }

    // ── Chat & scripts ──

    pub fn append_chat(&mut self, entry: ChatEntry) {
        self.last_update = entry.timestamp;
        self.chat_history.push(entry);
        if self.chat_history.len() > CHAT_HISTORY_MAX {
            let cut = self.chat_history.len() - CHAT_HISTORY_KEEP;
            self.chat_history.drain(..cut);
        }
    }

    pub fn recent_chat(&self, n: usize) -> Vec<ChatEntry> {
        let start = self.chat_history.len().saturating_sub(n);
        self.chat_history[start..].to_vec()
    }

    pub fn add_script(&mut self, entry: ScriptEntry) {
        self.last_update = entry.timestamp;
        self.scripts.push(entry);
        if self.scripts.len() > SCRIPTS_MAX {
            let cut = self.scripts.len() - SCRIPTS_KEEP;
            self.scripts.drain(..cut);
        }
    }

    pub fn recent_scripts(&self, n: usize) -> Vec<ScriptEntry> {
        let start = self.scripts.len().saturating_sub(n);
        self.scripts[start..].to_vec()
    }

    // ── Channels ──

    /// Join a channel, creating it on first member. Returns the member count.
    pub fn join_channel(&mut self, channel: &str, connection_id: &str) -> usize {
        let members = self.channels.entry(channel.to_string()).or_default();
        members.insert(connection_id.to_string());
        members.len()
    }

    /// Leave a channel. Empty channels are dropped entirely — a channel with
    /// zero members never persists. Returns whether the caller was a member.
    pub fn leave_channel(&mut self, channel: &str, connection_id: &str) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let was_member = members.remove(connection_id);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        was_member
    }

    /// Remove a disconnecting session from every channel it joined.
    /// Returns the channels it was removed from.
    pub fn purge_connection(&mut self, connection_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            if self.leave_channel(&name, connection_id) {
                affected.push(name);
            }
        }
        affected
    }

    // ── Friends ──

    pub fn add_friend(&mut self, persistent_id: &str, friend_id: &str, now: i64) {
        self.friendships
            .entry(persistent_id.to_string())
            .or_default()
            .insert(friend_id.to_string());
        self.last_update = now;
    }

    pub fn remove_friend(&mut self, persistent_id: &str, friend_id: &str, now: i64) {
        if let Some(friends) = self.friendships.get_mut(persistent_id) {
            friends.remove(friend_id);
        }
        self.last_update = now;
    }

    pub fn friends_of(&self, persistent_id: &str) -> Vec<String> {
        self.friendships
            .get(persistent_id)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Positions & activity ──

    pub fn record_position(&mut self, persistent_id: &str, pos: LastPosition, now: i64) {
        self.lobster_positions.insert(persistent_id.to_string(), pos);
        self.last_update = now;
    }

    pub fn touch_activity(&mut self, persistent_id: &str, now: i64) {
        self.agent_activity
            .entry(persistent_id.to_string())
            .and_modify(|a| a.last_online = now)
            .or_insert(AgentActivity {
                first_seen: now,
                last_online: now,
                total_online_ms: 0,
            });
        self.last_update = now;
    }

    pub fn accumulate_online(&mut self, persistent_id: &str, session_ms: i64, now: i64) {
        if let Some(activity) = self.agent_activity.get_mut(persistent_id) {
            activity.last_online = now;
            activity.total_online_ms += session_ms.max(0);
        }
        self.last_update = now;
    }

    // ── Zone accessors ──

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == zone_id)
    }

    pub fn zone_mut(&mut self, zone_id: &str) -> Option<&mut Zone> {
        self.zones.iter_mut().find(|z| z.id == zone_id)
    }

    pub fn zones_owned_by<'a>(
        &'a self,
        persistent_id: &'a str,
    ) -> impl Iterator<Item = &'a Zone> + 'a {
        self.zones
            .iter()
            .filter(move |z| z.owner_id.as_deref() == Some(persistent_id))
    }
}

/// Lowercase, strip everything outside `[a-z0-9_-]`, enforce 2..=20 chars.
pub fn sanitize_channel_name(raw: &str) -> Result<String, DomainError> {
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    if name.len() < 2 || name.len() > 20 {
        return Err(DomainError::InvalidChannelName);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: i64) -> ChatEntry {
        ChatEntry {
            channel: "world".into(),
            from_id: "a1".into(),
            from_name: "Pincers".into(),
            text: format!("msg {}", n),
            timestamp: n,
        }
    }

    #[test]
    fn test_block_last_write_wins() {
        let mut world = WorldState::default();
        let pos = BlockPos { x: 1, y: 2, z: 3 };
        world.place_block(pos, "sand".into(), 100, 1).unwrap();
        world.place_block(pos, "coral".into(), 100, 2).unwrap();
        assert_eq!(world.blocks.get(&pos).map(String::as_str), Some("coral"));

        world.remove_block(pos, 3);
        assert!(!world.blocks.contains_key(&pos));
    }

    #[test]
    fn test_block_cap_rejects_new_but_allows_overwrite() {
        let mut world = WorldState::default();
        let a = BlockPos { x: 0, y: 0, z: 0 };
        let b = BlockPos { x: 1, y: 0, z: 0 };
        world.place_block(a, "sand".into(), 1, 1).unwrap();

        assert_eq!(
            world.place_block(b, "sand".into(), 1, 2),
            Err(DomainError::BlockLimitReached)
        );
        // Overwriting an existing coordinate does not grow the world.
        world.place_block(a, "coral".into(), 1, 3).unwrap();
        assert_eq!(world.blocks.len(), 1);
    }

    #[test]
    fn test_chat_history_pruned_to_keep() {
        let mut world = WorldState::default();
        for n in 0..(CHAT_HISTORY_MAX as i64 + 1) {
            world.append_chat(entry(n));
        }
        assert_eq!(world.chat_history.len(), CHAT_HISTORY_KEEP);
        // Newest entries survive.
        assert_eq!(
            world.chat_history.last().unwrap().timestamp,
            CHAT_HISTORY_MAX as i64
        );
    }

    #[test]
    fn test_empty_channel_is_dropped() {
        let mut world = WorldState::default();
        assert_eq!(world.join_channel("reef", "c_1"), 1);
        assert_eq!(world.join_channel("reef", "c_2"), 2);

        assert!(world.leave_channel("reef", "c_1"));
        assert!(world.channels.contains_key("reef"));
        assert!(world.leave_channel("reef", "c_2"));
        assert!(!world.channels.contains_key("reef"));
        // Leaving a channel you never joined is a no-op.
        assert!(!world.leave_channel("reef", "c_3"));
    }

    #[test]
    fn test_purge_connection_reports_channels() {
        let mut world = WorldState::default();
        world.join_channel("reef", "c_1");
        world.join_channel("kelp", "c_1");
        world.join_channel("kelp", "c_2");

        let mut affected = world.purge_connection("c_1");
        affected.sort();
        assert_eq!(affected, vec!["kelp".to_string(), "reef".to_string()]);
        assert!(!world.channels.contains_key("reef"));
        assert_eq!(world.channels["kelp"].len(), 1);
    }

    #[test]
    fn test_sanitize_channel_name() {
        assert_eq!(sanitize_channel_name("Reef Chat!").unwrap(), "reefchat");
        assert!(sanitize_channel_name("x").is_err());
        assert!(sanitize_channel_name("!!").is_err());
        assert!(sanitize_channel_name(&"a".repeat(21)).is_err());
    }

    #[test]
    fn test_spawn_zone_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world_state.json");
        let world = WorldState::load(&path, 10);
        assert_eq!(world.zones.len(), 1);
        assert!(world.zones[0].is_spawn);

        world.save_to(&path).unwrap();
        let reloaded = WorldState::load(&path, 20);
        assert_eq!(reloaded.zones.len(), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world_state.json");

        let mut world = WorldState::load(&path, 1);
        world
            .place_block(BlockPos { x: 5, y: 1, z: -2 }, "kelp".into(), 100, 2)
            .unwrap();
        world.append_chat(entry(3));
        world.add_friend("agent-a", "agent-b", 4);
        world.wallets.insert(
            "agent-a".into(),
            Wallet {
                balance: 12.5,
                total_earned: 13.0,
                ..Default::default()
            },
        );
        world.record_position(
            "agent-a",
            LastPosition {
                x: 1.0,
                y: 2.0,
                z: 3.0,
                color: Some("#ff6b6b".into()),
                name: "Pincers".into(),
            },
            5,
        );
        world.save_to(&path).unwrap();

        let reloaded = WorldState::load(&path, 6);
        assert_eq!(reloaded.version, SCHEMA_VERSION);
        assert_eq!(reloaded.blocks, world.blocks);
        assert_eq!(reloaded.chat_history.len(), 1);
        assert_eq!(reloaded.friends_of("agent-a"), vec!["agent-b".to_string()]);
        assert_eq!(reloaded.wallets["agent-a"].balance, 12.5);
        assert_eq!(reloaded.lobster_positions["agent-a"].name, "Pincers");
    }

    #[test]
    fn test_load_merges_missing_fields_from_old_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world_state.json");
        // A document written before wallets/stats existed.
        std::fs::write(&path, r#"{"version":3,"blocks":{"0,0,0":"sand"}}"#).unwrap();

        let world = WorldState::load(&path, 1);
        assert_eq!(world.version, SCHEMA_VERSION);
        assert_eq!(world.blocks.len(), 1);
        assert!(world.wallets.is_empty());
        assert!(world.zones.iter().any(|z| z.is_spawn));
    }
}
