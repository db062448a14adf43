//! Core types — blocks, zones, lobsters, wallets, stats, sessions' view of the grid.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Spatial ──

/// World units per island grid cell.
pub const ISLAND_SIZE: f64 = 64.0;

/// Chebyshev radius (in cells) within which build/move events are fanned out.
pub const NEARBY_RANGE: i64 = 1;

/// An integer block coordinate. Serialized as the `"x,y,z"` string the world
/// document uses as its sparse-map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPos {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl BlockPos {
    /// Snap a world-space position to its containing block.
    pub fn from_world(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: x.floor() as i64,
            y: y.floor() as i64,
            z: z.floor() as i64,
        }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl FromStr for BlockPos {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(|p| p.trim().parse::<i64>());
        let mut next = |axis: &str| {
            parts
                .next()
                .ok_or_else(|| format!("missing {} in block key '{}'", axis, s))?
                .map_err(|e| format!("bad {} in block key '{}': {}", axis, s, e))
        };
        let pos = Self {
            x: next("x")?,
            y: next("y")?,
            z: next("z")?,
        };
        Ok(pos)
    }
}

impl Serialize for BlockPos {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockPos {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An island grid cell. The world is partitioned on the horizontal plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub x: i64,
    pub z: i64,
}

impl GridCell {
    pub fn containing(x: f64, z: f64) -> Self {
        Self {
            x: (x / ISLAND_SIZE).floor() as i64,
            z: (z / ISLAND_SIZE).floor() as i64,
        }
    }

    /// Adjacent-including-diagonals test (Chebyshev distance).
    pub fn is_near(&self, other: &GridCell) -> bool {
        (self.x - other.x).abs() <= NEARBY_RANGE && (self.z - other.z).abs() <= NEARBY_RANGE
    }

    /// Center of this cell in world units.
    pub fn center(&self) -> Position3 {
        Position3 {
            x: (self.x as f64 + 0.5) * ISLAND_SIZE,
            y: 0.0,
            z: (self.z as f64 + 0.5) * ISLAND_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

// ── Roles ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Observer,
}

// ── Zones (islands) ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionState {
    #[default]
    None,
    Listed,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub grid_position: GridCell,
    pub center: Position3,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub is_spawn: bool,
    #[serde(default)]
    pub is_protected: bool,
    #[serde(default)]
    pub auction: AuctionState,
    #[serde(default)]
    pub auction_started_at: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The auction-facing projection of a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionIsland {
    pub id: String,
    pub name: String,
    pub grid_position: GridCell,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auction_started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl From<&Zone> for AuctionIsland {
    fn from(zone: &Zone) -> Self {
        Self {
            id: zone.id.clone(),
            name: zone.name.clone(),
            grid_position: zone.grid_position,
            owner_id: zone.owner_id.clone(),
            auction_started_at: zone.auction_started_at,
            tags: zone.tags.clone(),
        }
    }
}

// ── Lobsters (entity positions) ──

/// A live lobster entity, keyed by the connection that controls it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lobster {
    pub id: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub color: Option<String>,
}

/// Last known position of an agent, durable across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub color: Option<String>,
    pub name: String,
}

// ── Chat ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub channel: String,
    pub from_id: String,
    pub from_name: String,
    pub text: String,
    pub timestamp: i64,
}

// ── Scripts (action payload log) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptEntry {
    pub agent_id: String,
    pub agent_name: String,
    pub verified: bool,
    pub code: String,
    pub timestamp: i64,
}

// ── Economy ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub balance: f64,
    #[serde(default)]
    pub total_earned: f64,
    #[serde(default)]
    pub total_spent: f64,
    #[serde(default)]
    pub last_visit_day: Option<String>,
    #[serde(default)]
    pub today_visit_reward: f64,
    #[serde(default)]
    pub today_visited_zones: Vec<String>,
    #[serde(default)]
    pub last_like_day: Option<String>,
    #[serde(default)]
    pub today_like_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IslandStats {
    #[serde(default)]
    pub visits: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub liked_by: HashSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub contributions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub first_seen: i64,
    pub last_online: i64,
    #[serde(default)]
    pub total_online_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardCategory {
    Visits,
    Likes,
    Contributors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub value: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MyStats {
    pub islands: usize,
    pub blocks: u64,
    pub coins: f64,
    pub likes: u64,
    pub friends: usize,
    pub online_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_pos_round_trip() {
        let pos = BlockPos { x: -3, y: 12, z: 0 };
        let key = pos.to_string();
        assert_eq!(key, "-3,12,0");
        assert_eq!(key.parse::<BlockPos>().unwrap(), pos);
    }

    #[test]
    fn test_block_pos_from_world_floors() {
        assert_eq!(
            BlockPos::from_world(1.9, -0.1, 63.999),
            BlockPos { x: 1, y: -1, z: 63 }
        );
    }

    #[test]
    fn test_block_pos_rejects_garbage() {
        assert!("1,2".parse::<BlockPos>().is_err());
        assert!("a,b,c".parse::<BlockPos>().is_err());
    }

    #[test]
    fn test_grid_cell_containing() {
        assert_eq!(GridCell::containing(0.0, 0.0), GridCell { x: 0, z: 0 });
        assert_eq!(GridCell::containing(63.9, 64.0), GridCell { x: 0, z: 1 });
        assert_eq!(GridCell::containing(-0.1, -64.1), GridCell { x: -1, z: -2 });
    }

    #[test]
    fn test_grid_cell_near_includes_diagonals() {
        let origin = GridCell { x: 0, z: 0 };
        assert!(origin.is_near(&GridCell { x: 1, z: 1 }));
        assert!(origin.is_near(&GridCell { x: -1, z: 1 }));
        assert!(!origin.is_near(&GridCell { x: 2, z: 0 }));
    }

    #[test]
    fn test_blocks_map_serializes_with_string_keys() {
        let mut blocks = std::collections::HashMap::new();
        blocks.insert(BlockPos { x: 1, y: 2, z: 3 }, "coral".to_string());
        let json = serde_json::to_value(&blocks).unwrap();
        assert_eq!(json["1,2,3"], "coral");
    }
}
