//! Coin economy — earn events with daily caps, the weekly ranking
//! settlement, and leaderboard/stat queries.
//!
//! Every credit and debit goes through the wallet helpers so the
//! balance-never-negative invariant holds everywhere.

use chrono::TimeZone;
use tracing::info;

use crate::error::DomainError;
use crate::types::{
    AuctionState, IslandStats, LeaderboardCategory, LeaderboardRow, MyStats, Wallet,
};
use crate::world::WorldState;

// Ranking reward pools, distributed proportionally each week.
pub const RANKING_POOL_VISITS: f64 = 100.0;
pub const RANKING_POOL_LIKES: f64 = 100.0;
pub const RANKING_POOL_CONTRIBUTIONS: f64 = 100.0;

// Interaction rewards.
pub const VISIT_REWARD: f64 = 0.1;
pub const VISIT_DAILY_CAP: f64 = 1.0;
pub const LIKE_REWARD: f64 = 0.5;
pub const LIKES_PER_DAY: u32 = 1;

pub const LAND_PRICE: f64 = 400.0;

pub const WEEKLY_INTERVAL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// UTC day bucket for daily caps.
pub fn day_string(now_ms: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

impl Wallet {
    pub fn credit(&mut self, amount: f64) {
        self.balance += amount;
        self.total_earned += amount;
    }

    fn roll_visit_day(&mut self, today: &str) {
        if self.last_visit_day.as_deref() != Some(today) {
            self.last_visit_day = Some(today.to_string());
            self.today_visit_reward = 0.0;
            self.today_visited_zones.clear();
        }
    }

    fn roll_like_day(&mut self, today: &str) {
        if self.last_like_day.as_deref() != Some(today) {
            self.last_like_day = Some(today.to_string());
            self.today_like_count = 0;
        }
    }
}

/// A credited earn event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Earned {
    pub amount: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LikeSuccess {
    pub likes: u64,
    pub reward: f64,
    pub balance: f64,
}

impl WorldState {
    pub fn wallet_mut(&mut self, persistent_id: &str) -> &mut Wallet {
        self.wallets.entry(persistent_id.to_string()).or_default()
    }

    /// Record a visit. The visit counter always advances (own zones
    /// excepted); the reward is paid once per (agent, zone) per UTC day and
    /// only while today's visit earnings sit below the daily cap.
    pub fn record_visit(
        &mut self,
        persistent_id: &str,
        zone_id: &str,
        now: i64,
    ) -> Option<Earned> {
        if let Some(zone) = self.zone(zone_id) {
            if zone.owner_id.as_deref() == Some(persistent_id) {
                return None;
            }
        }
        self.island_stats
            .entry(zone_id.to_string())
            .or_default()
            .visits += 1;
        self.last_update = now;

        let today = day_string(now);
        let wallet = self.wallet_mut(persistent_id);
        wallet.roll_visit_day(&today);

        if wallet.today_visited_zones.iter().any(|z| z == zone_id) {
            return None;
        }
        wallet.today_visited_zones.push(zone_id.to_string());

        if wallet.today_visit_reward >= VISIT_DAILY_CAP {
            return None;
        }
        let amount = VISIT_REWARD.min(VISIT_DAILY_CAP - wallet.today_visit_reward);
        wallet.credit(amount);
        wallet.today_visit_reward += amount;
        Some(Earned {
            amount,
            balance: wallet.balance,
        })
    }

    /// Record a like. One like per (agent, zone) lifetime, and a daily like
    /// budget across all zones. Failed attempts leave the balance untouched.
    pub fn record_like(
        &mut self,
        persistent_id: &str,
        zone_id: &str,
        now: i64,
    ) -> Result<LikeSuccess, DomainError> {
        if let Some(zone) = self.zone(zone_id) {
            if zone.owner_id.as_deref() == Some(persistent_id) {
                return Err(DomainError::OwnZoneLike);
            }
        }
        let already = self
            .island_stats
            .get(zone_id)
            .map(|s| s.liked_by.contains(persistent_id))
            .unwrap_or(false);
        if already {
            return Err(DomainError::AlreadyLiked);
        }

        let today = day_string(now);
        {
            let wallet = self.wallet_mut(persistent_id);
            wallet.roll_like_day(&today);
            if wallet.today_like_count >= LIKES_PER_DAY {
                return Err(DomainError::DailyLikeCap { cap: LIKES_PER_DAY });
            }
        }

        let stats = self.island_stats.entry(zone_id.to_string()).or_default();
        stats.likes += 1;
        stats.liked_by.insert(persistent_id.to_string());
        let likes = stats.likes;

        let wallet = self.wallet_mut(persistent_id);
        wallet.today_like_count += 1;
        wallet.credit(LIKE_REWARD);
        let balance = wallet.balance;
        self.last_update = now;

        Ok(LikeSuccess {
            likes,
            reward: LIKE_REWARD,
            balance,
        })
    }

    /// Count a build contribution toward the weekly ranking.
    pub fn track_contribution(&mut self, persistent_id: &str, name: &str, amount: u64) {
        let stats = self
            .agent_stats
            .entry(persistent_id.to_string())
            .or_default();
        stats.contributions += amount;
        stats.name = name.to_string();
    }

    /// Weekly settlement. Checked against the stored timestamp on every
    /// sweep tick, so a missed wakeup settles late instead of skipping a
    /// period. Distributes the three pools proportionally, then resets the
    /// period counters; balances and all-time totals are untouched.
    /// Returns whether a settlement ran.
    pub fn settle_weekly_rewards(&mut self, now: i64) -> bool {
        if self.last_weekly_reward != 0 && now - self.last_weekly_reward < WEEKLY_INTERVAL_MS {
            return false;
        }
        info!("Distributing weekly ranking rewards");

        let total_visits: u64 = self.island_stats.values().map(|s| s.visits).sum();
        let total_likes: u64 = self.island_stats.values().map(|s| s.likes).sum();
        let total_contributions: u64 = self.agent_stats.values().map(|s| s.contributions).sum();

        let mut credits: Vec<(String, f64)> = Vec::new();
        for zone in &self.zones {
            if zone.is_spawn || zone.auction == AuctionState::Listed {
                continue;
            }
            let Some(owner) = zone.owner_id.as_deref() else {
                continue;
            };
            let Some(stats) = self.island_stats.get(&zone.id) else {
                continue;
            };
            if total_visits > 0 && stats.visits > 0 {
                let share = RANKING_POOL_VISITS * (stats.visits as f64 / total_visits as f64);
                credits.push((owner.to_string(), share));
            }
            if total_likes > 0 && stats.likes > 0 {
                let share = RANKING_POOL_LIKES * (stats.likes as f64 / total_likes as f64);
                credits.push((owner.to_string(), share));
            }
        }
        if total_contributions > 0 {
            for (agent_id, stats) in &self.agent_stats {
                if stats.contributions > 0 {
                    let share = RANKING_POOL_CONTRIBUTIONS
                        * (stats.contributions as f64 / total_contributions as f64);
                    credits.push((agent_id.clone(), share));
                }
            }
        }
        for (agent_id, amount) in credits {
            self.wallets.entry(agent_id).or_default().credit(amount);
        }

        // New period: counters restart, lifetime liked-by sets survive.
        for stats in self.island_stats.values_mut() {
            stats.visits = 0;
            stats.likes = 0;
        }
        for stats in self.agent_stats.values_mut() {
            stats.contributions = 0;
        }

        self.last_weekly_reward = now;
        self.last_update = now;
        true
    }

    pub fn leaderboard(&self, category: LeaderboardCategory) -> Vec<LeaderboardRow> {
        let mut rows: Vec<LeaderboardRow> = match category {
            LeaderboardCategory::Visits => self.zone_rows(|s| s.visits),
            LeaderboardCategory::Likes => self.zone_rows(|s| s.likes),
            LeaderboardCategory::Contributors => self
                .agent_stats
                .iter()
                .map(|(id, stats)| LeaderboardRow {
                    id: id.clone(),
                    name: if stats.name.is_empty() {
                        id.clone()
                    } else {
                        stats.name.clone()
                    },
                    owner: String::new(),
                    value: stats.contributions,
                })
                .collect(),
        };
        rows.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.id.cmp(&b.id)));
        rows.truncate(10);
        rows
    }

    fn zone_rows(&self, value: impl Fn(&IslandStats) -> u64) -> Vec<LeaderboardRow> {
        self.zones
            .iter()
            .filter(|z| !z.is_spawn && z.auction != AuctionState::Listed)
            .map(|zone| LeaderboardRow {
                id: zone.id.clone(),
                name: zone.name.clone(),
                owner: zone.owner_name.clone().unwrap_or_default(),
                value: self.island_stats.get(&zone.id).map(&value).unwrap_or(0),
            })
            .collect()
    }

    pub fn my_stats(&self, persistent_id: &str) -> MyStats {
        let islands = self.zones_owned_by(persistent_id).count();
        let likes = self
            .zones_owned_by(persistent_id)
            .filter_map(|z| self.island_stats.get(&z.id))
            .map(|s| s.likes)
            .sum();
        MyStats {
            islands,
            blocks: self
                .agent_stats
                .get(persistent_id)
                .map(|s| s.contributions)
                .unwrap_or(0),
            coins: self
                .wallets
                .get(persistent_id)
                .map(|w| w.balance)
                .unwrap_or(0.0),
            likes,
            friends: self
                .friendships
                .get(persistent_id)
                .map(|f| f.len())
                .unwrap_or(0),
            online_time: self
                .agent_activity
                .get(persistent_id)
                .map(|a| a.total_online_ms)
                .unwrap_or(0),
        }
    }
}
