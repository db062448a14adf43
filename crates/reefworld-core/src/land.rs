//! Land lifecycle — claiming, the inactivity auction sweep, reclamation on
//! reconnect, and purchase. Ownership is only ever lost through a completed
//! sale.

use tracing::info;
use uuid::Uuid;

use crate::error::DomainError;
use crate::protocol::ZoneDraft;
use crate::types::{AuctionIsland, AuctionState, GridCell, Zone};
use crate::world::WorldState;

impl WorldState {
    /// Claim unowned space. The zone is created with the calling session's
    /// persistent id as owner; client-supplied ownership is ignored.
    pub fn claim_zone(
        &mut self,
        persistent_id: &str,
        owner_name: &str,
        draft: ZoneDraft,
        now: i64,
    ) -> Result<Zone, DomainError> {
        let grid = draft.grid_position.unwrap_or_else(|| {
            draft
                .center
                .map(|c| GridCell::containing(c.x, c.z))
                .unwrap_or_default()
        });
        if self.zones.iter().any(|z| z.grid_position == grid) {
            return Err(DomainError::ZoneTaken);
        }

        let id = draft
            .id
            .filter(|id| !id.is_empty() && self.zone(id).is_none())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let zone = Zone {
            id,
            name: draft.name,
            grid_position: grid,
            center: draft.center.unwrap_or_else(|| grid.center()),
            owner_id: Some(persistent_id.to_string()),
            owner_name: Some(owner_name.to_string()),
            created_at: now,
            is_spawn: false,
            is_protected: false,
            auction: AuctionState::None,
            auction_started_at: None,
            tags: draft.tags,
        };
        info!("Zone claimed: {} by {}", zone.name, owner_name);
        self.zones.push(zone.clone());
        self.last_update = now;
        Ok(zone)
    }

    /// Update a zone you own (name, tags, center). Grid position is fixed at
    /// claim time.
    pub fn update_zone(
        &mut self,
        persistent_id: &str,
        draft: ZoneDraft,
        now: i64,
    ) -> Result<Zone, DomainError> {
        let id = draft.id.ok_or(DomainError::ZoneNotFound)?;
        let zone = self.zone_mut(&id).ok_or(DomainError::ZoneNotFound)?;
        if zone.owner_id.as_deref() != Some(persistent_id) {
            return Err(DomainError::NotZoneOwner);
        }
        zone.name = draft.name;
        zone.tags = draft.tags;
        if let Some(center) = draft.center {
            zone.center = center;
        }
        let updated = zone.clone();
        self.last_update = now;
        Ok(updated)
    }

    /// Remove a zone you own. The spawn parcel cannot be deleted.
    pub fn delete_zone(
        &mut self,
        persistent_id: &str,
        zone_id: &str,
        now: i64,
    ) -> Result<Zone, DomainError> {
        let idx = self
            .zones
            .iter()
            .position(|z| z.id == zone_id)
            .ok_or(DomainError::ZoneNotFound)?;
        if self.zones[idx].is_spawn || self.zones[idx].is_protected {
            return Err(DomainError::NotZoneOwner);
        }
        if self.zones[idx].owner_id.as_deref() != Some(persistent_id) {
            return Err(DomainError::NotZoneOwner);
        }
        let removed = self.zones.remove(idx);
        self.last_update = now;
        Ok(removed)
    }

    /// Inactivity sweep: list every owned, unlisted, unprotected zone whose
    /// owner has been offline past the threshold. Returns the newly listed
    /// zones for broadcast.
    pub fn sweep_inactive_zones(&mut self, now: i64, inactive_ms: i64) -> Vec<Zone> {
        let mut listed = Vec::new();
        let last_online: std::collections::HashMap<String, i64> = self
            .agent_activity
            .iter()
            .map(|(id, a)| (id.clone(), a.last_online))
            .collect();

        for zone in &mut self.zones {
            if zone.is_spawn || zone.is_protected || zone.auction == AuctionState::Listed {
                continue;
            }
            let Some(owner) = zone.owner_id.as_deref() else {
                continue;
            };
            // No activity record means the owner has not been seen since the
            // zone was created.
            let last = last_online.get(owner).copied().unwrap_or(zone.created_at);
            if now - last > inactive_ms {
                info!("Zone entering auction: {} (owner: {})", zone.name, owner);
                zone.auction = AuctionState::Listed;
                zone.auction_started_at = Some(now);
                listed.push(zone.clone());
            }
        }
        if !listed.is_empty() {
            self.last_update = now;
        }
        listed
    }

    /// Revoke listings for an owner who reconnected before anyone bought the
    /// land. A completed sale is the only event that forfeits a parcel.
    pub fn restore_zones_for(&mut self, persistent_id: &str, now: i64) -> Vec<Zone> {
        let mut restored = Vec::new();
        for zone in &mut self.zones {
            if zone.owner_id.as_deref() == Some(persistent_id)
                && zone.auction == AuctionState::Listed
            {
                info!("Zone restored to returning owner: {}", zone.name);
                zone.auction = AuctionState::None;
                zone.auction_started_at = None;
                restored.push(zone.clone());
            }
        }
        if !restored.is_empty() {
            self.last_update = now;
        }
        restored
    }

    pub fn auction_islands(&self) -> Vec<AuctionIsland> {
        self.zones
            .iter()
            .filter(|z| z.auction == AuctionState::Listed)
            .map(AuctionIsland::from)
            .collect()
    }

    /// Purchase a listed zone. Balance is re-validated at debit time; the
    /// debit and the ownership transfer happen in one mutation, so a failed
    /// debit never transfers and a completed transfer never reverts. The
    /// zone stays in `Sold` until it is next listed.
    pub fn buy_zone(
        &mut self,
        buyer_id: &str,
        buyer_name: &str,
        zone_id: &str,
        price: f64,
        now: i64,
    ) -> Result<(Zone, f64), DomainError> {
        let idx = self
            .zones
            .iter()
            .position(|z| z.id == zone_id)
            .ok_or(DomainError::ZoneNotFound)?;
        if self.zones[idx].auction != AuctionState::Listed {
            return Err(DomainError::ZoneNotForSale);
        }
        let owns_other = self.zones.iter().any(|z| {
            z.owner_id.as_deref() == Some(buyer_id) && z.auction != AuctionState::Listed
        });
        if owns_other {
            return Err(DomainError::AlreadyOwnsZone);
        }

        let wallet = self.wallets.entry(buyer_id.to_string()).or_default();
        if wallet.balance < price {
            return Err(DomainError::InsufficientBalance {
                need: price,
                have: wallet.balance,
            });
        }
        wallet.balance -= price;
        wallet.total_spent += price;
        let balance = wallet.balance;

        let zone = &mut self.zones[idx];
        zone.owner_id = Some(buyer_id.to_string());
        zone.owner_name = Some(buyer_name.to_string());
        zone.auction = AuctionState::Sold;
        zone.auction_started_at = None;
        let sold = zone.clone();
        self.last_update = now;

        info!("Land purchased: {} by {} for {}", sold.name, buyer_name, price);
        Ok((sold, balance))
    }
}
