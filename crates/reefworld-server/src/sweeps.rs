//! Background sweeps — the hourly auction check and the weekly settlement.
//! Both take the same state lock as message handling, so they interleave
//! only at message-boundary granularity. The settlement is keyed off the
//! stored timestamp, so a tick that fires late still settles rather than
//! skipping a period.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use reefworld_core::protocol::{ServerMessage, ZoneAction};
use reefworld_core::types::AuctionIsland;

use crate::server::session::{deliver, Target};
use crate::server::{now_ms, AppState};

/// Delay before the first pass so the listener comes up first.
const FIRST_SWEEP_DELAY: Duration = Duration::from_secs(5);

pub fn spawn(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(FIRST_SWEEP_DELAY).await;
        let mut ticks =
            tokio::time::interval(Duration::from_secs(state.config.sweep_interval_secs));
        loop {
            ticks.tick().await;
            run_once(&state).await;
        }
    })
}

/// One sweep pass: list zones whose owners went inactive, then settle the
/// weekly pools if a period has elapsed.
pub async fn run_once(state: &AppState) {
    let now = now_ms();
    let mut shared = state.shared.lock().await;

    info!("Sweep: checking {} zones", shared.world.zones.len());
    let listed = shared
        .world
        .sweep_inactive_zones(now, state.config.auction_inactive_ms());

    let mut messages = Vec::new();
    for zone in listed {
        messages.push((
            Target::All,
            ServerMessage::IslandAuction {
                island: AuctionIsland::from(&zone),
            },
        ));
        messages.push((
            Target::All,
            ServerMessage::ZoneSync {
                action: ZoneAction::Update,
                zone,
            },
        ));
    }

    if shared.world.settle_weekly_rewards(now) {
        messages.push((
            Target::All,
            ServerMessage::WeeklyRewardsDistributed { timestamp: now },
        ));
    }

    let dirty = !messages.is_empty();
    deliver(&shared, messages);
    drop(shared);
    if dirty {
        state.saver.mark_dirty();
    }
}
