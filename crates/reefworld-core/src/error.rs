//! Domain error taxonomy. Every variant maps to a caller-visible refusal;
//! none of them ever closes a connection.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("World block limit reached")]
    BlockLimitReached,

    #[error("Island not found")]
    ZoneNotFound,

    #[error("Island is not for sale")]
    ZoneNotForSale,

    #[error("You already own an island. Abandon it first.")]
    AlreadyOwnsZone,

    #[error("Not enough coins. Need {need}, have {have}")]
    InsufficientBalance { need: f64, have: f64 },

    #[error("That spot is already claimed")]
    ZoneTaken,

    #[error("You do not own this island")]
    NotZoneOwner,

    #[error("Cannot like your own island")]
    OwnZoneLike,

    #[error("Already liked this island")]
    AlreadyLiked,

    #[error("You can only like {cap} island(s) per day. Try again tomorrow!")]
    DailyLikeCap { cap: u32 },

    #[error("Invalid channel name")]
    InvalidChannelName,

    #[error("Agent \"{0}\" not found or offline")]
    TargetOffline(String),
}
