//! crossposter adapters crate
//!
//! This crate contains infrastructure adapters implementing the domain ports:
//! - `state`: filesystem ledger, activity cache and rate-limit gate
//! - `media`: scratch-directory media store
//! - `outbox`: JSONL publisher used by dry runs
//! - `mastodon`, `bluesky`, `twitter`: HTTP adapters per service

mod activity_fs;
mod http;
mod ledger_fs;
mod media_fs;
mod rate_limit_fs;

pub mod bluesky;
pub mod mastodon;
pub mod outbox;
pub mod twitter;

/// Re-exports for state adapters
pub mod state {
    pub use crate::activity_fs::FsActivityRepo;
    pub use crate::ledger_fs::FsLedgerRepo;
    pub use crate::rate_limit_fs::FsRateLimitGate;
}

/// Re-exports for media adapters
pub mod media {
    pub use crate::media_fs::FsMediaStore;
}
