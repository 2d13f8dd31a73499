//! Port definitions (traits) for external dependencies
//!
//! These traits define the boundaries between the domain and external systems.
//! Adapters implement these traits to connect to real infrastructure.

use async_trait::async_trait;
use indexmap::IndexMap;
use thiserror::Error;
use time::OffsetDateTime;

use crate::feed::FeedEntry;
use crate::model::{LocalMedia, Media, PostRecord, ReplyAudience, SentRef, Service};

/// Error type for post source operations
#[derive(Debug, Error)]
pub enum PostSourceError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limited, retry at: {0:?}")]
    RateLimited(Option<OffsetDateTime>),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(String),
}

/// Port for reading the account's own feed from the input service
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Fetch the most recent feed entries, newest first or in any order
    async fn fetch_feed(&self) -> Result<Vec<FeedEntry>, PostSourceError>;

    /// The service this source reads from
    fn service(&self) -> Service;

    /// Account identifier used to recognize self-authored entries
    fn account(&self) -> &str;
}

/// Error type for publisher operations
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Rate limited until {resume_at:?}")]
    RateLimited { resume_at: Option<OffsetDateTime> },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Duplicate content: {0}")]
    Duplicate(String),
    #[error("Content too long: {len} > {max}")]
    ContentTooLong { len: usize, max: usize },
    #[error("Media error: {0}")]
    Media(String),
}

impl PublishError {
    /// Permanent rejection that must never be retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishError::Duplicate(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PublishError::RateLimited { .. })
    }
}

/// Destination visibility of a crossposted item
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
            Visibility::Direct => "direct",
        }
    }
}

/// One chunk to publish on a destination
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Source post id, for logging and outbox records
    pub source_id: String,
    pub text: String,
    pub reply_to: Option<SentRef>,
    pub quote_of: Option<SentRef>,
    pub media: Vec<LocalMedia>,
    pub visibility: Visibility,
    pub reply_audience: ReplyAudience,
    pub language: Option<String>,
}

/// Rate limit headroom reported by a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: OffsetDateTime,
}

impl RateLimitStatus {
    /// Remaining share of the window in percent
    pub fn remaining_percent(&self) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        self.remaining as f64 / self.limit as f64 * 100.0
    }
}

/// Result of a successful publish operation
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// Destination-native id
    pub native_id: String,
    /// Ancillary handle, e.g. an AT uri
    pub reference: Option<String>,
    pub rate_limit: Option<RateLimitStatus>,
}

impl PublishResult {
    pub fn sent_ref(&self) -> SentRef {
        SentRef {
            native_id: self.native_id.clone(),
            reference: self.reference.clone(),
        }
    }
}

/// Port for writing to one destination service
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one chunk
    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError>;

    /// Reshare a previously sent item
    async fn repost(&self, target: &SentRef) -> Result<(), PublishError>;

    /// Delete a previously sent item
    async fn delete(&self, target: &SentRef) -> Result<(), PublishError>;

    /// Restrict who may reply to a sent item. Destinations without the concept ignore it.
    async fn restrict_replies(
        &self,
        _target: &SentRef,
        _audience: ReplyAudience,
    ) -> Result<(), PublishError> {
        Ok(())
    }

    /// Whether the destination can embed a quoted post natively
    fn supports_quotes(&self) -> bool {
        true
    }

    /// Whether reposts should be mirrored on this destination
    fn supports_reposts(&self) -> bool {
        true
    }

    /// Public URL of a sent item, used when a quote has to become a link
    fn post_url(&self, target: &SentRef) -> Option<String>;

    /// The destination service
    fn service(&self) -> Service;
}

/// Error type for state store operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Port for the durable post ledger
#[async_trait]
pub trait LedgerRepo: Send + Sync {
    /// Load every record keyed by its id on `input`. Bad lines are skipped.
    async fn load(&self, input: Service) -> Result<IndexMap<String, PostRecord>, StateError>;

    /// Replace the persisted ledger with `records`
    async fn save(&self, records: &IndexMap<String, PostRecord>) -> Result<(), StateError>;

    /// Take the rolling daily backup if due
    async fn backup(&self, now: OffsetDateTime) -> Result<(), StateError>;
}

/// Port for the recent-activity cache
#[async_trait]
pub trait ActivityRepo: Send + Sync {
    /// Load entries newer than `since`
    async fn load(&self, since: OffsetDateTime) -> Result<Vec<(String, OffsetDateTime)>, StateError>;

    /// Persist `entries`; an empty slice removes the file
    async fn save(&self, entries: &[(String, OffsetDateTime)]) -> Result<(), StateError>;
}

/// Port for the cross-run rate-limit cooldown
#[async_trait]
pub trait RateLimitGate: Send + Sync {
    /// Resume time if a cooldown is still active at `now`. Expired cooldowns are cleared.
    async fn active_until(&self, now: OffsetDateTime) -> Result<Option<OffsetDateTime>, StateError>;

    /// Persist a cooldown ending at `resume_at`
    async fn pause_until(&self, resume_at: OffsetDateTime) -> Result<(), StateError>;
}

/// Error type for media operations
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Download failed for {url}: {message}")]
    Download { url: String, message: String },
    #[error("Unexpected content type {content_type} for {url}")]
    ContentType { url: String, content_type: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Port for materializing media attachments locally
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Download every item of `media` to scratch storage
    async fn download(&self, media: &Media) -> Result<Vec<LocalMedia>, MediaError>;

    /// Remove every downloaded file
    async fn cleanup(&self) -> Result<(), MediaError>;
}

/// Port for time/clock operations (enables deterministic testing)
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> OffsetDateTime;
}

/// Real clock implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
