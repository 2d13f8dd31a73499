//! Domain models and value objects

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// A social network the crossposter can read from or write to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Bluesky,
    Mastodon,
    Twitter,
}

impl Service {
    /// Every service known to the ledger, in file order
    pub const ALL: [Service; 3] = [Service::Bluesky, Service::Mastodon, Service::Twitter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Bluesky => "bluesky",
            Service::Mastodon => "mastodon",
            Service::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bluesky" => Ok(Service::Bluesky),
            "mastodon" => Ok(Service::Mastodon),
            "twitter" | "x" => Ok(Service::Twitter),
            other => Err(UnknownService(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown service: {0}")]
pub struct UnknownService(pub String);

/// Audience of a source post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    #[default]
    Public,
    Unlisted,
    Followers,
    Following,
    Mentioned,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Unlisted => "unlisted",
            Privacy::Followers => "followers",
            Privacy::Following => "following",
            Privacy::Mentioned => "mentioned",
        }
    }
}

/// Who may reply to a post (threadgate on Bluesky, reply_settings on Twitter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplyAudience {
    #[default]
    All,
    Nobody,
    Following,
    Mentioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// A remote media attachment as captured from the source feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
    #[serde(default)]
    pub alt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub items: Vec<MediaItem>,
}

/// A media attachment downloaded to scratch storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub path: std::path::PathBuf,
    pub alt: String,
    pub kind: MediaKind,
    pub mime_type: Option<String>,
}

/// One item from the source feed, normalized
#[derive(Debug, Clone)]
pub struct Post {
    /// Source-native identifier
    pub id: String,
    /// Source-side handle stored next to the id (the AT uri on Bluesky)
    pub reference: Option<String>,
    pub text: String,
    /// URLs in order of appearance, restored to full form
    pub urls: Vec<String>,
    pub tags: Vec<String>,
    pub reply_id: Option<String>,
    pub quote_id: Option<String>,
    /// Public URL of the quoted post on the source service
    pub quote_url: Option<String>,
    pub media: Option<Media>,
    pub language: Vec<String>,
    pub privacy: Privacy,
    pub reply_audience: ReplyAudience,
    pub is_repost: bool,
    /// Creation time, or the repost time for reposts
    pub created_at: OffsetDateTime,
    /// Filled lazily right before the first transmission
    pub local_media: Vec<LocalMedia>,
}

impl Post {
    /// Build a plain public post with no attachments
    pub fn new(id: impl Into<String>, text: impl Into<String>, created_at: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            reference: None,
            text: text.into(),
            urls: vec![],
            tags: vec![],
            reply_id: None,
            quote_id: None,
            quote_url: None,
            media: None,
            language: vec![],
            privacy: Privacy::Public,
            reply_audience: ReplyAudience::All,
            is_repost: false,
            created_at,
            local_media: vec![],
        }
    }

    pub fn main_language(&self) -> Option<&str> {
        self.language.first().map(String::as_str)
    }

    pub fn has_media(&self) -> bool {
        self.media.as_ref().is_some_and(|m| !m.items.is_empty())
    }
}

/// Per-service posting status of one source post
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServiceStatus {
    /// Never attempted on this service
    #[default]
    NotAttempted,
    /// Excluded by policy
    Skipped,
    /// Sent; `reference` holds a service-specific handle such as an AT uri
    Sent {
        native_id: String,
        reference: Option<String>,
    },
    /// Attempted and failed `attempts` times, still below the retry ceiling
    Failed { attempts: u32 },
    /// Retry ceiling reached
    FailedTerminal { attempts: u32 },
    /// Rejected by the destination as duplicate content
    Duplicate,
}

impl ServiceStatus {
    pub const SKIPPED: &'static str = "skipped";
    pub const FAILED_TERMINAL: &'static str = "FailedToPost";
    pub const DUPLICATE: &'static str = "duplicate";

    /// The status occupies the slot with a real id or a sentinel
    pub fn is_filled(&self) -> bool {
        !matches!(
            self,
            ServiceStatus::NotAttempted | ServiceStatus::Failed { .. }
        )
    }

    /// Skipped, failed for good, or rejected as duplicate
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Skipped | ServiceStatus::FailedTerminal { .. } | ServiceStatus::Duplicate
        )
    }

    pub fn sent_ref(&self) -> Option<SentRef> {
        match self {
            ServiceStatus::Sent {
                native_id,
                reference,
            } => Some(SentRef {
                native_id: native_id.clone(),
                reference: reference.clone(),
            }),
            _ => None,
        }
    }

    pub fn failures(&self) -> u32 {
        match self {
            ServiceStatus::Failed { attempts } | ServiceStatus::FailedTerminal { attempts } => {
                *attempts
            }
            _ => 0,
        }
    }

    /// String stored in the ledger file's `id` field
    pub fn ledger_id(&self) -> &str {
        match self {
            ServiceStatus::NotAttempted | ServiceStatus::Failed { .. } => "",
            ServiceStatus::Skipped => Self::SKIPPED,
            ServiceStatus::Sent { native_id, .. } => native_id,
            ServiceStatus::FailedTerminal { .. } => Self::FAILED_TERMINAL,
            ServiceStatus::Duplicate => Self::DUPLICATE,
        }
    }

    /// Rebuild a status from the ledger file's `id`, `failure` and `uri` fields
    pub fn from_ledger(id: &str, failures: u32, reference: Option<String>) -> Self {
        match id {
            "" if failures == 0 => ServiceStatus::NotAttempted,
            "" => ServiceStatus::Failed { attempts: failures },
            Self::SKIPPED => ServiceStatus::Skipped,
            Self::FAILED_TERMINAL => ServiceStatus::FailedTerminal { attempts: failures },
            Self::DUPLICATE => ServiceStatus::Duplicate,
            native_id => ServiceStatus::Sent {
                native_id: native_id.to_string(),
                reference: reference.filter(|r| !r.is_empty()),
            },
        }
    }
}

/// Destination-native handle of a sent post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRef {
    pub native_id: String,
    pub reference: Option<String>,
}

/// Ledger entry: per-service posting state of one source post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub origin: Service,
    pub services: std::collections::BTreeMap<Service, ServiceStatus>,
}

impl PostRecord {
    /// Record for a post first seen on `origin`
    pub fn new(origin: Service, source_id: &str, reference: Option<String>, outputs: &[Service]) -> Self {
        let services = Service::ALL
            .iter()
            .map(|&service| {
                let status = if service == origin {
                    ServiceStatus::Sent {
                        native_id: source_id.to_string(),
                        reference: reference.clone(),
                    }
                } else if outputs.contains(&service) {
                    ServiceStatus::NotAttempted
                } else {
                    ServiceStatus::Skipped
                };
                (service, status)
            })
            .collect();

        Self { origin, services }
    }

    pub fn status(&self, service: Service) -> &ServiceStatus {
        const NOT_ATTEMPTED: &ServiceStatus = &ServiceStatus::NotAttempted;
        self.services.get(&service).unwrap_or(NOT_ATTEMPTED)
    }

    pub fn status_mut(&mut self, service: Service) -> &mut ServiceStatus {
        self.services.entry(service).or_default()
    }

    pub fn sent_ref(&self, service: Service) -> Option<SentRef> {
        self.status(service).sent_ref()
    }
}

/// What to do with a post on one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Post,
    Reply,
    Quote,
    Repost,
}

/// One entry of a per-destination send queue
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub kind: ItemKind,
    pub post: Post,
}

/// Outcome of one queue item on one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { native_id: String },
    Reposted,
    /// Parent or quoted post not available on the destination yet
    Deferred { reason: String },
    Failed { error: String },
    Duplicate,
    /// Destination paused for the rest of the run
    Paused,
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fetched: usize,
    pub queued: usize,
    pub sent: usize,
    pub reposted: usize,
    pub deferred: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub deleted: usize,
    pub paused: bool,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent { .. } => self.sent += 1,
            SendOutcome::Reposted => self.reposted += 1,
            SendOutcome::Deferred { .. } => self.deferred += 1,
            SendOutcome::Failed { .. } => self.failed += 1,
            SendOutcome::Duplicate => self.duplicates += 1,
            SendOutcome::Paused => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ledger_round_trip_of_sentinels() {
        for status in [
            ServiceStatus::NotAttempted,
            ServiceStatus::Skipped,
            ServiceStatus::Duplicate,
            ServiceStatus::FailedTerminal { attempts: 5 },
            ServiceStatus::Failed { attempts: 2 },
        ] {
            let restored = ServiceStatus::from_ledger(status.ledger_id(), status.failures(), None);
            assert_eq!(restored, status);
        }
    }

    #[test]
    fn test_sent_status_keeps_reference() {
        let status = ServiceStatus::from_ledger("cid123", 0, Some("at://did/post/1".to_string()));
        assert_eq!(
            status.sent_ref(),
            Some(SentRef {
                native_id: "cid123".to_string(),
                reference: Some("at://did/post/1".to_string()),
            })
        );
        assert!(status.is_filled());
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_new_record_skips_disabled_outputs() {
        let record = PostRecord::new(Service::Mastodon, "42", None, &[Service::Bluesky]);

        assert_eq!(record.origin, Service::Mastodon);
        assert_eq!(record.sent_ref(Service::Mastodon).unwrap().native_id, "42");
        assert_eq!(record.status(Service::Bluesky), &ServiceStatus::NotAttempted);
        assert_eq!(record.status(Service::Twitter), &ServiceStatus::Skipped);
    }

    #[test]
    fn test_service_parses_case_insensitively() {
        assert_eq!("Mastodon".parse::<Service>().unwrap(), Service::Mastodon);
        assert_eq!("x".parse::<Service>().unwrap(), Service::Twitter);
        assert!("myspace".parse::<Service>().is_err());
    }
}
