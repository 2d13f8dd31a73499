//! Raw feed entries as delivered by a post source
//!
//! Source adapters translate their wire format into [`FeedEntry`]. Every
//! source-specific shape (quote embeds, link cards, byte-offset annotations)
//! is expressed here as a tagged variant so the normalizer never has to guess.

use time::OffsetDateTime;

use crate::model::{Media, Privacy, ReplyAudience};

/// One item of the account's own feed
#[derive(Debug, Clone)]
pub struct FeedEntry {
    /// Source-native id of the content (the original post for reposts)
    pub id: String,
    /// Source-side handle such as an AT uri
    pub reference: Option<String>,
    /// Author of the content
    pub author: String,
    pub text: String,
    /// Byte-range annotations over `text`
    pub facets: Vec<Facet>,
    pub tags: Vec<String>,
    pub reply_to: Option<ReplyTarget>,
    pub embed: Option<Embed>,
    pub media: Option<Media>,
    pub languages: Vec<String>,
    pub privacy: Privacy,
    pub reply_audience: ReplyAudience,
    /// The account reshared this entry
    pub is_repost: bool,
    /// Creation time, or the time of the reshare for reposts
    pub created_at: OffsetDateTime,
}

impl FeedEntry {
    /// Plain text entry by `author`
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        text: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            reference: None,
            author: author.into(),
            text: text.into(),
            facets: vec![],
            tags: vec![],
            reply_to: None,
            embed: None,
            media: None,
            languages: vec![],
            privacy: Privacy::Public,
            reply_audience: ReplyAudience::All,
            is_repost: false,
            created_at,
        }
    }
}

/// Parent of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub id: String,
    /// None when the source could not resolve the parent's author
    pub author: Option<String>,
}

/// Annotation over a byte range of the entry text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facet {
    pub byte_start: usize,
    pub byte_end: usize,
    pub feature: FacetFeature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacetFeature {
    /// Possibly shortened link text pointing at `uri`
    Link { uri: String },
    /// Mention of another account
    Mention { profile_url: String },
}

/// Embedded content attached to an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Embed {
    /// Quote of another post
    Quote(QuotedPost),
    /// Link card whose target may be missing from the text
    External { uri: String },
    /// Shape the crossposter does not understand (feeds, lists, ...)
    Unsupported { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedPost {
    pub id: String,
    pub author: String,
    /// Public URL of the quoted post on the source service
    pub url: String,
    /// Viewable without logging in
    pub public: bool,
}
