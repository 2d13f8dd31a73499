//! Mastodon source: the account's own statuses

use async_trait::async_trait;
use crossposter_domain::{
    Facet, FacetFeature, FeedEntry, Media, MediaItem, MediaKind, PostSource, PostSourceError,
    Privacy, ReplyTarget, Service,
};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;

use super::{MastodonClient, RATE_LIMIT_HEADERS, html_to_text};
use crate::http;

const PAGE_SIZE: u32 = 40;

pub struct MastodonPostSource {
    client: Arc<MastodonClient>,
    /// Account id, resolved on the first fetch
    account_id: String,
}

impl MastodonPostSource {
    /// Source for the authenticated account. Resolves the account id up front.
    pub async fn connect(client: Arc<MastodonClient>) -> Result<Self, PostSourceError> {
        let account_id = client.account().await?.id.clone();
        Ok(Self { client, account_id })
    }
}

#[derive(Debug, Deserialize)]
struct Status {
    id: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(default)]
    content: String,
    #[serde(default)]
    visibility: String,
    language: Option<String>,
    in_reply_to_id: Option<String>,
    in_reply_to_account_id: Option<String>,
    reblog: Option<Box<Status>>,
    account: StatusAccount,
    #[serde(default)]
    mentions: Vec<Mention>,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    media_attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct StatusAccount {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Mention {
    username: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    description: Option<String>,
}

fn privacy(visibility: &str) -> Privacy {
    match visibility {
        "public" => Privacy::Public,
        "unlisted" => Privacy::Unlisted,
        "private" => Privacy::Followers,
        "direct" => Privacy::Mentioned,
        other => {
            tracing::error!(visibility = other, "Unknown visibility, treating as public");
            Privacy::Public
        }
    }
}

/// Byte ranges of every `@username` that is not the prefix of a longer name
fn mention_facets(text: &str, mentions: &[Mention]) -> Vec<Facet> {
    let mut facets = vec![];
    for mention in mentions {
        let needle = format!("@{}", mention.username);
        for (start, _) in text.match_indices(&needle) {
            let end = start + needle.len();
            let continues = text[end..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '@');
            if continues {
                continue;
            }
            facets.push(Facet {
                byte_start: start,
                byte_end: end,
                feature: FacetFeature::Mention {
                    profile_url: mention.url.clone(),
                },
            });
        }
    }
    facets
}

fn media(attachments: &[Attachment]) -> Option<Media> {
    let first = attachments.first()?;
    let kind = match first.kind.as_str() {
        "video" | "gifv" => MediaKind::Video,
        _ => MediaKind::Image,
    };
    Some(Media {
        kind,
        items: attachments
            .iter()
            .map(|a| MediaItem {
                url: a.url.clone(),
                alt: a.description.clone().unwrap_or_default(),
            })
            .collect(),
    })
}

impl Status {
    fn into_entry(self) -> FeedEntry {
        let reshared_at = self.created_at;
        let (status, is_repost) = match self.reblog {
            Some(original) => (*original, true),
            None => (self, false),
        };

        let text = html_to_text(&status.content);
        let mut entry = FeedEntry::new(
            status.id,
            status.account.id,
            text,
            if is_repost { reshared_at } else { status.created_at },
        );
        entry.facets = mention_facets(&entry.text, &status.mentions);
        entry.tags = status.tags.into_iter().map(|t| t.name).collect();
        entry.reply_to = status.in_reply_to_id.map(|id| ReplyTarget {
            id,
            author: status.in_reply_to_account_id,
        });
        entry.media = media(&status.media_attachments);
        entry.languages = status.language.into_iter().collect();
        entry.privacy = privacy(&status.visibility);
        entry.is_repost = is_repost;
        entry
    }
}

#[async_trait]
impl PostSource for MastodonPostSource {
    async fn fetch_feed(&self) -> Result<Vec<FeedEntry>, PostSourceError> {
        tracing::info!(account_id = %self.account_id, "Gathering posts from Mastodon");
        let response = self
            .client
            .get(&format!("/api/v1/accounts/{}/statuses", self.account_id))
            .query(&[("limit", PAGE_SIZE)])
            .send()
            .await
            .map_err(|e| PostSourceError::Network(e.to_string()))?;
        let response = http::check(response, RATE_LIMIT_HEADERS).await?;
        let statuses: Vec<Status> = response
            .json()
            .await
            .map_err(|e| PostSourceError::Api(e.to_string()))?;

        tracing::debug!(count = statuses.len(), "Fetched statuses");
        Ok(statuses.into_iter().map(Status::into_entry).collect())
    }

    fn service(&self) -> Service {
        Service::Mastodon
    }

    fn account(&self) -> &str {
        &self.account_id
    }
}
