//! Normalize use case - turns raw feed entries into crosspostable posts

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use time::OffsetDateTime;

use crate::feed::{Embed, Facet, FacetFeature, FeedEntry};
use crate::model::Post;
use crate::policy::MentionMode;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+"#).unwrap());

/// Every URL in `text`, in order of appearance, without trailing punctuation
pub fn find_urls(text: &str) -> Vec<String> {
    URL_RE
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', '\'', '"'])
                .to_string()
        })
        .filter(|url| !url.is_empty())
        .collect()
}

/// Configuration for the normalizer
#[derive(Debug, Clone, Default)]
pub struct NormalizeConfig {
    pub mentions: MentionMode,
    /// Crosspost quotes of other accounts' posts as links
    pub quote_posts: bool,
}

/// Normalized feed: crosspostable posts plus every self-authored id seen
#[derive(Debug, Clone, Default)]
pub struct NormalizedFeed {
    /// Oldest first
    pub posts: Vec<Post>,
    /// Self-authored ids present in the feed, including ones filtered out
    pub seen_ids: Vec<String>,
}

/// A post and a repost of it share one id. Keep a single post carrying the
/// own content, flagged as a repost at the later of the two times.
fn merge_same_id(existing: &mut Post, incoming: Post) {
    if existing.is_repost == incoming.is_repost {
        tracing::debug!(post_id = %incoming.id, "Duplicate feed entry, keeping the first");
        return;
    }
    let created_at = existing.created_at.max(incoming.created_at);
    if existing.is_repost {
        *existing = incoming;
    }
    existing.is_repost = true;
    existing.created_at = created_at;
}

pub struct Normalizer {
    config: NormalizeConfig,
}

impl Normalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        Self { config }
    }

    /// Filter and normalize `entries` for `account`, dropping everything at or
    /// before `time_limit`
    pub fn normalize(
        &self,
        entries: Vec<FeedEntry>,
        account: &str,
        time_limit: OffsetDateTime,
    ) -> NormalizedFeed {
        let mut feed = NormalizedFeed::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for entry in entries {
            if entry.author != account {
                tracing::debug!(post_id = %entry.id, author = %entry.author, "Skipping post by another account");
                continue;
            }
            if !feed.seen_ids.contains(&entry.id) {
                feed.seen_ids.push(entry.id.clone());
            }

            if entry.created_at <= time_limit {
                continue;
            }
            if let Some(parent) = &entry.reply_to {
                if parent.author.as_deref() != Some(account) {
                    tracing::info!(post_id = %entry.id, parent = %parent.id, "Skipping reply to another account");
                    continue;
                }
            }

            if let Some(post) = self.normalize_entry(entry) {
                match index.get(&post.id).copied() {
                    Some(i) => merge_same_id(&mut feed.posts[i], post),
                    None => {
                        index.insert(post.id.clone(), feed.posts.len());
                        feed.posts.push(post);
                    }
                }
            }
        }

        feed.posts.sort_by_key(|p| p.created_at);
        feed
    }

    fn normalize_entry(&self, entry: FeedEntry) -> Option<Post> {
        let Some(mut text) = self.apply_facets(&entry.id, &entry.text, &entry.facets) else {
            tracing::info!(post_id = %entry.id, "Post mentions a user, skipping");
            return None;
        };

        let mut quote = None;
        match &entry.embed {
            None => {}
            Some(Embed::Quote(quoted)) if quoted.author != entry.author => {
                if !self.config.quote_posts {
                    tracing::info!(post_id = %entry.id, quoted = %quoted.id, "Skipping quote of another account");
                    return None;
                }
                if !quoted.public {
                    tracing::info!(post_id = %entry.id, quoted = %quoted.id, "Skipping quote of non-public post");
                    return None;
                }
                quote = Some((quoted.id.clone(), quoted.url.clone()));
            }
            Some(Embed::Quote(quoted)) => {
                text = text.replace(&quoted.url, "").trim().to_string();
                quote = Some((quoted.id.clone(), quoted.url.clone()));
            }
            Some(Embed::External { uri }) => {
                if !text.contains(uri.as_str()) {
                    text = if text.is_empty() {
                        uri.clone()
                    } else {
                        format!("{}\n{}", text, uri)
                    };
                }
            }
            Some(Embed::Unsupported { kind }) => {
                tracing::error!(post_id = %entry.id, kind = %kind, "Unsupported embed, skipping post");
                return None;
            }
        }

        let mut post = Post::new(entry.id, text, entry.created_at);
        post.urls = find_urls(&post.text);
        post.reference = entry.reference;
        post.tags = entry.tags;
        post.reply_id = entry.reply_to.map(|r| r.id);
        if let Some((id, url)) = quote {
            post.quote_id = Some(id);
            post.quote_url = Some(url);
        }
        post.media = entry.media;
        post.language = entry.languages;
        post.privacy = entry.privacy;
        post.reply_audience = entry.reply_audience;
        post.is_repost = entry.is_repost;
        Some(post)
    }

    /// Rewrite facet spans in one pass. None means the post must be skipped.
    fn apply_facets(&self, id: &str, text: &str, facets: &[Facet]) -> Option<String> {
        let mut facets: Vec<&Facet> = facets.iter().collect();
        facets.sort_by_key(|f| f.byte_start);

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for facet in facets {
            if facet.byte_start < cursor {
                continue;
            }
            let Some(span) = text.get(facet.byte_start..facet.byte_end) else {
                tracing::warn!(post_id = %id, start = facet.byte_start, end = facet.byte_end, "Facet outside text");
                continue;
            };

            let replacement = match &facet.feature {
                FacetFeature::Link { uri } => uri.clone(),
                FacetFeature::Mention { profile_url } => match self.config.mentions {
                    MentionMode::Ignore => span.to_string(),
                    MentionMode::Skip => return None,
                    MentionMode::Strip => span.trim_start_matches('@').to_string(),
                    MentionMode::Url => profile_url.clone(),
                },
            };

            out.push_str(&text[cursor..facet.byte_start]);
            out.push_str(&replacement);
            cursor = facet.byte_end;
        }
        out.push_str(&text[cursor..]);
        Some(out)
    }
}
