//! Dispatch use case - decides what each destination receives this run

use std::collections::{BTreeMap, HashSet};

use time::{Duration, OffsetDateTime};

use crate::ledger::{ACTIVITY_WINDOW, Ledger};
use crate::model::{ItemKind, Post, QueueItem, Service};
use crate::policy::Policy;
use crate::ports::MediaStore;

/// Per-destination send queues, each oldest first
pub type Queues = BTreeMap<Service, Vec<QueueItem>>;

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Cap on posts sent per sliding hour, 0 for unlimited
    pub max_per_hour: usize,
    /// Fall back to linking quoted posts that were never crossposted
    pub quote_posts: bool,
    /// Reposts older than this (or than the last recorded one) are not mirrored
    pub repost_window: Duration,
    /// Destinations that mirror reposts
    pub mirror_reposts: HashSet<Service>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_per_hour: 0,
            quote_posts: true,
            repost_window: ACTIVITY_WINDOW,
            mirror_reposts: Service::ALL.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Post,
    Repost,
}

pub struct Dispatcher<'a> {
    policy: &'a Policy,
    config: DispatchConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(policy: &'a Policy, config: DispatchConfig) -> Self {
        Self { policy, config }
    }

    /// Build the send queues for `posts` (oldest first). Registers every post
    /// in the ledger and downloads media for posts about to be sent for the first time.
    pub async fn build_queues<M>(
        &self,
        posts: Vec<Post>,
        ledger: &mut Ledger,
        media: &M,
        now: OffsetDateTime,
    ) -> Queues
    where
        M: MediaStore + ?Sized,
    {
        let mut queues = Queues::new();
        let mut queued_posts = 0;
        let mut handled: HashSet<String> = HashSet::new();
        let outputs = ledger.outputs().to_vec();

        for mut post in posts {
            if self.config.max_per_hour != 0
                && ledger.activity_len() + queued_posts >= self.config.max_per_hour
            {
                tracing::info!(max_per_hour = self.config.max_per_hour, "Max posts per hour reached");
                break;
            }
            if !handled.insert(post.id.clone()) {
                tracing::debug!(post_id = %post.id, "Already handled in this run");
                continue;
            }

            ledger.observe(&post.id, post.reference.as_deref());

            let mut targets = Vec::new();
            for &service in &outputs {
                if !self.policy.post_toggle(&post, service) {
                    ledger.mark_skipped(&post.id, service);
                    continue;
                }
                if !ledger.is_posted(&post.id, &[service]) {
                    tracing::info!(post_id = %post.id, service = %service, "Post has not been sent");
                    targets.push((service, Target::Post));
                } else if post.is_repost
                    && !ledger.all_terminal(&post.id, &[service])
                    && self.config.mirror_reposts.contains(&service)
                {
                    tracing::debug!(post_id = %post.id, service = %service, "Already sent, adding as repost");
                    targets.push((service, Target::Repost));
                }
            }
            if targets.is_empty() {
                tracing::debug!(post_id = %post.id, "Nothing to send");
                continue;
            }

            let mut kind = ItemKind::Post;
            if let Some(parent) = &post.reply_id {
                if !ledger.contains(parent) {
                    tracing::info!(post_id = %post.id, parent = %parent, "Reply to a post that is not in the ledger");
                    continue;
                }
                kind = ItemKind::Reply;
            }
            if let Some(quoted) = post.quote_id.clone() {
                if ledger.contains(&quoted) {
                    if kind == ItemKind::Post {
                        kind = ItemKind::Quote;
                    }
                } else if self.config.quote_posts {
                    link_quote(&mut post);
                } else {
                    tracing::info!(post_id = %post.id, quoted = %quoted, "Quote of a post that is not in the ledger");
                    continue;
                }
            }

            if post.has_media() && targets.iter().any(|(_, t)| *t == Target::Post) {
                if let Some(attachments) = &post.media {
                    match media.download(attachments).await {
                        Ok(local) => post.local_media = local,
                        Err(e) => {
                            tracing::error!(post_id = %post.id, error = %e, "Media download failed");
                            continue;
                        }
                    }
                }
            }

            let repost_limit = ledger
                .last_activity(&post.id)
                .unwrap_or(now - self.config.repost_window);

            let mut queued = false;
            for (service, target) in targets {
                let item_kind = match target {
                    Target::Post => kind,
                    Target::Repost if post.created_at > repost_limit => ItemKind::Repost,
                    Target::Repost => continue,
                };
                queues.entry(service).or_default().push(QueueItem {
                    id: post.id.clone(),
                    kind: item_kind,
                    post: post.clone(),
                });
                queued = true;
            }
            if queued {
                queued_posts += 1;
            }
        }

        queues
    }
}

/// Replace an unresolvable quote with a link to the quoted post
fn link_quote(post: &mut Post) {
    if let Some(url) = post.quote_url.clone() {
        if !post.text.contains(url.as_str()) {
            post.text = format!("{}\n{}", post.text, url);
            post.urls.push(url);
        }
    }
    post.quote_id = None;
}
