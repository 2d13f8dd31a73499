//! Send use case - drives one destination's queue through its publisher

use time::{Duration, OffsetDateTime};

use crate::ledger::Ledger;
use crate::model::{ItemKind, QueueItem, ReplyAudience, SendOutcome, SentRef};
use crate::policy::Policy;
use crate::ports::{PublishError, PublishRequest, Publisher, RateLimitStatus};
use crate::usecases::render::Renderer;

/// Configuration for the sender
#[derive(Debug, Clone)]
pub struct SendConfig {
    /// Pause a destination once its remaining quota drops below this percentage
    pub rate_limit_buffer: f64,
    /// Cooldown used when a destination throttles without a reset time
    pub default_cooldown: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            rate_limit_buffer: 0.0,
            default_cooldown: Duration::minutes(15),
        }
    }
}

/// Result of one queue
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    pub outcomes: Vec<(String, SendOutcome)>,
    /// Persist a cooldown until this time
    pub resume_at: Option<OffsetDateTime>,
}

pub struct Sender<'a> {
    policy: &'a Policy,
    renderer: &'a Renderer,
    config: SendConfig,
}

impl<'a> Sender<'a> {
    pub fn new(policy: &'a Policy, renderer: &'a Renderer, config: SendConfig) -> Self {
        Self {
            policy,
            renderer,
            config,
        }
    }

    /// Send `queue` in order. Failures are recorded per item and never abort
    /// the rest of the queue; a rate limit pauses the destination for the run.
    pub async fn send_queue<P>(
        &self,
        publisher: &P,
        queue: &[QueueItem],
        ledger: &mut Ledger,
        now: OffsetDateTime,
    ) -> SendReport
    where
        P: Publisher + ?Sized,
    {
        let service = publisher.service();
        let mut report = SendReport::default();
        let mut paused = false;

        for item in queue {
            if paused {
                report.outcomes.push((item.id.clone(), SendOutcome::Paused));
                continue;
            }

            let result = match item.kind {
                ItemKind::Repost => self.repost(publisher, item, ledger, now).await,
                _ => self.publish(publisher, item, ledger, now, &mut report).await,
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(PublishError::RateLimited { resume_at }) => {
                    let resume_at = resume_at.unwrap_or(now + self.config.default_cooldown);
                    tracing::warn!(service = %service, resume_at = %resume_at, "Rate limited, pausing destination");
                    extend(&mut report.resume_at, resume_at);
                    paused = true;
                    SendOutcome::Paused
                }
                Err(e) if e.is_terminal() => {
                    tracing::error!(post_id = %item.id, service = %service, error = %e, "Rejected as duplicate");
                    ledger.record_duplicate(&item.id, service);
                    SendOutcome::Duplicate
                }
                Err(e) => {
                    tracing::error!(post_id = %item.id, service = %service, error = %e, "Failed to send");
                    if item.kind != ItemKind::Repost {
                        ledger.record_failure(&item.id, service);
                    }
                    SendOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            report.outcomes.push((item.id.clone(), outcome));
        }

        report
    }

    async fn repost<P>(
        &self,
        publisher: &P,
        item: &QueueItem,
        ledger: &mut Ledger,
        now: OffsetDateTime,
    ) -> Result<SendOutcome, PublishError>
    where
        P: Publisher + ?Sized,
    {
        let Some(target) = ledger.sent_ref(&item.id, publisher.service()) else {
            return Ok(deferred(&item.id, "repost target missing"));
        };
        publisher.repost(&target).await?;
        tracing::info!(post_id = %item.id, service = %publisher.service(), "Reposted");
        ledger.record_repost(&item.id, now);
        Ok(SendOutcome::Reposted)
    }

    async fn publish<P>(
        &self,
        publisher: &P,
        item: &QueueItem,
        ledger: &mut Ledger,
        now: OffsetDateTime,
        report: &mut SendReport,
    ) -> Result<SendOutcome, PublishError>
    where
        P: Publisher + ?Sized,
    {
        let service = publisher.service();
        let post = &item.post;

        let mut reply_to = match &post.reply_id {
            Some(parent) => match ledger.sent_ref(parent, service) {
                Some(sent) => Some(sent),
                None => return Ok(deferred(&item.id, "parent not sent to destination")),
            },
            None => None,
        };
        let mut quote_of = match &post.quote_id {
            Some(quoted) => match ledger.sent_ref(quoted, service) {
                Some(sent) => Some(sent),
                None => return Ok(deferred(&item.id, "quoted post not sent to destination")),
            },
            None => None,
        };

        let mut text = post.text.clone();
        if !publisher.supports_quotes() {
            if let Some(quoted) = quote_of.take() {
                if reply_to.is_none() {
                    reply_to = Some(quoted);
                } else if let Some(url) = publisher.post_url(&quoted) {
                    text = format!("{}\n{}", text, url);
                }
            }
        }

        let visibility = self.policy.visibility(post);
        let audience = self.policy.reply_audience(post);
        let language = post.main_language().map(str::to_string);
        let chunks = self.renderer.chunks(&text, service);
        let mut last: Option<SentRef> = None;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let request = PublishRequest {
                source_id: item.id.clone(),
                text: chunk,
                reply_to: last.clone().or_else(|| reply_to.clone()),
                quote_of: if i == 0 { quote_of.clone() } else { None },
                media: if i == 0 { post.local_media.clone() } else { vec![] },
                visibility,
                reply_audience: audience,
                language: language.clone(),
            };

            let result = match publisher.publish(&request).await {
                Ok(result) => result,
                // The thread head is already recorded; the rest is not retried.
                Err(e) if last.is_some() => {
                    tracing::error!(post_id = %item.id, service = %service, chunk = i, error = %e, "Failed to send thread continuation");
                    break;
                }
                Err(e) => return Err(e),
            };

            tracing::info!(post_id = %item.id, service = %service, native_id = %result.native_id, "Sent");
            let sent = result.sent_ref();
            ledger.record_sent(&item.id, service, sent.clone(), now);

            if audience != ReplyAudience::All {
                if let Err(e) = publisher.restrict_replies(&sent, audience).await {
                    tracing::error!(post_id = %item.id, service = %service, error = %e, "Failed to restrict replies");
                }
            }
            if let Some(status) = result.rate_limit {
                self.check_buffer(service.as_str(), &status, report);
            }
            last = Some(sent);
        }

        match last {
            Some(sent) => Ok(SendOutcome::Sent {
                native_id: sent.native_id,
            }),
            None => Ok(deferred(&item.id, "nothing to send")),
        }
    }

    fn check_buffer(&self, service: &str, status: &RateLimitStatus, report: &mut SendReport) {
        let remaining = status.remaining_percent();
        if remaining < self.config.rate_limit_buffer {
            tracing::warn!(
                service = %service,
                remaining_percent = remaining,
                reset_at = %status.reset_at,
                "Rate limit buffer reached"
            );
            extend(&mut report.resume_at, status.reset_at);
        }
    }
}

fn deferred(id: &str, reason: &str) -> SendOutcome {
    tracing::info!(post_id = %id, reason = %reason, "Deferring post");
    SendOutcome::Deferred {
        reason: reason.to_string(),
    }
}

fn extend(slot: &mut Option<OffsetDateTime>, at: OffsetDateTime) {
    *slot = Some(slot.map_or(at, |current| current.max(at)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Post, Service, ServiceStatus};
    use crate::policy::PolicyConfig;
    use crate::ports::PublishResult;
    use crate::usecases::render::RenderConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    #[derive(Default)]
    struct FakePublisher {
        quotes: bool,
        requests: Mutex<Vec<PublishRequest>>,
        reposts: Mutex<Vec<SentRef>>,
        restricted: Mutex<Vec<(SentRef, ReplyAudience)>>,
        fail_with: Mutex<Vec<PublishError>>,
        rate_limit: Option<RateLimitStatus>,
    }

    impl FakePublisher {
        fn new() -> Self {
            Self {
                quotes: true,
                ..Default::default()
            }
        }

        fn failing(errors: Vec<PublishError>) -> Self {
            Self {
                quotes: true,
                fail_with: Mutex::new(errors),
                ..Default::default()
            }
        }

        fn sent_texts(&self) -> Vec<String> {
            self.requests.lock().unwrap().iter().map(|r| r.text.clone()).collect()
        }
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
            if let Some(e) = self.fail_with.lock().unwrap().pop() {
                return Err(e);
            }
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(PublishResult {
                native_id: format!("n{}", requests.len()),
                reference: None,
                rate_limit: self.rate_limit,
            })
        }

        async fn repost(&self, target: &SentRef) -> Result<(), PublishError> {
            self.reposts.lock().unwrap().push(target.clone());
            Ok(())
        }

        async fn delete(&self, _target: &SentRef) -> Result<(), PublishError> {
            Ok(())
        }

        async fn restrict_replies(&self, target: &SentRef, audience: ReplyAudience) -> Result<(), PublishError> {
            self.restricted.lock().unwrap().push((target.clone(), audience));
            Ok(())
        }

        fn supports_quotes(&self) -> bool {
            self.quotes
        }

        fn post_url(&self, target: &SentRef) -> Option<String> {
            Some(format!("https://dest.example/{}", target.native_id))
        }

        fn service(&self) -> Service {
            Service::Mastodon
        }
    }

    fn ledger() -> Ledger {
        Ledger::new(Service::Bluesky, vec![Service::Mastodon], 3)
    }

    fn item(id: &str, kind: ItemKind, post: Post) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            kind,
            post,
        }
    }

    fn sent(id: &str) -> SentRef {
        SentRef {
            native_id: id.to_string(),
            reference: None,
        }
    }

    struct Harness {
        policy: Policy,
        renderer: Renderer,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                policy: Policy::new(PolicyConfig::default()),
                renderer: Renderer::new(RenderConfig::default()),
            }
        }

        fn sender(&self, config: SendConfig) -> Sender<'_> {
            Sender::new(&self.policy, &self.renderer, config)
        }
    }

    #[tokio::test]
    async fn test_sent_post_is_recorded() {
        let h = Harness::new();
        let publisher = FakePublisher::new();
        let mut ledger = ledger();
        ledger.observe("a", None);

        let report = h
            .sender(SendConfig::default())
            .send_queue(&publisher, &[item("a", ItemKind::Post, Post::new("a", "Hello world", NOW))], &mut ledger, NOW)
            .await;

        assert_eq!(
            report.outcomes,
            vec![("a".to_string(), SendOutcome::Sent { native_id: "n1".to_string() })]
        );
        assert!(ledger.is_posted("a", &[Service::Mastodon]));
        assert_eq!(ledger.last_activity("a"), Some(NOW));
    }

    #[tokio::test]
    async fn test_reply_resolves_destination_parent_and_defers_without_it() {
        let h = Harness::new();
        let publisher = FakePublisher::new();
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.observe("b", None);
        let mut reply = Post::new("b", "reply", NOW);
        reply.reply_id = Some("a".to_string());
        let queue = [item("b", ItemKind::Reply, reply)];

        let report = h.sender(SendConfig::default()).send_queue(&publisher, &queue, &mut ledger, NOW).await;
        assert!(matches!(report.outcomes[0].1, SendOutcome::Deferred { .. }));
        assert_eq!(ledger.status("b", Service::Mastodon), Some(&ServiceStatus::NotAttempted));

        ledger.record_sent("a", Service::Mastodon, sent("m-parent"), NOW);
        h.sender(SendConfig::default()).send_queue(&publisher, &queue, &mut ledger, NOW).await;
        let requests = publisher.requests.lock().unwrap();
        assert_eq!(requests[0].reply_to, Some(sent("m-parent")));
    }

    #[tokio::test]
    async fn test_long_text_threads_chunks_and_stores_tail() {
        let h = Harness::new();
        let publisher = FakePublisher::new();
        let mut ledger = ledger();
        ledger.observe("a", None);
        let text = format!("{}\n{}", "a".repeat(400), "b".repeat(400));

        h.sender(SendConfig::default())
            .send_queue(&publisher, &[item("a", ItemKind::Post, Post::new("a", text, NOW))], &mut ledger, NOW)
            .await;

        let requests = publisher.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].reply_to, None);
        assert_eq!(requests[1].reply_to, Some(sent("n1")));
        assert_eq!(ledger.sent_ref("a", Service::Mastodon), Some(sent("n2")));
    }

    #[tokio::test]
    async fn test_quote_without_native_support_becomes_reply() {
        let h = Harness::new();
        let publisher = FakePublisher {
            quotes: false,
            ..Default::default()
        };
        let mut ledger = ledger();
        for id in ["a", "b", "c"] {
            ledger.observe(id, None);
        }
        ledger.record_sent("a", Service::Mastodon, sent("m-a"), NOW);
        ledger.record_sent("b", Service::Mastodon, sent("m-b"), NOW);

        let mut quote = Post::new("c", "quoting", NOW);
        quote.quote_id = Some("a".to_string());
        let mut reply_quote = Post::new("d", "both", NOW);
        reply_quote.reply_id = Some("b".to_string());
        reply_quote.quote_id = Some("a".to_string());
        ledger.observe("d", None);

        h.sender(SendConfig::default())
            .send_queue(
                &publisher,
                &[item("c", ItemKind::Quote, quote), item("d", ItemKind::Reply, reply_quote)],
                &mut ledger,
                NOW,
            )
            .await;

        let requests = publisher.requests.lock().unwrap();
        assert_eq!(requests[0].reply_to, Some(sent("m-a")));
        assert_eq!(requests[0].quote_of, None);
        assert_eq!(requests[1].reply_to, Some(sent("m-b")));
        assert_eq!(requests[1].text, "both\nhttps://dest.example/m-a");
    }

    #[tokio::test]
    async fn test_failures_reach_ceiling_and_duplicates_are_terminal() {
        let h = Harness::new();
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.observe("d", None);
        let queue = [item("a", ItemKind::Post, Post::new("a", "x", NOW))];

        for _ in 0..3 {
            let publisher = FakePublisher::failing(vec![PublishError::Api("500".to_string())]);
            let report = h.sender(SendConfig::default()).send_queue(&publisher, &queue, &mut ledger, NOW).await;
            assert!(matches!(report.outcomes[0].1, SendOutcome::Failed { .. }));
        }
        assert_eq!(
            ledger.status("a", Service::Mastodon),
            Some(&ServiceStatus::FailedTerminal { attempts: 3 })
        );

        let publisher = FakePublisher::failing(vec![PublishError::Duplicate("same text".to_string())]);
        let report = h
            .sender(SendConfig::default())
            .send_queue(&publisher, &[item("d", ItemKind::Post, Post::new("d", "x", NOW))], &mut ledger, NOW)
            .await;
        assert_eq!(report.outcomes[0].1, SendOutcome::Duplicate);
        assert!(ledger.all_terminal("d", &[Service::Mastodon]));
    }

    #[tokio::test]
    async fn test_rate_limit_pauses_rest_of_queue() {
        let h = Harness::new();
        let reset = NOW + Duration::minutes(5);
        let publisher = FakePublisher::failing(vec![PublishError::RateLimited { resume_at: Some(reset) }]);
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.observe("b", None);

        let report = h
            .sender(SendConfig::default())
            .send_queue(
                &publisher,
                &[
                    item("a", ItemKind::Post, Post::new("a", "x", NOW)),
                    item("b", ItemKind::Post, Post::new("b", "y", NOW)),
                ],
                &mut ledger,
                NOW,
            )
            .await;

        assert_eq!(report.resume_at, Some(reset));
        assert!(report.outcomes.iter().all(|(_, o)| *o == SendOutcome::Paused));
        assert_eq!(ledger.status("a", Service::Mastodon), Some(&ServiceStatus::NotAttempted));
        assert!(publisher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_buffer_schedules_cooldown() {
        let h = Harness::new();
        let reset = NOW + Duration::minutes(10);
        let publisher = FakePublisher {
            quotes: true,
            rate_limit: Some(RateLimitStatus {
                limit: 100,
                remaining: 5,
                reset_at: reset,
            }),
            ..Default::default()
        };
        let mut ledger = ledger();
        ledger.observe("a", None);

        let report = h
            .sender(SendConfig {
                rate_limit_buffer: 10.0,
                ..Default::default()
            })
            .send_queue(&publisher, &[item("a", ItemKind::Post, Post::new("a", "x", NOW))], &mut ledger, NOW)
            .await;

        assert_eq!(report.resume_at, Some(reset));
        assert!(ledger.is_posted("a", &[Service::Mastodon]));
    }

    #[tokio::test]
    async fn test_repost_and_reply_restriction() {
        let h = Harness::new();
        let publisher = FakePublisher::new();
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.observe("b", None);
        ledger.record_sent("a", Service::Mastodon, sent("m-a"), NOW - Duration::hours(2));
        let mut restricted = Post::new("b", "only followers reply", NOW);
        restricted.reply_audience = ReplyAudience::Following;

        let report = h
            .sender(SendConfig::default())
            .send_queue(
                &publisher,
                &[
                    item("a", ItemKind::Repost, Post::new("a", "x", NOW)),
                    item("b", ItemKind::Post, restricted),
                ],
                &mut ledger,
                NOW,
            )
            .await;

        assert_eq!(report.outcomes[0].1, SendOutcome::Reposted);
        assert_eq!(*publisher.reposts.lock().unwrap(), vec![sent("m-a")]);
        assert_eq!(ledger.last_activity("a"), Some(NOW));
        assert_eq!(
            *publisher.restricted.lock().unwrap(),
            vec![(sent("n1"), ReplyAudience::Following)]
        );
        assert_eq!(publisher.sent_texts(), vec!["only followers reply".to_string()]);
    }
}
