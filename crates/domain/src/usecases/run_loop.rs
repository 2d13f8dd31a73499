//! Run loop use case - one fetch, reconcile, send and persist cycle

use std::sync::Arc;

use time::Duration;

use crate::{
    ledger::{ACTIVITY_WINDOW, Ledger},
    model::{RunSummary, SendOutcome},
    policy::{OverflowPolicy, Policy, PolicyConfig},
    ports::{ActivityRepo, Clock, LedgerRepo, MediaStore, PostSource, Publisher, RateLimitGate},
    usecases::{
        dispatch::{DispatchConfig, Dispatcher},
        normalize::{NormalizeConfig, Normalizer},
        render::{RenderConfig, Renderer},
        send::{SendConfig, Sender},
    },
};

/// Configuration for the run loop
#[derive(Debug, Clone)]
pub struct RunLoopConfig {
    /// Failed attempts before a destination is given up on
    pub max_retries: u32,
    /// Posts older than this are never fetched
    pub lookback: Duration,
    pub overflow: OverflowPolicy,
    /// Dry run mode (no ledger, cache, backup or cooldown writes)
    pub dry_run: bool,
    pub policy: PolicyConfig,
    pub normalize: NormalizeConfig,
    pub dispatch: DispatchConfig,
    pub send: SendConfig,
    pub render: RenderConfig,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            lookback: Duration::hours(12),
            overflow: OverflowPolicy::default(),
            dry_run: false,
            policy: PolicyConfig::default(),
            normalize: NormalizeConfig::default(),
            dispatch: DispatchConfig::default(),
            send: SendConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

/// Run loop orchestrator
pub struct RunLoop<S, L, A, G, M, Cl>
where
    S: PostSource + ?Sized,
    L: LedgerRepo + ?Sized,
    A: ActivityRepo + ?Sized,
    G: RateLimitGate + ?Sized,
    M: MediaStore + ?Sized,
    Cl: Clock + ?Sized,
{
    post_source: Arc<S>,
    publishers: Vec<Arc<dyn Publisher>>,
    ledger_repo: Arc<L>,
    activity_repo: Arc<A>,
    rate_limit_gate: Arc<G>,
    media_store: Arc<M>,
    clock: Arc<Cl>,
    config: RunLoopConfig,
    policy: Policy,
    renderer: Renderer,
    normalizer: Normalizer,
}

impl<S, L, A, G, M, Cl> RunLoop<S, L, A, G, M, Cl>
where
    S: PostSource + ?Sized,
    L: LedgerRepo + ?Sized,
    A: ActivityRepo + ?Sized,
    G: RateLimitGate + ?Sized,
    M: MediaStore + ?Sized,
    Cl: Clock + ?Sized,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        post_source: Arc<S>,
        publishers: Vec<Arc<dyn Publisher>>,
        ledger_repo: Arc<L>,
        activity_repo: Arc<A>,
        rate_limit_gate: Arc<G>,
        media_store: Arc<M>,
        clock: Arc<Cl>,
        mut config: RunLoopConfig,
    ) -> Self {
        let input = post_source.service();
        let publishers: Vec<_> = publishers
            .into_iter()
            .filter(|p| p.service() != input)
            .collect();
        config.dispatch.mirror_reposts = publishers
            .iter()
            .filter(|p| p.supports_reposts())
            .map(|p| p.service())
            .collect();

        let policy = Policy::new(config.policy.clone());
        let renderer = Renderer::new(config.render.clone());
        let normalizer = Normalizer::new(config.normalize.clone());
        Self {
            post_source,
            publishers,
            ledger_repo,
            activity_repo,
            rate_limit_gate,
            media_store,
            clock,
            config,
            policy,
            renderer,
            normalizer,
        }
    }

    /// Run one complete cycle. A fetch failure returns before anything is written.
    pub async fn run_once(&self) -> Result<RunSummary, RunLoopError> {
        let now = self.clock.now();
        let mut summary = RunSummary::default();

        if let Some(until) = self
            .rate_limit_gate
            .active_until(now)
            .await
            .map_err(|e| RunLoopError::State(e.to_string()))?
        {
            tracing::info!(resume_at = %until, "Rate limit cooldown active, nothing to do");
            summary.paused = true;
            return Ok(summary);
        }

        if !self.config.dry_run {
            if let Err(e) = self.ledger_repo.backup(now).await {
                tracing::error!(error = %e, "Failed to back up ledger");
            }
        }

        let mut ledger = self.load_ledger(now).await?;
        let time_limit = ledger.post_time_limit(now, self.config.lookback, self.config.overflow);

        tracing::info!(source = %self.post_source.service(), since = %time_limit, "Fetching posts");
        let entries = self
            .post_source
            .fetch_feed()
            .await
            .map_err(|e| RunLoopError::PostSource(e.to_string()))?;

        let feed = self
            .normalizer
            .normalize(entries, self.post_source.account(), time_limit);
        for id in &feed.seen_ids {
            ledger.confirm_live(id);
        }
        summary.fetched = feed.posts.len();
        tracing::info!(count = summary.fetched, "Fetched posts");

        let queues = Dispatcher::new(&self.policy, self.config.dispatch.clone())
            .build_queues(feed.posts, &mut ledger, self.media_store.as_ref(), now)
            .await;
        summary.queued = queues.values().map(Vec::len).sum();

        if queues.is_empty() && ledger.deleted_candidates().is_empty() {
            tracing::info!("Nothing to send");
            if ledger.is_dirty() {
                self.persist(&ledger).await?;
            }
            self.cleanup_media().await;
            return Ok(summary);
        }

        let sender = Sender::new(&self.policy, &self.renderer, self.config.send.clone());
        for (service, queue) in &queues {
            let Some(publisher) = self.publisher(*service) else {
                tracing::warn!(service = %service, "No publisher configured");
                continue;
            };
            let report = sender
                .send_queue(publisher.as_ref(), queue, &mut ledger, now)
                .await;
            for (_, outcome) in &report.outcomes {
                summary.record(outcome);
            }
            if report.outcomes.iter().any(|(_, o)| *o == SendOutcome::Paused)
                || report.resume_at.is_some()
            {
                tracing::warn!(service = %service, "Destination paused");
            }
            if let Some(resume_at) = report.resume_at {
                if !self.config.dry_run {
                    self.rate_limit_gate
                        .pause_until(resume_at)
                        .await
                        .map_err(|e| RunLoopError::State(e.to_string()))?;
                }
            }
        }

        summary.deleted = self.propagate_deletes(&mut ledger).await;

        self.persist(&ledger).await?;
        self.cleanup_media().await;

        tracing::info!(
            sent = summary.sent,
            reposted = summary.reposted,
            deferred = summary.deferred,
            failed = summary.failed,
            duplicates = summary.duplicates,
            deleted = summary.deleted,
            "Run complete"
        );
        Ok(summary)
    }

    /// Delete posts that vanished from the source on every destination that
    /// holds a real id; purge a record only once every delete succeeded.
    pub async fn propagate_deletes(&self, ledger: &mut Ledger) -> usize {
        let mut deleted = 0;

        for id in ledger.deleted_candidates() {
            let targets: Vec<_> = match ledger.record(&id) {
                Some(record) => self
                    .publishers
                    .iter()
                    .filter_map(|p| record.sent_ref(p.service()).map(|sent| (p, sent)))
                    .collect(),
                None => vec![],
            };

            let mut complete = true;
            for (publisher, sent) in targets {
                match publisher.delete(&sent).await {
                    Ok(()) => {
                        tracing::info!(post_id = %id, service = %publisher.service(), "Deleted post");
                    }
                    Err(e) => {
                        tracing::error!(post_id = %id, service = %publisher.service(), error = %e, "Failed to delete post");
                        complete = false;
                    }
                }
            }

            if complete {
                ledger.remove(&id);
                deleted += 1;
            }
        }

        deleted
    }

    async fn load_ledger(&self, now: time::OffsetDateTime) -> Result<Ledger, RunLoopError> {
        let input = self.post_source.service();
        let records = self
            .ledger_repo
            .load(input)
            .await
            .map_err(|e| RunLoopError::State(e.to_string()))?;
        let activity = self
            .activity_repo
            .load(now - ACTIVITY_WINDOW)
            .await
            .map_err(|e| RunLoopError::State(e.to_string()))?;

        tracing::debug!(records = records.len(), activity = activity.len(), "Loaded ledger");
        Ok(Ledger::from_parts(
            input,
            self.publishers.iter().map(|p| p.service()).collect(),
            self.config.max_retries,
            records,
            activity,
        ))
    }

    async fn persist(&self, ledger: &Ledger) -> Result<(), RunLoopError> {
        if self.config.dry_run {
            tracing::info!("[DRY RUN] Not saving ledger");
            return Ok(());
        }
        self.ledger_repo
            .save(ledger.records())
            .await
            .map_err(|e| RunLoopError::State(e.to_string()))?;
        self.activity_repo
            .save(&ledger.activity_entries())
            .await
            .map_err(|e| RunLoopError::State(e.to_string()))
    }

    async fn cleanup_media(&self) {
        if let Err(e) = self.media_store.cleanup().await {
            tracing::warn!(error = %e, "Failed to clean up media");
        }
    }

    fn publisher(&self, service: crate::model::Service) -> Option<&Arc<dyn Publisher>> {
        self.publishers.iter().find(|p| p.service() == service)
    }
}

/// Errors from the run loop
#[derive(Debug, thiserror::Error)]
pub enum RunLoopError {
    #[error("Post source error: {0}")]
    PostSource(String),
    #[error("State error: {0}")]
    State(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEntry;
    use crate::model::{LocalMedia, Media, PostRecord, ReplyAudience, SentRef, Service, ServiceStatus};
    use crate::ports::{
        MediaError, PostSourceError, PublishError, PublishRequest, PublishResult, StateError,
    };
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use std::sync::Mutex;
    use time::OffsetDateTime;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);
    const ME: &str = "me.example";

    // Fake implementations for testing
    struct FakePostSource {
        entries: Vec<FeedEntry>,
        fail: bool,
    }

    #[async_trait]
    impl PostSource for FakePostSource {
        async fn fetch_feed(&self) -> Result<Vec<FeedEntry>, PostSourceError> {
            if self.fail {
                return Err(PostSourceError::Network("connection refused".to_string()));
            }
            Ok(self.entries.clone())
        }

        fn service(&self) -> Service {
            Service::Bluesky
        }

        fn account(&self) -> &str {
            ME
        }
    }

    struct FakePublisher {
        service: Service,
        published: Mutex<Vec<PublishRequest>>,
        deleted: Mutex<Vec<SentRef>>,
        fail_deletes: bool,
    }

    impl FakePublisher {
        fn new(service: Service) -> Self {
            Self {
                service,
                published: Mutex::new(vec![]),
                deleted: Mutex::new(vec![]),
                fail_deletes: false,
            }
        }
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
            let mut published = self.published.lock().unwrap();
            published.push(request.clone());
            Ok(PublishResult {
                native_id: format!("{}-{}", self.service, published.len()),
                reference: None,
                rate_limit: None,
            })
        }

        async fn repost(&self, _target: &SentRef) -> Result<(), PublishError> {
            Ok(())
        }

        async fn delete(&self, target: &SentRef) -> Result<(), PublishError> {
            if self.fail_deletes {
                return Err(PublishError::Network("timeout".to_string()));
            }
            self.deleted.lock().unwrap().push(target.clone());
            Ok(())
        }

        async fn restrict_replies(&self, _target: &SentRef, _audience: ReplyAudience) -> Result<(), PublishError> {
            Ok(())
        }

        fn post_url(&self, _target: &SentRef) -> Option<String> {
            None
        }

        fn service(&self) -> Service {
            self.service
        }
    }

    #[derive(Default)]
    struct FakeLedgerRepo {
        records: Mutex<IndexMap<String, PostRecord>>,
        saves: Mutex<usize>,
        backups: Mutex<usize>,
    }

    #[async_trait]
    impl LedgerRepo for FakeLedgerRepo {
        async fn load(&self, _input: Service) -> Result<IndexMap<String, PostRecord>, StateError> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn save(&self, records: &IndexMap<String, PostRecord>) -> Result<(), StateError> {
            *self.records.lock().unwrap() = records.clone();
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }

        async fn backup(&self, _now: OffsetDateTime) -> Result<(), StateError> {
            *self.backups.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeActivityRepo {
        entries: Mutex<Vec<(String, OffsetDateTime)>>,
    }

    #[async_trait]
    impl ActivityRepo for FakeActivityRepo {
        async fn load(&self, since: OffsetDateTime) -> Result<Vec<(String, OffsetDateTime)>, StateError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, at)| *at > since)
                .cloned()
                .collect())
        }

        async fn save(&self, entries: &[(String, OffsetDateTime)]) -> Result<(), StateError> {
            *self.entries.lock().unwrap() = entries.to_vec();
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGate {
        until: Mutex<Option<OffsetDateTime>>,
    }

    #[async_trait]
    impl RateLimitGate for FakeGate {
        async fn active_until(&self, now: OffsetDateTime) -> Result<Option<OffsetDateTime>, StateError> {
            Ok(self.until.lock().unwrap().filter(|until| *until > now))
        }

        async fn pause_until(&self, resume_at: OffsetDateTime) -> Result<(), StateError> {
            *self.until.lock().unwrap() = Some(resume_at);
            Ok(())
        }
    }

    struct FakeMediaStore;

    #[async_trait]
    impl MediaStore for FakeMediaStore {
        async fn download(&self, _media: &Media) -> Result<Vec<LocalMedia>, MediaError> {
            Ok(vec![])
        }

        async fn cleanup(&self) -> Result<(), MediaError> {
            Ok(())
        }
    }

    struct FakeClock {
        time: OffsetDateTime,
    }

    impl Clock for FakeClock {
        fn now(&self) -> OffsetDateTime {
            self.time
        }
    }

    struct Fixture {
        mastodon: Arc<FakePublisher>,
        ledger_repo: Arc<FakeLedgerRepo>,
        activity_repo: Arc<FakeActivityRepo>,
        gate: Arc<FakeGate>,
    }

    type TestLoop =
        RunLoop<FakePostSource, FakeLedgerRepo, FakeActivityRepo, FakeGate, FakeMediaStore, FakeClock>;

    impl Fixture {
        fn new() -> Self {
            Self {
                mastodon: Arc::new(FakePublisher::new(Service::Mastodon)),
                ledger_repo: Arc::new(FakeLedgerRepo::default()),
                activity_repo: Arc::new(FakeActivityRepo::default()),
                gate: Arc::new(FakeGate::default()),
            }
        }

        fn run_loop(&self, entries: Vec<FeedEntry>, config: RunLoopConfig) -> TestLoop {
            self.run_loop_with(FakePostSource { entries, fail: false }, config)
        }

        fn run_loop_with(&self, source: FakePostSource, config: RunLoopConfig) -> TestLoop {
            RunLoop::new(
                Arc::new(source),
                vec![self.mastodon.clone() as Arc<dyn Publisher>],
                self.ledger_repo.clone(),
                self.activity_repo.clone(),
                self.gate.clone(),
                Arc::new(FakeMediaStore),
                Arc::new(FakeClock { time: NOW }),
                config,
            )
        }
    }

    fn entry(id: &str, text: &str, minutes_ago: i64) -> FeedEntry {
        FeedEntry::new(id, ME, text, NOW - Duration::minutes(minutes_ago))
    }

    #[tokio::test]
    async fn test_run_once_sends_and_persists() {
        let fx = Fixture::new();
        let run_loop = fx.run_loop(vec![entry("a", "Hello world", 5)], RunLoopConfig::default());

        let summary = run_loop.run_once().await.unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(*fx.ledger_repo.backups.lock().unwrap(), 1);
        let records = fx.ledger_repo.records.lock().unwrap();
        assert_eq!(
            records["a"].sent_ref(Service::Mastodon).unwrap().native_id,
            "mastodon-1"
        );
        assert_eq!(fx.activity_repo.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fx = Fixture::new();
        let entries = vec![entry("a", "Hello world", 5)];
        fx.run_loop(entries.clone(), RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        let summary = fx
            .run_loop(entries, RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.queued, 0);
        assert_eq!(fx.mastodon.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_thread_in_one_run() {
        let fx = Fixture::new();
        let mut reply = entry("b", "second", 1);
        reply.reply_to = Some(crate::feed::ReplyTarget {
            id: "a".to_string(),
            author: Some(ME.to_string()),
        });

        fx.run_loop(vec![reply, entry("a", "first", 5)], RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        let published = fx.mastodon.published.lock().unwrap();
        assert_eq!(published[0].text, "first");
        assert_eq!(published[1].reply_to.as_ref().unwrap().native_id, "mastodon-1");
    }

    #[tokio::test]
    async fn test_fetch_failure_writes_nothing() {
        let fx = Fixture::new();
        let run_loop = fx.run_loop_with(
            FakePostSource {
                entries: vec![],
                fail: true,
            },
            RunLoopConfig::default(),
        );

        let result = run_loop.run_once().await;

        assert!(matches!(result, Err(RunLoopError::PostSource(_))));
        assert_eq!(*fx.ledger_repo.saves.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_active_cooldown_skips_run() {
        let fx = Fixture::new();
        *fx.gate.until.lock().unwrap() = Some(NOW + Duration::minutes(3));

        let summary = fx
            .run_loop(vec![entry("a", "Hello", 5)], RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        assert!(summary.paused);
        assert_eq!(*fx.ledger_repo.backups.lock().unwrap(), 0);
        assert!(fx.mastodon.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let fx = Fixture::new();
        let config = RunLoopConfig {
            dry_run: true,
            ..Default::default()
        };

        let summary = fx
            .run_loop(vec![entry("a", "Hello", 5)], config)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(*fx.ledger_repo.saves.lock().unwrap(), 0);
        assert_eq!(*fx.ledger_repo.backups.lock().unwrap(), 0);
    }

    fn seeded(fx: &Fixture) {
        let mut record = PostRecord::new(Service::Bluesky, "gone", None, &[Service::Mastodon]);
        *record.status_mut(Service::Mastodon) = ServiceStatus::Sent {
            native_id: "m-gone".to_string(),
            reference: None,
        };
        fx.ledger_repo
            .records
            .lock()
            .unwrap()
            .insert("gone".to_string(), record);
        fx.activity_repo
            .entries
            .lock()
            .unwrap()
            .push(("gone".to_string(), NOW - Duration::minutes(10)));
    }

    #[tokio::test]
    async fn test_deleted_source_post_propagates() {
        let fx = Fixture::new();
        seeded(&fx);

        let summary = fx
            .run_loop(vec![], RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.deleted, 1);
        assert_eq!(
            *fx.mastodon.deleted.lock().unwrap(),
            vec![SentRef {
                native_id: "m-gone".to_string(),
                reference: None
            }]
        );
        assert!(!fx.ledger_repo.records.lock().unwrap().contains_key("gone"));
        assert!(fx.activity_repo.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_record() {
        let mut fx = Fixture::new();
        fx.mastodon = Arc::new(FakePublisher {
            fail_deletes: true,
            ..FakePublisher::new(Service::Mastodon)
        });
        seeded(&fx);

        let summary = fx
            .run_loop(vec![], RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.deleted, 0);
        assert!(fx.ledger_repo.records.lock().unwrap().contains_key("gone"));
    }

    #[tokio::test]
    async fn test_post_still_in_feed_is_not_deleted() {
        let fx = Fixture::new();
        seeded(&fx);

        let summary = fx
            .run_loop(vec![entry("gone", "still here", 60 * 24)], RunLoopConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.deleted, 0);
        assert!(fx.mastodon.deleted.lock().unwrap().is_empty());
    }
}
