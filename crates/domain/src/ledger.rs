//! In-memory cross-service ledger
//!
//! Holds every [`PostRecord`] plus the recent-activity cache for one run.
//! Persistence lives behind [`LedgerRepo`](crate::ports::LedgerRepo) and
//! [`ActivityRepo`](crate::ports::ActivityRepo); this type only mutates memory.

use indexmap::{IndexMap, IndexSet};
use time::{Duration, OffsetDateTime};

use crate::model::{PostRecord, SentRef, Service, ServiceStatus};
use crate::policy::OverflowPolicy;

/// Width of the recent-activity window
pub const ACTIVITY_WINDOW: Duration = Duration::hours(1);

#[derive(Debug, Clone)]
pub struct Ledger {
    input: Service,
    outputs: Vec<Service>,
    max_retries: u32,
    records: IndexMap<String, PostRecord>,
    activity: IndexMap<String, OffsetDateTime>,
    /// Recently active ids not yet seen in this run's feed
    deleted: IndexSet<String>,
    dirty: bool,
}

impl Ledger {
    /// Assemble a ledger from loaded records and cache entries
    pub fn from_parts(
        input: Service,
        outputs: Vec<Service>,
        max_retries: u32,
        mut records: IndexMap<String, PostRecord>,
        activity: Vec<(String, OffsetDateTime)>,
    ) -> Self {
        let max_retries = max_retries.max(1);
        let deleted = activity.iter().map(|(id, _)| id.clone()).collect();

        // A lowered limit or an older ledger can leave counts at or past the ceiling
        let mut dirty = false;
        for (id, record) in records.iter_mut() {
            for (service, status) in record.services.iter_mut() {
                if let ServiceStatus::Failed { attempts } = *status {
                    if attempts >= max_retries {
                        tracing::debug!(post_id = %id, service = %service, attempts, "Post reached error limit");
                        *status = ServiceStatus::FailedTerminal { attempts };
                        dirty = true;
                    }
                }
            }
        }

        Self {
            input,
            outputs,
            max_retries,
            records,
            activity: activity.into_iter().collect(),
            deleted,
            dirty,
        }
    }

    /// Empty ledger
    pub fn new(input: Service, outputs: Vec<Service>, max_retries: u32) -> Self {
        Self::from_parts(input, outputs, max_retries, IndexMap::new(), vec![])
    }

    pub fn input(&self) -> Service {
        self.input
    }

    pub fn outputs(&self) -> &[Service] {
        &self.outputs
    }

    pub fn records(&self) -> &IndexMap<String, PostRecord> {
        &self.records
    }

    pub fn record(&self, id: &str) -> Option<&PostRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Something changed since load
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Register `id` as seen in the feed, creating its record on first sighting
    pub fn observe(&mut self, id: &str, reference: Option<&str>) {
        self.confirm_live(id);
        if !self.records.contains_key(id) {
            tracing::info!(post_id = %id, "Adding post to ledger");
            let record = PostRecord::new(
                self.input,
                id,
                reference.map(str::to_string),
                &self.outputs,
            );
            self.records.insert(id.to_string(), record);
            self.dirty = true;
        }
    }

    /// The id is still present at the source
    pub fn confirm_live(&mut self, id: &str) {
        if self.deleted.shift_remove(id) {
            tracing::debug!(post_id = %id, "Removing post from deletion candidates");
        }
    }

    /// True iff every requested service has a real id or a sentinel.
    /// An empty `services` means every enabled output. Registers unseen ids.
    pub fn is_posted(&mut self, id: &str, services: &[Service]) -> bool {
        if !self.records.contains_key(id) {
            self.observe(id, None);
            return false;
        }
        self.confirm_live(id);

        let services = self.resolve(services);
        let record = &self.records[id];
        services.iter().all(|&service| {
            let status = record.status(service);
            if matches!(status, ServiceStatus::FailedTerminal { .. }) {
                tracing::debug!(post_id = %id, service = %service, "Post reached error limit");
            }
            status.is_filled()
        })
    }

    /// True iff every requested service ended in a terminal sentinel
    /// (skipped, failed for good, duplicate). Unknown ids are not terminal.
    pub fn all_terminal(&self, id: &str, services: &[Service]) -> bool {
        let Some(record) = self.records.get(id) else {
            return false;
        };
        self.resolve(services)
            .iter()
            .all(|&service| record.status(service).is_terminal())
    }

    pub fn status(&self, id: &str, service: Service) -> Option<&ServiceStatus> {
        self.records.get(id).map(|r| r.status(service))
    }

    /// Destination-native handle of `id` on `service`, if it was sent there
    pub fn sent_ref(&self, id: &str, service: Service) -> Option<SentRef> {
        self.records.get(id).and_then(|r| r.sent_ref(service))
    }

    /// Exclude `id` from `service`; never overwrites a filled slot
    pub fn mark_skipped(&mut self, id: &str, service: Service) {
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        let status = record.status_mut(service);
        if !status.is_filled() {
            *status = ServiceStatus::Skipped;
            self.dirty = true;
        }
    }

    /// Store a successful send and stamp the activity cache
    pub fn record_sent(&mut self, id: &str, service: Service, sent: SentRef, now: OffsetDateTime) {
        if let Some(record) = self.records.get_mut(id) {
            *record.status_mut(service) = ServiceStatus::Sent {
                native_id: sent.native_id,
                reference: sent.reference,
            };
        }
        self.touch(id, now);
    }

    /// A repost only stamps the activity cache
    pub fn record_repost(&mut self, id: &str, now: OffsetDateTime) {
        self.touch(id, now);
    }

    /// Count one failed attempt; promotes to terminal at the retry ceiling
    pub fn record_failure(&mut self, id: &str, service: Service) -> ServiceStatus {
        let max_retries = self.max_retries;
        let Some(record) = self.records.get_mut(id) else {
            return ServiceStatus::NotAttempted;
        };
        let status = record.status_mut(service);
        let attempts = status.failures() + 1;
        *status = if attempts >= max_retries {
            tracing::warn!(post_id = %id, service = %service, attempts, "Retry limit reached");
            ServiceStatus::FailedTerminal { attempts }
        } else {
            ServiceStatus::Failed { attempts }
        };
        self.dirty = true;
        status.clone()
    }

    /// Destination rejected the content as a duplicate
    pub fn record_duplicate(&mut self, id: &str, service: Service) {
        if let Some(record) = self.records.get_mut(id) {
            *record.status_mut(service) = ServiceStatus::Duplicate;
            self.dirty = true;
        }
    }

    /// Purge a deleted post from ledger and cache
    pub fn remove(&mut self, id: &str) {
        tracing::info!(post_id = %id, "Deleting post from ledger");
        self.records.shift_remove(id);
        self.activity.shift_remove(id);
        self.deleted.shift_remove(id);
        self.dirty = true;
    }

    /// Recently active ids that were not seen in this run's feed
    pub fn deleted_candidates(&self) -> Vec<String> {
        self.deleted.iter().cloned().collect()
    }

    pub fn activity_len(&self) -> usize {
        self.activity.len()
    }

    pub fn last_activity(&self, id: &str) -> Option<OffsetDateTime> {
        self.activity.get(id).copied()
    }

    pub fn activity_entries(&self) -> Vec<(String, OffsetDateTime)> {
        self.activity
            .iter()
            .map(|(id, at)| (id.clone(), *at))
            .collect()
    }

    /// Cutoff for fetched posts: `now - lookback`, advanced to the newest
    /// activity when overflow posts are skipped
    pub fn post_time_limit(
        &self,
        now: OffsetDateTime,
        lookback: Duration,
        overflow: OverflowPolicy,
    ) -> OffsetDateTime {
        let limit = now - lookback;
        if overflow != OverflowPolicy::Skip {
            return limit;
        }
        self.activity
            .values()
            .copied()
            .fold(limit, |acc, at| acc.max(at))
    }

    fn touch(&mut self, id: &str, now: OffsetDateTime) {
        self.activity.insert(id.to_string(), now);
        self.dirty = true;
    }

    fn resolve(&self, services: &[Service]) -> Vec<Service> {
        if services.is_empty() {
            self.outputs.clone()
        } else {
            services.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn ledger() -> Ledger {
        Ledger::new(Service::Bluesky, vec![Service::Mastodon, Service::Twitter], 3)
    }

    fn sent(id: &str) -> SentRef {
        SentRef {
            native_id: id.to_string(),
            reference: None,
        }
    }

    #[test]
    fn test_is_posted_registers_first_sighting() {
        let mut ledger = ledger();
        assert!(!ledger.is_posted("a", &[Service::Mastodon]));
        assert!(ledger.contains("a"));
        assert!(ledger.is_dirty());
        assert_eq!(
            ledger.sent_ref("a", Service::Bluesky).unwrap().native_id,
            "a"
        );
    }

    #[test]
    fn test_is_posted_after_send() {
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.record_sent("a", Service::Mastodon, sent("m1"), NOW);

        assert!(ledger.is_posted("a", &[Service::Mastodon]));
        assert!(!ledger.is_posted("a", &[Service::Twitter]));
        assert!(!ledger.is_posted("a", &[]));
        assert_eq!(ledger.last_activity("a"), Some(NOW));
    }

    #[test]
    fn test_failure_ceiling_becomes_terminal() {
        let mut ledger = ledger();
        ledger.observe("a", None);

        assert_eq!(
            ledger.record_failure("a", Service::Twitter),
            ServiceStatus::Failed { attempts: 1 }
        );
        assert_eq!(
            ledger.record_failure("a", Service::Twitter),
            ServiceStatus::Failed { attempts: 2 }
        );
        assert!(!ledger.is_posted("a", &[Service::Twitter]));
        assert_eq!(
            ledger.record_failure("a", Service::Twitter),
            ServiceStatus::FailedTerminal { attempts: 3 }
        );
        assert!(ledger.is_posted("a", &[Service::Twitter]));
        assert_eq!(
            ledger.status("a", Service::Twitter).unwrap().ledger_id(),
            "FailedToPost"
        );
    }

    #[test]
    fn test_loaded_failure_count_at_ceiling_is_terminal() {
        let mut record = PostRecord::new(Service::Bluesky, "a", None, &[Service::Mastodon, Service::Twitter]);
        record
            .services
            .insert(Service::Mastodon, ServiceStatus::from_ledger("", 3, None));
        record
            .services
            .insert(Service::Twitter, ServiceStatus::from_ledger("", 2, None));
        let records = IndexMap::from([("a".to_string(), record)]);

        let mut ledger = Ledger::from_parts(
            Service::Bluesky,
            vec![Service::Mastodon, Service::Twitter],
            3,
            records,
            vec![],
        );

        assert_eq!(
            ledger.status("a", Service::Mastodon),
            Some(&ServiceStatus::FailedTerminal { attempts: 3 })
        );
        assert!(ledger.is_posted("a", &[Service::Mastodon]));
        assert!(ledger.all_terminal("a", &[Service::Mastodon]));
        assert!(!ledger.is_posted("a", &[Service::Twitter]));
        assert!(ledger.is_dirty());
    }

    #[test]
    fn test_mark_skipped_never_overwrites_real_id() {
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.record_sent("a", Service::Mastodon, sent("m1"), NOW);

        ledger.mark_skipped("a", Service::Mastodon);
        ledger.mark_skipped("a", Service::Twitter);
        ledger.mark_skipped("a", Service::Twitter);

        assert_eq!(ledger.sent_ref("a", Service::Mastodon), Some(sent("m1")));
        assert_eq!(
            ledger.status("a", Service::Twitter),
            Some(&ServiceStatus::Skipped)
        );
    }

    #[test]
    fn test_all_terminal_requires_every_service() {
        let mut ledger = ledger();
        ledger.observe("a", None);
        ledger.mark_skipped("a", Service::Mastodon);
        assert!(!ledger.all_terminal("a", &[]));

        ledger.record_duplicate("a", Service::Twitter);
        assert!(ledger.all_terminal("a", &[]));
        assert!(!ledger.all_terminal("unknown", &[]));
    }

    #[test]
    fn test_activity_ids_are_deletion_candidates_until_seen() {
        let mut ledger = Ledger::from_parts(
            Service::Bluesky,
            vec![Service::Mastodon],
            3,
            IndexMap::new(),
            vec![("a".to_string(), NOW), ("b".to_string(), NOW)],
        );

        ledger.confirm_live("a");
        assert_eq!(ledger.deleted_candidates(), vec!["b".to_string()]);

        ledger.remove("b");
        assert!(ledger.deleted_candidates().is_empty());
        assert_eq!(ledger.activity_len(), 1);
    }

    #[test]
    fn test_post_time_limit_skip_overflow_uses_newest_activity() {
        let recent = NOW - Duration::minutes(10);
        let ledger = Ledger::from_parts(
            Service::Bluesky,
            vec![Service::Mastodon],
            3,
            IndexMap::new(),
            vec![("a".to_string(), recent)],
        );

        assert_eq!(
            ledger.post_time_limit(NOW, Duration::hours(12), OverflowPolicy::Post),
            NOW - Duration::hours(12)
        );
        assert_eq!(
            ledger.post_time_limit(NOW, Duration::hours(12), OverflowPolicy::Skip),
            recent
        );
    }
}
