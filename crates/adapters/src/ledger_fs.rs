//! Newline-delimited JSON ledger on the local filesystem
//!
//! One record per line:
//! `{"origin": "bluesky", "services": {"mastodon": {"id": "...", "failure": 0}, ...}}`.
//! Sentinels (`skipped`, `FailedToPost`, `duplicate`) occupy the `id` slot.
//! Files written before per-service origins existed are upgraded on load.

use async_trait::async_trait;
use crossposter_domain::{LedgerRepo, PostRecord, Service, ServiceStatus, StateError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;

/// Filesystem ledger with a rolling daily backup
pub struct FsLedgerRepo {
    path: PathBuf,
    backup_path: PathBuf,
    read_only: bool,
}

impl FsLedgerRepo {
    pub fn new(path: impl Into<PathBuf>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_path: backup_path.into(),
            read_only: false,
        }
    }

    /// Never touch the filesystem: legacy files are upgraded in memory only,
    /// saves and backups are skipped
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerLine {
    origin: Service,
    services: BTreeMap<String, SlotLine>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SlotLine {
    #[serde(default)]
    id: String,
    #[serde(default)]
    failure: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyLine {
    skeet: String,
    ids: LegacyIds,
    #[serde(default)]
    failed: LegacyFailures,
}

#[derive(Debug, Deserialize)]
struct LegacyIds {
    #[serde(default)]
    twitter_id: String,
    #[serde(default)]
    mastodon_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyFailures {
    #[serde(default)]
    twitter: u32,
    #[serde(default)]
    mastodon: u32,
}

impl LedgerLine {
    fn into_record(self) -> PostRecord {
        let mut services = BTreeMap::new();
        for (name, slot) in self.services {
            match name.parse::<Service>() {
                Ok(service) => {
                    let status = ServiceStatus::from_ledger(&slot.id, slot.failure, slot.uri);
                    services.insert(service, status);
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown service in ledger"),
            }
        }
        PostRecord {
            origin: self.origin,
            services,
        }
    }

    fn from_record(record: &PostRecord) -> Self {
        let services = Service::ALL
            .iter()
            .map(|&service| {
                let status = record.status(service);
                let uri = match status {
                    ServiceStatus::Sent { reference, .. } => reference.clone(),
                    _ => None,
                };
                // Bluesky slots always carry a uri field
                let uri = match service {
                    Service::Bluesky => Some(uri.unwrap_or_default()),
                    _ => uri,
                };
                let slot = SlotLine {
                    id: status.ledger_id().to_string(),
                    failure: status.failures(),
                    uri,
                };
                (service.as_str().to_string(), slot)
            })
            .collect();

        Self {
            origin: record.origin,
            services,
        }
    }
}

impl LegacyLine {
    fn into_record(self) -> PostRecord {
        let services = BTreeMap::from([
            (
                Service::Bluesky,
                ServiceStatus::from_ledger(&self.skeet, 0, None),
            ),
            (
                Service::Twitter,
                ServiceStatus::from_ledger(&self.ids.twitter_id, self.failed.twitter, None),
            ),
            (
                Service::Mastodon,
                ServiceStatus::from_ledger(&self.ids.mastodon_id, self.failed.mastodon, None),
            ),
        ]);
        PostRecord {
            origin: Service::Bluesky,
            services,
        }
    }
}

/// Id a record is addressed by: its id on `input` when sent there, else its origin id
fn record_key(record: &PostRecord, input: Service) -> Option<String> {
    record
        .sent_ref(input)
        .or_else(|| record.sent_ref(record.origin))
        .map(|sent| sent.native_id)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn count_lines(path: &Path) -> Result<usize, StateError> {
    let contents = fs::read_to_string(path).await?;
    Ok(contents.lines().count())
}

/// Write `contents` next to `path` and rename over it
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl LedgerRepo for FsLedgerRepo {
    async fn load(&self, input: Service) -> Result<IndexMap<String, PostRecord>, StateError> {
        tracing::info!(path = %self.path.display(), "Reading ledger");
        let mut records = IndexMap::new();
        if !fs::try_exists(&self.path).await? {
            return Ok(records);
        }

        let contents = fs::read_to_string(&self.path).await?;
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str(line) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(line = n + 1, error = %e, "Skipping malformed ledger line");
                    None
                }
            })
            .collect();

        let legacy = lines.first().is_some_and(|first| first.get("origin").is_none());
        if legacy && self.read_only {
            tracing::info!("Upgrading legacy ledger in memory");
        } else if legacy {
            let old = sibling(&self.path, "_old");
            tracing::info!(backup = %old.display(), "Upgrading legacy ledger");
            fs::copy(&self.path, &old).await?;
        }

        for value in lines {
            let record = if legacy {
                serde_json::from_value::<LegacyLine>(value).map(LegacyLine::into_record)
            } else {
                serde_json::from_value::<LedgerLine>(value).map(LedgerLine::into_record)
            };
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable ledger record");
                    continue;
                }
            };
            match record_key(&record, input) {
                Some(key) => {
                    records.insert(key, record);
                }
                None => tracing::warn!(origin = %record.origin, "Skipping ledger record without an id"),
            }
        }

        tracing::debug!(records = records.len(), "Ledger loaded");
        Ok(records)
    }

    async fn save(&self, records: &IndexMap<String, PostRecord>) -> Result<(), StateError> {
        if self.read_only {
            tracing::debug!(path = %self.path.display(), "Read-only ledger, not saving");
            return Ok(());
        }
        tracing::info!(path = %self.path.display(), records = records.len(), "Saving ledger");
        let mut contents = String::new();
        for record in records.values() {
            let line = serde_json::to_string(&LedgerLine::from_record(record))
                .map_err(|e| StateError::Serialization(e.to_string()))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        write_atomic(&self.path, &contents).await
    }

    async fn backup(&self, now: OffsetDateTime) -> Result<(), StateError> {
        if self.read_only || !fs::try_exists(&self.path).await? {
            return Ok(());
        }

        if fs::try_exists(&self.backup_path).await? {
            let modified = OffsetDateTime::from(fs::metadata(&self.backup_path).await?.modified()?);
            if modified > now - Duration::hours(24) {
                return Ok(());
            }

            if count_lines(&self.backup_path).await? <= count_lines(&self.path).await? {
                fs::remove_file(&self.backup_path).await?;
            } else {
                let dated = sibling(
                    &self.backup_path,
                    &format!(
                        "_{:02}{:02}{:02}",
                        now.year() % 100,
                        u8::from(now.month()),
                        now.day()
                    ),
                );
                fs::rename(&self.backup_path, &dated).await?;
                tracing::error!(
                    kept = %dated.display(),
                    "Backup holds more records than the live ledger, previous backup kept"
                );
            }
        }

        if let Some(parent) = self.backup_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::copy(&self.path, &self.backup_path).await?;
        tracing::info!(path = %self.backup_path.display(), "Ledger backup taken");
        Ok(())
    }
}
