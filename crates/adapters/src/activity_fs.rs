//! Recent-activity cache as `id;unix_timestamp` lines

use async_trait::async_trait;
use crossposter_domain::{ActivityRepo, StateError};
use std::path::PathBuf;
use time::OffsetDateTime;
use tokio::fs;

use crate::ledger_fs::write_atomic;

pub struct FsActivityRepo {
    path: PathBuf,
}

impl FsActivityRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn parse_line(line: &str) -> Option<(String, OffsetDateTime)> {
    let (id, ts) = line.trim().split_once(';')?;
    // older writers stored fractional seconds
    let seconds = ts.split('.').next()?.parse::<i64>().ok()?;
    let at = OffsetDateTime::from_unix_timestamp(seconds).ok()?;
    Some((id.to_string(), at))
}

#[async_trait]
impl ActivityRepo for FsActivityRepo {
    async fn load(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<(String, OffsetDateTime)>, StateError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(vec![]);
        }
        let contents = fs::read_to_string(&self.path).await?;
        let entries = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let parsed = parse_line(line);
                if parsed.is_none() {
                    tracing::warn!(line, "Skipping malformed cache line");
                }
                parsed
            })
            .filter(|(_, at)| *at > since)
            .collect::<Vec<_>>();
        tracing::debug!(entries = entries.len(), "Activity cache loaded");
        Ok(entries)
    }

    async fn save(&self, entries: &[(String, OffsetDateTime)]) -> Result<(), StateError> {
        if entries.is_empty() {
            if fs::try_exists(&self.path).await? {
                fs::remove_file(&self.path).await?;
            }
            return Ok(());
        }
        let contents: String = entries
            .iter()
            .map(|(id, at)| format!("{};{}\n", id, at.unix_timestamp()))
            .collect();
        write_atomic(&self.path, &contents).await
    }
}
