//! Cross-run cooldown stored as a single unix timestamp

use async_trait::async_trait;
use crossposter_domain::{RateLimitGate, StateError};
use std::path::PathBuf;
use time::OffsetDateTime;
use tokio::fs;

use crate::ledger_fs::write_atomic;

pub struct FsRateLimitGate {
    path: PathBuf,
}

impl FsRateLimitGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RateLimitGate for FsRateLimitGate {
    async fn active_until(
        &self,
        now: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, StateError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path).await?;
        let resume_at = contents
            .trim()
            .split('.')
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok());

        match resume_at {
            Some(at) if at > now => Ok(Some(at)),
            Some(_) => {
                tracing::info!("Rate limit cooldown expired");
                fs::remove_file(&self.path).await?;
                Ok(None)
            }
            None => {
                tracing::warn!(path = %self.path.display(), "Unreadable rate limit file, removing");
                fs::remove_file(&self.path).await?;
                Ok(None)
            }
        }
    }

    async fn pause_until(&self, resume_at: OffsetDateTime) -> Result<(), StateError> {
        tracing::warn!(resume_at = %resume_at, "Pausing until rate limit resets");
        write_atomic(&self.path, &resume_at.unix_timestamp().to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::Duration;

    #[tokio::test]
    async fn test_pause_then_active() {
        let dir = TempDir::new().unwrap();
        let gate = FsRateLimitGate::new(dir.path().join("ratelimit"));
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        assert_eq!(gate.active_until(now).await.unwrap(), None);
        gate.pause_until(now + Duration::minutes(15)).await.unwrap();

        assert_eq!(
            gate.active_until(now).await.unwrap(),
            Some(now + Duration::minutes(15))
        );
    }

    #[tokio::test]
    async fn test_expired_cooldown_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ratelimit");
        std::fs::write(&path, "1699999000").unwrap();
        let gate = FsRateLimitGate::new(&path);

        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(gate.active_until(now).await.unwrap(), None);
        assert!(!path.exists());
    }
}
