//! Outbox publisher for dry runs.
//!
//! Every publish, repost and delete is appended to a JSONL file instead of
//! reaching the destination.

use async_trait::async_trait;
use crossposter_domain::ports::{PublishError, PublishRequest, PublishResult, Publisher};
use crossposter_domain::{ReplyAudience, SentRef, Service};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Shared append-only JSONL file
#[derive(Debug, Clone)]
pub struct OutboxWriter {
    path: PathBuf,
    file: Arc<Mutex<tokio::fs::File>>,
}

impl OutboxWriter {
    pub async fn new(path: PathBuf) -> Result<Self, OutboxError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: &OutboxEntry<'_>) -> Result<(), OutboxError> {
        let line = serde_json::to_string(entry)?;
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// Stands in for one destination and records what would have been sent
#[derive(Debug, Clone)]
pub struct OutboxPublisher {
    writer: OutboxWriter,
    service: Service,
    quotes: bool,
    reposts: bool,
}

impl OutboxPublisher {
    /// Outbox with the same quote and repost capabilities as the real `service` adapter
    pub fn new(writer: OutboxWriter, service: Service) -> Self {
        Self {
            writer,
            service,
            quotes: service != Service::Mastodon,
            reposts: service != Service::Twitter,
        }
    }

    async fn write(&self, entry: OutboxEntry<'_>) -> Result<(), PublishError> {
        self.writer
            .append(&entry)
            .await
            .map_err(|error| PublishError::Api(format!("Outbox write failed: {}", error)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Publish,
    Repost,
    Delete,
    RestrictReplies,
}

#[derive(Serialize)]
struct OutboxEntry<'a> {
    service: Service,
    action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_post_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    native_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote_of: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    visibility: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_audience: Option<ReplyAudience>,
}

impl<'a> OutboxEntry<'a> {
    fn new(service: Service, action: Action) -> Self {
        Self {
            service,
            action,
            source_post_id: None,
            native_id: None,
            text: None,
            reply_to: None,
            quote_of: None,
            media: vec![],
            visibility: None,
            reply_audience: None,
        }
    }
}

#[async_trait]
impl Publisher for OutboxPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
        let native_id = Uuid::new_v4().to_string();
        let entry = OutboxEntry {
            source_post_id: Some(&request.source_id),
            native_id: Some(&native_id),
            text: Some(&request.text),
            reply_to: request.reply_to.as_ref().map(|r| r.native_id.as_str()),
            quote_of: request.quote_of.as_ref().map(|r| r.native_id.as_str()),
            media: request
                .media
                .iter()
                .map(|m| m.path.display().to_string())
                .collect(),
            visibility: Some(request.visibility.as_str()),
            ..OutboxEntry::new(self.service, Action::Publish)
        };
        self.write(entry).await?;

        Ok(PublishResult {
            native_id,
            reference: None,
            rate_limit: None,
        })
    }

    async fn repost(&self, target: &SentRef) -> Result<(), PublishError> {
        self.write(OutboxEntry {
            native_id: Some(&target.native_id),
            ..OutboxEntry::new(self.service, Action::Repost)
        })
        .await
    }

    async fn delete(&self, target: &SentRef) -> Result<(), PublishError> {
        self.write(OutboxEntry {
            native_id: Some(&target.native_id),
            ..OutboxEntry::new(self.service, Action::Delete)
        })
        .await
    }

    async fn restrict_replies(
        &self,
        target: &SentRef,
        audience: ReplyAudience,
    ) -> Result<(), PublishError> {
        self.write(OutboxEntry {
            native_id: Some(&target.native_id),
            reply_audience: Some(audience),
            ..OutboxEntry::new(self.service, Action::RestrictReplies)
        })
        .await
    }

    fn supports_quotes(&self) -> bool {
        self.quotes
    }

    fn supports_reposts(&self) -> bool {
        self.reposts
    }

    fn post_url(&self, target: &SentRef) -> Option<String> {
        Some(format!("outbox://{}/{}", self.service, target.native_id))
    }

    fn service(&self) -> Service {
        self.service
    }
}
