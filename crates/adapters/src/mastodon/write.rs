//! Mastodon publisher

use async_trait::async_trait;
use crossposter_domain::{
    LocalMedia, PublishError, PublishRequest, PublishResult, Publisher, SentRef, Service,
};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{MastodonClient, RATE_LIMIT_HEADERS};
use crate::http::{self, HttpError};

/// Posts statuses to Mastodon. Quotes have no native form there.
pub struct MastodonPublisher {
    client: Arc<MastodonClient>,
}

impl MastodonPublisher {
    pub fn new(client: Arc<MastodonClient>) -> Self {
        Self { client }
    }

    async fn upload(&self, media: &LocalMedia) -> Result<String, PublishError> {
        let bytes = tokio::fs::read(&media.path)
            .await
            .map_err(|e| PublishError::Media(format!("{}: {}", media.path.display(), e)))?;
        let file_name = media
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mut part = Part::bytes(bytes).file_name(file_name);
        if let Some(mime) = &media.mime_type {
            part = part
                .mime_str(mime)
                .map_err(|e| PublishError::Media(e.to_string()))?;
        }
        let mut form = Form::new().part("file", part);
        if !media.alt.is_empty() {
            form = form.text("description", media.alt.clone());
        }

        tracing::info!(path = %media.path.display(), "Uploading media to Mastodon");
        let response = self
            .client
            .post("/api/v2/media")
            .multipart(form)
            .send()
            .await
            .map_err(HttpError::from)?;
        let response = http::check(response, RATE_LIMIT_HEADERS).await?;
        let uploaded: MediaAttachment = response.json().await.map_err(HttpError::from)?;
        Ok(uploaded.id)
    }
}

#[derive(Serialize)]
struct CreateStatusRequest<'a> {
    status: &'a str,
    visibility: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_reply_to_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[derive(Deserialize)]
struct StatusResponse {
    id: String,
}

#[derive(Deserialize)]
struct MediaAttachment {
    id: String,
}

/// Mastodon answers 422 with an error body when it refuses a status outright
fn classify(error: HttpError) -> PublishError {
    match error {
        HttpError::Status { status: 422, body } if body.to_lowercase().contains("duplicate") => {
            PublishError::Duplicate(body)
        }
        other => other.into(),
    }
}

#[async_trait]
impl Publisher for MastodonPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
        let mut media_ids = Vec::with_capacity(request.media.len());
        for media in &request.media {
            media_ids.push(self.upload(media).await?);
        }

        let body = CreateStatusRequest {
            status: &request.text,
            visibility: request.visibility.as_str(),
            in_reply_to_id: request.reply_to.as_ref().map(|r| r.native_id.as_str()),
            media_ids,
            language: request.language.as_deref(),
        };

        tracing::info!(post_id = %request.source_id, "Posting to Mastodon");
        let response = self
            .client
            .post("/api/v1/statuses")
            .json(&body)
            .send()
            .await
            .map_err(HttpError::from)?;
        let rate_limit = http::rate_limit_status(response.headers(), RATE_LIMIT_HEADERS);
        let response = http::check(response, RATE_LIMIT_HEADERS)
            .await
            .map_err(classify)?;
        let status: StatusResponse = response.json().await.map_err(HttpError::from)?;

        Ok(PublishResult {
            native_id: status.id,
            reference: None,
            rate_limit,
        })
    }

    async fn repost(&self, target: &SentRef) -> Result<(), PublishError> {
        let response = self
            .client
            .post(&format!("/api/v1/statuses/{}/reblog", target.native_id))
            .send()
            .await
            .map_err(HttpError::from)?;
        http::check(response, RATE_LIMIT_HEADERS).await?;
        tracing::info!(status_id = %target.native_id, "Boosted status");
        Ok(())
    }

    async fn delete(&self, target: &SentRef) -> Result<(), PublishError> {
        let response = self
            .client
            .delete(&format!("/api/v1/statuses/{}", target.native_id))
            .send()
            .await
            .map_err(HttpError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!(status_id = %target.native_id, "Status already gone");
            return Ok(());
        }
        http::check(response, RATE_LIMIT_HEADERS).await?;
        tracing::info!(status_id = %target.native_id, "Deleted status");
        Ok(())
    }

    fn supports_quotes(&self) -> bool {
        false
    }

    fn post_url(&self, target: &SentRef) -> Option<String> {
        Some(self.client.status_url(&target.native_id))
    }

    fn service(&self) -> Service {
        Service::Mastodon
    }
}
