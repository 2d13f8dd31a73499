//! Twitter publisher for creating, retweeting and deleting tweets

use async_trait::async_trait;
use crossposter_domain::{
    LocalMedia, MediaKind, PublishError, PublishRequest, PublishResult, Publisher, ReplyAudience,
    SentRef, Service,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{DEFAULT_BASE_URL, RATE_LIMIT_HEADERS, clip_alt};
use crate::http::{self, HttpError};

/// Twitter API v2 publisher
pub struct TwitterPublisher {
    client: Client,
    user_token: SecretString,
    base_url: String,
    /// Retweeting needs a paid API tier
    retweets: bool,
    user_id: OnceCell<String>,
}

impl TwitterPublisher {
    pub fn new(user_token: SecretString, retweets: bool) -> Self {
        Self::with_base_url(user_token, DEFAULT_BASE_URL.to_string(), retweets)
    }

    pub fn with_base_url(user_token: SecretString, base_url: String, retweets: bool) -> Self {
        Self {
            client: http::build_client(),
            user_token,
            base_url: base_url.trim_end_matches('/').to_string(),
            retweets,
            user_id: OnceCell::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(self.user_token.expose_secret())
    }

    async fn user_id(&self) -> Result<&str, HttpError> {
        self.user_id
            .get_or_try_init(|| async {
                let response = self.request(reqwest::Method::GET, "/2/users/me").send().await?;
                let response = http::check(response, RATE_LIMIT_HEADERS).await?;
                let me: DataResponse<IdData> = response.json().await?;
                Ok(me.data.id)
            })
            .await
            .map(String::as_str)
    }

    async fn upload(&self, media: &LocalMedia) -> Result<String, PublishError> {
        let bytes = tokio::fs::read(&media.path)
            .await
            .map_err(|e| PublishError::Media(format!("{}: {}", media.path.display(), e)))?;
        let category = match media.kind {
            MediaKind::Image => "tweet_image",
            MediaKind::Video => "tweet_video",
        };
        let mut part = Part::bytes(bytes).file_name(
            media
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string()),
        );
        if let Some(mime) = &media.mime_type {
            part = part
                .mime_str(mime)
                .map_err(|e| PublishError::Media(e.to_string()))?;
        }
        let form = Form::new()
            .part("media", part)
            .text("media_category", category);

        tracing::info!(path = %media.path.display(), "Uploading media to Twitter");
        let response = self
            .request(reqwest::Method::POST, "/2/media/upload")
            .multipart(form)
            .send()
            .await
            .map_err(HttpError::from)?;
        let response = http::check(response, RATE_LIMIT_HEADERS).await?;
        let uploaded: DataResponse<IdData> = response.json().await.map_err(HttpError::from)?;
        let media_id = uploaded.data.id;

        if !media.alt.is_empty() {
            let alt = clip_alt(&media.alt);
            let body = MediaMetadataRequest {
                id: &media_id,
                metadata: MediaMetadata {
                    alt_text: AltText { text: &alt },
                },
            };
            let response = self
                .request(reqwest::Method::POST, "/2/media/metadata")
                .json(&body)
                .send()
                .await
                .map_err(HttpError::from)?;
            http::check(response, RATE_LIMIT_HEADERS).await?;
        }
        Ok(media_id)
    }
}

#[derive(Serialize)]
struct CreateTweetRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<ReplySettings<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote_tweet_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media: Option<MediaIds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_settings: Option<&'static str>,
}

#[derive(Serialize)]
struct ReplySettings<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[derive(Serialize)]
struct MediaIds {
    media_ids: Vec<String>,
}

#[derive(Serialize)]
struct RetweetRequest<'a> {
    tweet_id: &'a str,
}

#[derive(Serialize)]
struct MediaMetadataRequest<'a> {
    id: &'a str,
    metadata: MediaMetadata<'a>,
}

#[derive(Serialize)]
struct MediaMetadata<'a> {
    alt_text: AltText<'a>,
}

#[derive(Serialize)]
struct AltText<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct IdData {
    id: String,
}

fn reply_settings(audience: ReplyAudience) -> Option<&'static str> {
    match audience {
        ReplyAudience::All => None,
        ReplyAudience::Following => Some("following"),
        ReplyAudience::Mentioned | ReplyAudience::Nobody => Some("mentionedUsers"),
    }
}

/// Twitter refuses repeated text with 403 and a "duplicate content" detail
fn classify(error: HttpError) -> PublishError {
    match error {
        HttpError::Status { status: 403, body } if body.to_lowercase().contains("duplicate") => {
            PublishError::Duplicate(body)
        }
        other => other.into(),
    }
}

#[async_trait]
impl Publisher for TwitterPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
        let mut media_ids = Vec::with_capacity(request.media.len());
        for media in &request.media {
            media_ids.push(self.upload(media).await?);
        }

        let body = CreateTweetRequest {
            text: &request.text,
            reply: request.reply_to.as_ref().map(|r| ReplySettings {
                in_reply_to_tweet_id: &r.native_id,
            }),
            quote_tweet_id: request.quote_of.as_ref().map(|q| q.native_id.as_str()),
            media: (!media_ids.is_empty()).then_some(MediaIds { media_ids }),
            reply_settings: reply_settings(request.reply_audience),
        };

        tracing::info!(post_id = %request.source_id, "Posting to Twitter");
        let response = self
            .request(reqwest::Method::POST, "/2/tweets")
            .json(&body)
            .send()
            .await
            .map_err(HttpError::from)?;
        let rate_limit = http::rate_limit_status(response.headers(), RATE_LIMIT_HEADERS);
        let response = http::check(response, RATE_LIMIT_HEADERS)
            .await
            .map_err(classify)?;
        let created: DataResponse<IdData> = response.json().await.map_err(HttpError::from)?;

        Ok(PublishResult {
            native_id: created.data.id,
            reference: None,
            rate_limit,
        })
    }

    async fn repost(&self, target: &SentRef) -> Result<(), PublishError> {
        let user_id = self.user_id().await?;
        let response = self
            .request(reqwest::Method::POST, &format!("/2/users/{}/retweets", user_id))
            .json(&RetweetRequest {
                tweet_id: &target.native_id,
            })
            .send()
            .await
            .map_err(HttpError::from)?;
        http::check(response, RATE_LIMIT_HEADERS).await?;
        tracing::info!(tweet_id = %target.native_id, "Retweeted");
        Ok(())
    }

    async fn delete(&self, target: &SentRef) -> Result<(), PublishError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/2/tweets/{}", target.native_id),
            )
            .send()
            .await
            .map_err(HttpError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!(tweet_id = %target.native_id, "Tweet does not exist");
            return Ok(());
        }
        http::check(response, RATE_LIMIT_HEADERS).await?;
        tracing::info!(tweet_id = %target.native_id, "Deleted tweet");
        Ok(())
    }

    fn supports_reposts(&self) -> bool {
        self.retweets
    }

    fn post_url(&self, target: &SentRef) -> Option<String> {
        Some(format!("https://x.com/i/status/{}", target.native_id))
    }

    fn service(&self) -> Service {
        Service::Twitter
    }
}
