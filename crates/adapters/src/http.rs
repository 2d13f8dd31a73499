//! Shared HTTP plumbing for the service adapters

use crossposter_domain::{PostSourceError, PublishError, RateLimitStatus};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Header names a service uses to report its rate-limit window
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateLimitHeaders {
    pub limit: &'static str,
    pub remaining: &'static str,
    pub reset: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Rate limited until {0:?}")]
    RateLimited(Option<OffsetDateTime>),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            HttpError::Decode(e.to_string())
        } else {
            HttpError::Network(e.to_string())
        }
    }
}

impl From<HttpError> for PostSourceError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Network(msg) => PostSourceError::Network(msg),
            HttpError::Auth(msg) => PostSourceError::Auth(msg),
            HttpError::RateLimited(at) => PostSourceError::RateLimited(at),
            other => PostSourceError::Api(other.to_string()),
        }
    }
}

impl From<HttpError> for PublishError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Network(msg) => PublishError::Network(msg),
            HttpError::Auth(msg) => PublishError::Auth(msg),
            HttpError::RateLimited(resume_at) => PublishError::RateLimited { resume_at },
            other => PublishError::Api(other.to_string()),
        }
    }
}

pub(crate) fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("crossposter/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Reset time given either as unix seconds or as an RFC 3339 timestamp
pub(crate) fn parse_reset(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(seconds).ok();
    }
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn rate_limit_status(
    headers: &HeaderMap,
    names: RateLimitHeaders,
) -> Option<RateLimitStatus> {
    let limit = header_str(headers, names.limit)?.trim().parse().ok()?;
    let remaining = header_str(headers, names.remaining)?.trim().parse().ok()?;
    let reset_at = parse_reset(header_str(headers, names.reset)?)?;
    Some(RateLimitStatus {
        limit,
        remaining,
        reset_at,
    })
}

/// Turn non-success responses into errors, keeping the body for diagnosis
pub(crate) async fn check(response: Response, names: RateLimitHeaders) -> Result<Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset = header_str(response.headers(), names.reset).and_then(parse_reset);
        return Err(HttpError::RateLimited(reset));
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(HttpError::Auth(body));
    }
    Err(HttpError::Status {
        status: status.as_u16(),
        body,
    })
}
