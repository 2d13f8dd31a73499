//! Mastodon API adapters
//!
//! One [`MastodonClient`] is built at startup and shared by the source and the
//! publisher so the account lookup happens once per run.

mod read;
mod write;

pub use read::MastodonPostSource;
pub use write::MastodonPublisher;

use std::sync::LazyLock;

use regex::Regex;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::http::{self, HttpError, RateLimitHeaders};

pub(crate) const RATE_LIMIT_HEADERS: RateLimitHeaders = RateLimitHeaders {
    limit: "x-ratelimit-limit",
    remaining: "x-ratelimit-remaining",
    reset: "x-ratelimit-reset",
};

/// Authenticated connection to one Mastodon instance
pub struct MastodonClient {
    client: Client,
    base_url: String,
    token: SecretString,
    handle: String,
    account: OnceCell<Account>,
}

impl MastodonClient {
    /// `base_url` is the instance root, e.g. `https://mastodon.social`
    pub fn new(base_url: impl Into<String>, handle: impl Into<String>, token: SecretString) -> Self {
        Self {
            client: http::build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            handle: handle.into(),
            account: OnceCell::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(format!("{}{}", self.base_url, path)))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.post(format!("{}{}", self.base_url, path)))
    }

    pub(crate) fn delete(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.delete(format!("{}{}", self.base_url, path)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.token.expose_secret())
    }

    /// The authenticated account, looked up once
    pub(crate) async fn account(&self) -> Result<&Account, HttpError> {
        self.account
            .get_or_try_init(|| async {
                let response = self.get("/api/v1/accounts/verify_credentials").send().await?;
                let response = http::check(response, RATE_LIMIT_HEADERS).await?;
                let account: Account = response.json().await?;
                tracing::info!(account_id = %account.id, acct = %account.acct, "Connected to Mastodon");
                Ok(account)
            })
            .await
    }

    /// Public URL of a status on this instance
    pub fn status_url(&self, status_id: &str) -> String {
        format!("{}/@{}/{}", self.base_url, self.handle, status_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Account {
    pub id: String,
    #[serde(default)]
    pub acct: String,
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<br\s*/?>").unwrap());

/// Plain text of a status body, keeping paragraph and line breaks
pub(crate) fn html_to_text(content: &str) -> String {
    let text = content.trim().trim_end_matches("</p>");
    let text = text.replace("<p>", "").replace("</p>", "\n\n");
    let text = BREAK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    unescape(&text)
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
