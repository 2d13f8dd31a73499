//! Bluesky (AT Protocol) adapters over plain XRPC
//!
//! [`BlueskyClient`] owns the session and is shared by the source and the
//! publisher. Posts are addressed by CID in the ledger; the AT uri travels
//! alongside as the reference.

mod read;
mod write;

pub use read::BlueskyPostSource;
pub use write::BlueskyPublisher;

use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::http::{self, HttpError, RateLimitHeaders};

pub(crate) const RATE_LIMIT_HEADERS: RateLimitHeaders = RateLimitHeaders {
    limit: "ratelimit-limit",
    remaining: "ratelimit-remaining",
    reset: "ratelimit-reset",
};

const APP_URL: &str = "https://bsky.app";

/// Connection to a PDS, logged in lazily with an app password
pub struct BlueskyClient {
    client: Client,
    base_url: String,
    handle: String,
    password: SecretString,
    session: OnceCell<Session>,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub access_jwt: SecretString,
    pub did: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    did: String,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

impl BlueskyClient {
    /// `base_url` is the PDS root, e.g. `https://bsky.social`
    pub fn new(base_url: impl Into<String>, handle: impl Into<String>, password: SecretString) -> Self {
        Self {
            client: http::build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            handle: handle.into(),
            password,
            session: OnceCell::new(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub(crate) fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.base_url, method)
    }

    pub(crate) async fn session(&self) -> Result<&Session, HttpError> {
        self.session
            .get_or_try_init(|| async {
                tracing::info!(pds = %self.base_url, handle = %self.handle, "Connecting to Bluesky");
                let response = self
                    .client
                    .post(self.xrpc_url("com.atproto.server.createSession"))
                    .json(&CreateSessionRequest {
                        identifier: &self.handle,
                        password: self.password.expose_secret(),
                    })
                    .send()
                    .await?;
                let response = http::check(response, RATE_LIMIT_HEADERS).await?;
                let created: SessionResponse = response.json().await?;
                tracing::info!(did = %created.did, "Logged in to Bluesky");
                Ok(Session {
                    access_jwt: SecretString::new(created.access_jwt.into()),
                    did: created.did,
                })
            })
            .await
    }

    pub(crate) async fn get(&self, method: &str) -> Result<RequestBuilder, HttpError> {
        let session = self.session().await?;
        Ok(self
            .client
            .get(self.xrpc_url(method))
            .bearer_auth(session.access_jwt.expose_secret()))
    }

    pub(crate) async fn post(&self, method: &str) -> Result<RequestBuilder, HttpError> {
        let session = self.session().await?;
        Ok(self
            .client
            .post(self.xrpc_url(method))
            .bearer_auth(session.access_jwt.expose_secret()))
    }

    /// Public URL of a blob on this PDS
    pub(crate) fn blob_url(&self, did: &str, cid: &str) -> String {
        format!(
            "{}?did={}&cid={}",
            self.xrpc_url("com.atproto.sync.getBlob"),
            did,
            cid
        )
    }
}

/// Record key: the last path segment of an AT uri
pub(crate) fn rkey(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// Web URL of a post
pub(crate) fn post_url(actor: &str, uri: &str) -> String {
    format!("{}/profile/{}/post/{}", APP_URL, actor, rkey(uri))
}

pub(crate) fn profile_url(actor: &str) -> String {
    format!("{}/profile/{}", APP_URL, actor)
}

/// Strong reference to a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let uri = "at://did:plc:abc/app.bsky.feed.post/3kxyz";
        assert_eq!(rkey(uri), "3kxyz");
        assert_eq!(post_url("me.bsky.social", uri), "https://bsky.app/profile/me.bsky.social/post/3kxyz");
        assert_eq!(profile_url("did:plc:abc"), "https://bsky.app/profile/did:plc:abc");
    }
}
