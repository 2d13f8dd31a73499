//! Bluesky publisher

use async_trait::async_trait;
use crossposter_domain::usecases::normalize::find_urls;
use crossposter_domain::{
    LocalMedia, MediaKind, PublishError, PublishRequest, PublishResult, Publisher, ReplyAudience,
    SentRef, Service,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{BlueskyClient, RATE_LIMIT_HEADERS, StrongRef, post_url, rkey};
use crate::http::{self, HttpError};

const POST_COLLECTION: &str = "app.bsky.feed.post";
const REPOST_COLLECTION: &str = "app.bsky.feed.repost";
const THREADGATE_COLLECTION: &str = "app.bsky.feed.threadgate";

pub struct BlueskyPublisher {
    client: Arc<BlueskyClient>,
}

impl BlueskyPublisher {
    pub fn new(client: Arc<BlueskyClient>) -> Self {
        Self { client }
    }

    async fn create_record<R: Serialize + Sync>(
        &self,
        collection: &str,
        rkey: Option<&str>,
        record: &R,
    ) -> Result<(CreatedRecord, Option<crossposter_domain::RateLimitStatus>), HttpError> {
        let repo = &self.client.session().await?.did;
        let response = self
            .client
            .post("com.atproto.repo.createRecord")
            .await?
            .json(&CreateRecordRequest {
                repo,
                collection,
                rkey,
                record,
            })
            .send()
            .await?;
        let rate_limit = http::rate_limit_status(response.headers(), RATE_LIMIT_HEADERS);
        let response = http::check(response, RATE_LIMIT_HEADERS).await?;
        Ok((response.json().await?, rate_limit))
    }

    async fn upload_blob(&self, media: &LocalMedia) -> Result<serde_json::Value, PublishError> {
        let bytes = tokio::fs::read(&media.path)
            .await
            .map_err(|e| PublishError::Media(format!("{}: {}", media.path.display(), e)))?;
        let mime = media.mime_type.clone().unwrap_or_else(|| match media.kind {
            MediaKind::Image => "image/jpeg".to_string(),
            MediaKind::Video => "video/mp4".to_string(),
        });

        tracing::info!(path = %media.path.display(), "Uploading blob to Bluesky");
        let response = self
            .client
            .post("com.atproto.repo.uploadBlob")
            .await?
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes)
            .send()
            .await
            .map_err(HttpError::from)?;
        let response = http::check(response, RATE_LIMIT_HEADERS).await?;
        let uploaded: UploadBlobResponse = response.json().await.map_err(HttpError::from)?;
        Ok(uploaded.blob)
    }

    /// Parent and thread root for a reply to `parent`
    async fn reply_refs(&self, parent: &SentRef) -> Result<ReplyRefs, PublishError> {
        let parent = strong_ref(parent)?;
        let response = self
            .client
            .get("app.bsky.feed.getPosts")
            .await?
            .query(&[("uris", parent.uri.as_str())])
            .send()
            .await
            .map_err(HttpError::from)?;
        let response = http::check(response, RATE_LIMIT_HEADERS).await?;
        let found: GetPostsResponse = response.json().await.map_err(HttpError::from)?;
        let root = found
            .posts
            .into_iter()
            .next()
            .and_then(|p| p.record.reply)
            .map(|r| r.root)
            .unwrap_or_else(|| parent.clone());
        Ok(ReplyRefs { root, parent })
    }

    async fn media_embed(&self, media: &[LocalMedia]) -> Result<Option<MediaEmbed>, PublishError> {
        let Some(first) = media.first() else {
            return Ok(None);
        };
        if first.kind == MediaKind::Video {
            let video = self.upload_blob(first).await?;
            return Ok(Some(MediaEmbed::Video {
                video,
                alt: first.alt.clone(),
            }));
        }
        let mut images = Vec::with_capacity(media.len());
        for item in media {
            images.push(ImageEmbed {
                image: self.upload_blob(item).await?,
                alt: item.alt.clone(),
            });
        }
        Ok(Some(MediaEmbed::Images { images }))
    }
}

fn strong_ref(sent: &SentRef) -> Result<StrongRef, PublishError> {
    let uri = sent
        .reference
        .clone()
        .ok_or_else(|| PublishError::Api(format!("No AT uri recorded for {}", sent.native_id)))?;
    Ok(StrongRef {
        uri,
        cid: sent.native_id.clone(),
    })
}

fn now_rfc3339() -> Result<String, PublishError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| PublishError::Api(e.to_string()))
}

/// Link facets so URLs render as links
fn link_facets(text: &str) -> Vec<FacetOut> {
    let mut facets = vec![];
    let mut cursor = 0;
    for url in find_urls(text) {
        let Some(offset) = text[cursor..].find(&url) else {
            continue;
        };
        let start = cursor + offset;
        let end = start + url.len();
        facets.push(FacetOut {
            index: ByteSlice {
                byte_start: start,
                byte_end: end,
            },
            features: vec![LinkFeature {
                kind: "app.bsky.richtext.facet#link",
                uri: url,
            }],
        });
        cursor = end;
    }
    facets
}

fn threadgate_rules(audience: ReplyAudience) -> Vec<ThreadgateRule> {
    let kind = match audience {
        ReplyAudience::All | ReplyAudience::Nobody => return vec![],
        ReplyAudience::Following => "app.bsky.feed.threadgate#followingRule",
        ReplyAudience::Mentioned => "app.bsky.feed.threadgate#mentionRule",
    };
    vec![ThreadgateRule { kind }]
}

#[derive(Serialize)]
struct CreateRecordRequest<'a, R> {
    repo: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rkey: Option<&'a str>,
    record: &'a R,
}

#[derive(Deserialize)]
struct CreatedRecord {
    uri: String,
    cid: String,
}

#[derive(Deserialize)]
struct UploadBlobResponse {
    blob: serde_json::Value,
}

#[derive(Deserialize)]
struct GetPostsResponse {
    posts: Vec<PostView>,
}

#[derive(Deserialize)]
struct PostView {
    record: PostViewRecord,
}

#[derive(Deserialize)]
struct PostViewRecord {
    reply: Option<ReplyRefs>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyRefs {
    root: StrongRef,
    parent: StrongRef,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostRecordOut<'a> {
    #[serde(rename = "$type")]
    kind: &'static str,
    text: &'a str,
    created_at: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    langs: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    facets: Vec<FacetOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<ReplyRefs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embed: Option<EmbedOut>,
}

#[derive(Serialize)]
struct FacetOut {
    index: ByteSlice,
    features: Vec<LinkFeature>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ByteSlice {
    byte_start: usize,
    byte_end: usize,
}

#[derive(Serialize)]
struct LinkFeature {
    #[serde(rename = "$type")]
    kind: &'static str,
    uri: String,
}

#[derive(Serialize)]
struct ImageEmbed {
    image: serde_json::Value,
    alt: String,
}

#[derive(Serialize)]
#[serde(tag = "$type")]
enum MediaEmbed {
    #[serde(rename = "app.bsky.embed.images")]
    Images { images: Vec<ImageEmbed> },
    #[serde(rename = "app.bsky.embed.video")]
    Video { video: serde_json::Value, alt: String },
}

#[derive(Serialize)]
#[serde(tag = "$type")]
enum EmbedOut {
    #[serde(rename = "app.bsky.embed.images")]
    Images { images: Vec<ImageEmbed> },
    #[serde(rename = "app.bsky.embed.video")]
    Video { video: serde_json::Value, alt: String },
    #[serde(rename = "app.bsky.embed.record")]
    Record { record: StrongRef },
    #[serde(rename = "app.bsky.embed.recordWithMedia")]
    RecordWithMedia { record: RecordEmbed, media: MediaEmbed },
}

#[derive(Serialize)]
struct RecordEmbed {
    record: StrongRef,
}

impl From<MediaEmbed> for EmbedOut {
    fn from(media: MediaEmbed) -> Self {
        match media {
            MediaEmbed::Images { images } => EmbedOut::Images { images },
            MediaEmbed::Video { video, alt } => EmbedOut::Video { video, alt },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepostRecord {
    #[serde(rename = "$type")]
    kind: &'static str,
    subject: StrongRef,
    created_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadgateRecord {
    #[serde(rename = "$type")]
    kind: &'static str,
    post: String,
    allow: Vec<ThreadgateRule>,
    created_at: String,
}

#[derive(Serialize)]
struct ThreadgateRule {
    #[serde(rename = "$type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct DeleteRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
}

#[async_trait]
impl Publisher for BlueskyPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
        let reply = match &request.reply_to {
            Some(parent) => Some(self.reply_refs(parent).await?),
            None => None,
        };
        let quote = request.quote_of.as_ref().map(strong_ref).transpose()?;
        let media = self.media_embed(&request.media).await?;
        let embed = match (quote, media) {
            (None, None) => None,
            (Some(record), None) => Some(EmbedOut::Record { record }),
            (None, Some(media)) => Some(media.into()),
            (Some(record), Some(media)) => Some(EmbedOut::RecordWithMedia {
                record: RecordEmbed { record },
                media,
            }),
        };

        let record = PostRecordOut {
            kind: POST_COLLECTION,
            text: &request.text,
            created_at: now_rfc3339()?,
            langs: request.language.as_deref().into_iter().collect(),
            facets: link_facets(&request.text),
            reply,
            embed,
        };

        tracing::info!(post_id = %request.source_id, "Posting to Bluesky");
        let (created, rate_limit) = self.create_record(POST_COLLECTION, None, &record).await?;
        Ok(PublishResult {
            native_id: created.cid,
            reference: Some(created.uri),
            rate_limit,
        })
    }

    async fn repost(&self, target: &SentRef) -> Result<(), PublishError> {
        let record = RepostRecord {
            kind: REPOST_COLLECTION,
            subject: strong_ref(target)?,
            created_at: now_rfc3339()?,
        };
        self.create_record(REPOST_COLLECTION, None, &record).await?;
        tracing::info!(cid = %target.native_id, "Reposted on Bluesky");
        Ok(())
    }

    async fn delete(&self, target: &SentRef) -> Result<(), PublishError> {
        let target = strong_ref(target)?;
        let repo = &self.client.session().await?.did;
        let response = self
            .client
            .post("com.atproto.repo.deleteRecord")
            .await?
            .json(&DeleteRecordRequest {
                repo,
                collection: POST_COLLECTION,
                rkey: rkey(&target.uri),
            })
            .send()
            .await
            .map_err(HttpError::from)?;
        http::check(response, RATE_LIMIT_HEADERS).await?;
        tracing::info!(uri = %target.uri, "Deleted post from Bluesky");
        Ok(())
    }

    async fn restrict_replies(
        &self,
        target: &SentRef,
        audience: ReplyAudience,
    ) -> Result<(), PublishError> {
        if audience == ReplyAudience::All {
            return Ok(());
        }
        let target = strong_ref(target)?;
        let record = ThreadgateRecord {
            kind: THREADGATE_COLLECTION,
            post: target.uri.clone(),
            allow: threadgate_rules(audience),
            created_at: now_rfc3339()?,
        };
        self.create_record(THREADGATE_COLLECTION, Some(rkey(&target.uri)), &record)
            .await?;
        tracing::info!(uri = %target.uri, audience = ?audience, "Threadgate set");
        Ok(())
    }

    fn post_url(&self, target: &SentRef) -> Option<String> {
        target
            .reference
            .as_deref()
            .map(|uri| post_url(self.client.handle(), uri))
    }

    fn service(&self) -> Service {
        Service::Bluesky
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossposter_domain::Visibility;
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const ME: &str = "me.bsky.social";

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": "jwt",
                "did": "did:plc:me",
                "handle": ME
            })))
            .mount(server)
            .await;
    }

    fn publisher(server: &MockServer) -> BlueskyPublisher {
        BlueskyPublisher::new(Arc::new(BlueskyClient::new(
            server.uri(),
            ME,
            SecretString::new("app-password".into()),
        )))
    }

    fn sent(cid: &str, rkey: &str) -> SentRef {
        SentRef {
            native_id: cid.to_string(),
            reference: Some(format!("at://did:plc:me/app.bsky.feed.post/{}", rkey)),
        }
    }

    fn request(text: &str) -> PublishRequest {
        PublishRequest {
            source_id: "100".to_string(),
            text: text.to_string(),
            reply_to: None,
            quote_of: None,
            media: vec![],
            visibility: Visibility::Public,
            reply_audience: ReplyAudience::All,
            language: Some("en".to_string()),
        }
    }

    fn record_body(req: &Request) -> Value {
        serde_json::from_slice::<Value>(&req.body).unwrap()["record"].clone()
    }

    #[tokio::test]
    async fn test_publish_with_link_facet() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"repo": "did:plc:me", "collection": "app.bsky.feed.post"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ratelimit-limit", "5000")
                    .insert_header("ratelimit-remaining", "100")
                    .insert_header("ratelimit-reset", "1714564800")
                    .set_body_json(json!({"uri": "at://did:plc:me/app.bsky.feed.post/abc", "cid": "cidabc"})),
            )
            .mount(&server)
            .await;

        let result = publisher(&server)
            .publish(&request("read https://example.com/x"))
            .await
            .unwrap();

        assert_eq!(result.native_id, "cidabc");
        assert_eq!(result.reference.as_deref(), Some("at://did:plc:me/app.bsky.feed.post/abc"));
        assert!(result.rate_limit.unwrap().remaining_percent() < 5.0);

        let requests = server.received_requests().await.unwrap();
        let record = record_body(requests.last().unwrap());
        assert_eq!(record["text"], "read https://example.com/x");
        assert_eq!(record["langs"], json!(["en"]));
        assert_eq!(record["facets"][0]["index"], json!({"byteStart": 5, "byteEnd": 26}));
        assert_eq!(record["facets"][0]["features"][0]["uri"], "https://example.com/x");
    }

    #[tokio::test]
    async fn test_reply_uses_thread_root() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getPosts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "posts": [{
                    "uri": "at://did:plc:me/app.bsky.feed.post/p",
                    "cid": "cidp",
                    "record": {
                        "text": "parent",
                        "reply": {
                            "root": {"uri": "at://did:plc:me/app.bsky.feed.post/r", "cid": "cidr"},
                            "parent": {"uri": "at://did:plc:me/app.bsky.feed.post/r", "cid": "cidr"}
                        }
                    }
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uri": "at://did:plc:me/app.bsky.feed.post/c", "cid": "cidc"})))
            .mount(&server)
            .await;

        let mut req = request("child");
        req.reply_to = Some(sent("cidp", "p"));
        req.quote_of = Some(sent("cidq", "q"));
        publisher(&server).publish(&req).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let record = record_body(requests.last().unwrap());
        assert_eq!(record["reply"]["root"]["cid"], "cidr");
        assert_eq!(record["reply"]["parent"]["cid"], "cidp");
        assert_eq!(record["embed"]["$type"], "app.bsky.embed.record");
        assert_eq!(record["embed"]["record"]["uri"], "at://did:plc:me/app.bsky.feed.post/q");
    }

    #[tokio::test]
    async fn test_publish_images() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.uploadBlob"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "blob": {"$type": "blob", "ref": {"$link": "bafy"}, "mimeType": "image/png", "size": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uri": "at://did:plc:me/app.bsky.feed.post/i", "cid": "cidi"})))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, [1u8, 2, 3]).unwrap();

        let mut req = request("pic");
        req.media = vec![LocalMedia {
            path: file,
            alt: "a cat".to_string(),
            kind: MediaKind::Image,
            mime_type: Some("image/png".to_string()),
        }];
        publisher(&server).publish(&req).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let record = record_body(requests.last().unwrap());
        assert_eq!(record["embed"]["$type"], "app.bsky.embed.images");
        assert_eq!(record["embed"]["images"][0]["alt"], "a cat");
        assert_eq!(record["embed"]["images"][0]["image"]["ref"]["$link"], "bafy");
    }

    #[tokio::test]
    async fn test_restrict_replies_creates_threadgate() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({
                "collection": "app.bsky.feed.threadgate",
                "rkey": "abc",
                "record": {
                    "post": "at://did:plc:me/app.bsky.feed.post/abc",
                    "allow": [{"$type": "app.bsky.feed.threadgate#followingRule"}]
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uri": "at://did:plc:me/app.bsky.feed.threadgate/abc", "cid": "g"})))
            .expect(1)
            .mount(&server)
            .await;

        publisher(&server)
            .restrict_replies(&sent("cidabc", "abc"), ReplyAudience::Following)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_by_rkey() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(body_partial_json(json!({"repo": "did:plc:me", "collection": "app.bsky.feed.post", "rkey": "abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        publisher(&server).delete(&sent("cidabc", "abc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_without_uri_fails() {
        let server = MockServer::start().await;
        let target = SentRef {
            native_id: "cid".to_string(),
            reference: None,
        };
        assert!(publisher(&server).delete(&target).await.is_err());
    }

    #[test]
    fn test_link_facets_repeated_urls() {
        let facets = link_facets("a https://x.example b https://x.example");
        assert_eq!(facets.len(), 2);
        assert_eq!(facets[1].index.byte_start, 22);
    }
}
