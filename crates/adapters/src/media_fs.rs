//! Scratch-directory media store

use async_trait::async_trait;
use crossposter_domain::{LocalMedia, Media, MediaError, MediaKind, MediaStore};
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

const KEEP_FILE: &str = ".gitkeep";

/// Downloads attachments into a scratch directory that is emptied after each run
pub struct FsMediaStore {
    dir: PathBuf,
    client: Client,
}

impl FsMediaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self::with_client(dir, client)
    }

    pub fn with_client(dir: impl Into<PathBuf>, client: Client) -> Self {
        Self {
            dir: dir.into(),
            client,
        }
    }
}

/// Extension of the last path segment, ignoring any query string
fn extension(url: &str, kind: MediaKind) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            ext.to_ascii_lowercase()
        }
        _ => match kind {
            MediaKind::Image => "jpg".to_string(),
            MediaKind::Video => "mp4".to_string(),
        },
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn download(&self, media: &Media) -> Result<Vec<LocalMedia>, MediaError> {
        fs::create_dir_all(&self.dir).await?;
        let mut local = Vec::with_capacity(media.items.len());

        for item in &media.items {
            let download_err = |message: String| MediaError::Download {
                url: item.url.clone(),
                message,
            };

            let response = self
                .client
                .get(&item.url)
                .send()
                .await
                .map_err(|e| download_err(e.to_string()))?;
            if !response.status().is_success() {
                return Err(download_err(format!("status {}", response.status())));
            }

            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if media.kind == MediaKind::Video
                && !mime_type.as_deref().is_some_and(|m| m.starts_with("video/"))
            {
                return Err(MediaError::ContentType {
                    url: item.url.clone(),
                    content_type: mime_type.unwrap_or_default(),
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| download_err(e.to_string()))?;
            let path = self.dir.join(format!(
                "{}.{}",
                uuid::Uuid::new_v4().simple(),
                extension(&item.url, media.kind)
            ));
            fs::write(&path, &bytes).await?;
            tracing::debug!(url = %item.url, path = %path.display(), bytes = bytes.len(), "Media downloaded");

            local.push(LocalMedia {
                path,
                alt: item.alt.clone(),
                kind: media.kind,
                mime_type,
            });
        }

        Ok(local)
    }

    async fn cleanup(&self) -> Result<(), MediaError> {
        if !fs::try_exists(&self.dir).await? {
            return Ok(());
        }
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == KEEP_FILE || !entry.file_type().await?.is_file() {
                continue;
            }
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
        tracing::debug!(removed, "Media scratch directory cleaned");
        Ok(())
    }
}
