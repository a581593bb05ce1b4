// src/coordinator/finalize.rs
//! Copy a finished task's outputs from provider CDNs into the bucket.

use crate::store::backend::ObjectStore;
use crate::store::StoreError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, String>;
}

/// Downloads over HTTP with the long media timeout.
#[derive(Clone)]
pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build media client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("download failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("download returned {}", response.status()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("download body failed: {}", e))?;

        Ok(FetchedMedia {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub folder: String,
    pub archived: usize,
    pub skipped: usize,
}

pub fn folder_for(task_id: &str) -> String {
    format!("media/{}", task_id)
}

/// Download every URL and store it as `media/<task_id>/NN.<ext>`. A URL that
/// cannot be downloaded is skipped; a bucket write failure aborts.
pub async fn archive_outputs(
    bucket: &dyn ObjectStore,
    fetcher: &dyn MediaFetcher,
    task_id: &str,
    urls: &[String],
) -> Result<ArchiveReport, StoreError> {
    let folder = folder_for(task_id);
    let mut archived = 0;
    let mut skipped = 0;

    for (index, url) in urls.iter().enumerate() {
        let media = match fetcher.fetch(url).await {
            Ok(media) if !media.bytes.is_empty() => media,
            Ok(_) => {
                warn!(task_id, url = %url, "empty download, skipping");
                skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(task_id, url = %url, error = %e, "could not download output, skipping");
                skipped += 1;
                continue;
            }
        };

        let extension = extension_for(url, media.content_type.as_deref());
        let key = format!("{}/{:02}.{}", folder, index + 1, extension);
        let content_type = media
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let size = media.bytes.len();
        bucket.put(&key, media.bytes, &content_type).await?;
        info!(task_id, key = %key, bytes = size, "archived output");
        archived += 1;
    }

    Ok(ArchiveReport {
        folder,
        archived,
        skipped,
    })
}

fn extension_for(url: &str, content_type: Option<&str>) -> String {
    let from_type = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .and_then(|ct| match ct.as_str() {
            "image/png" => Some("png"),
            "image/jpeg" | "image/jpg" => Some("jpg"),
            "image/webp" => Some("webp"),
            "image/gif" => Some("gif"),
            "video/mp4" => Some("mp4"),
            "video/webm" => Some("webm"),
            _ => None,
        });
    if let Some(ext) = from_type {
        return ext.to_string();
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}
