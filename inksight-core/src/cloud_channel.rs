//! Channel B: the cloud HTTPS API, reached when the tablet itself is not
//! reachable over SSH.
//!
//! Built on `reqwest`, with a single `Client` constructed once and reused
//! for connection pooling rather than built fresh per request. The storage
//! endpoint is resolved once on `authenticate` and cached for the lifetime
//! of the channel, separating auth from storage discovery. A document is
//! fetched as a signed blob URL pointing at a zip archive bundling its
//! `metadata`, `content`, and per-page stroke records, rather than as
//! separate REST members.

use crate::error::{CoreError, Result};
use crate::model::DocumentSummary;
use crate::source::DocumentSource;
use async_trait::async_trait;
use serde::Deserialize;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CloudChannelConfig {
    pub base_url: String,
    /// Long-lived device registration token exchanged for a bearer token.
    pub device_token: String,
    pub request_timeout: Duration,
}

impl CloudChannelConfig {
    pub fn new(base_url: impl Into<String>, device_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            device_token: device_token.into(),
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "bearerToken")]
    bearer_token: String,
}

#[derive(Debug, Deserialize)]
struct StorageDiscoveryResponse {
    #[serde(rename = "storageUrl")]
    storage_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudDocumentSummary {
    pub id: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct BlobUrlResponse {
    url: String,
}

pub struct CloudChannel {
    config: CloudChannelConfig,
    client: reqwest::Client,
    bearer_token: RwLock<Option<String>>,
    storage_endpoint: RwLock<Option<String>>,
}

impl CloudChannel {
    pub fn new(config: CloudChannelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            config,
            client,
            bearer_token: RwLock::new(None),
            storage_endpoint: RwLock::new(None),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.bearer_token.read().await.is_some()
    }

    /// Exchanges the device token for a bearer token, then resolves and
    /// caches the storage endpoint. Both are no-ops on subsequent calls
    /// unless the cache was cleared.
    pub async fn authenticate(&self) -> Result<()> {
        let auth: AuthResponse = self
            .client
            .post(format!("{}/auth", self.config.base_url))
            .json(&serde_json::json!({ "deviceToken": self.config.device_token }))
            .send()
            .await
            .map_err(|e| CoreError::AuthenticationError(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::AuthenticationError(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::AuthenticationError(e.to_string()))?;

        *self.bearer_token.write().await = Some(auth.bearer_token.clone());

        let discovery: StorageDiscoveryResponse = self
            .client
            .get(format!("{}/discovery/storage", self.config.base_url))
            .bearer_auth(&auth.bearer_token)
            .send()
            .await
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;

        info!(endpoint = %discovery.storage_url, "resolved cloud storage endpoint");
        *self.storage_endpoint.write().await = Some(discovery.storage_url);
        Ok(())
    }

    async fn storage_url(&self) -> Result<String> {
        self.storage_endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::ConnectionFailed("not authenticated".to_string()))
    }

    async fn bearer(&self) -> Result<String> {
        self.bearer_token
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::ConnectionFailed("not authenticated".to_string()))
    }

    pub async fn list_documents(&self) -> Result<Vec<CloudDocumentSummary>> {
        let storage = self.storage_url().await?;
        let token = self.bearer().await?;
        let docs = self
            .client
            .get(format!("{storage}/documents"))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| CoreError::ListingFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::ListingFailed(e.to_string()))?
            .json::<Vec<CloudDocumentSummary>>()
            .await
            .map_err(|e| CoreError::ListingFailed(e.to_string()))?;
        Ok(docs)
    }

    async fn request_blob_url(&self, storage: &str, token: &str, doc_id: &str) -> Result<String> {
        let resp: BlobUrlResponse = self
            .client
            .get(format!("{storage}/documents/{doc_id}/blob-url"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))?;
        Ok(resp.url)
    }

    async fn fetch_blob(&self, blob_url: &str) -> Result<bytes::Bytes> {
        self.client
            .get(blob_url)
            .send()
            .await
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))
    }

    /// Requests a signed blob URL for `doc_id`, fetches the zip archive it
    /// points at, and extracts `metadata`, `content`, and per-page stroke
    /// records into `local_dir` by filename convention. `metadata` and
    /// `content` are required archive members; their absence is an
    /// [`CoreError::InvalidArchive`].
    pub async fn download_document(&self, doc_id: String, local_dir: PathBuf) -> Result<Vec<String>> {
        let storage = self.storage_url().await?;
        let token = self.bearer().await?;

        let blob_url = self.request_blob_url(&storage, &token, &doc_id).await?;
        let archive_bytes = self.fetch_blob(&blob_url).await?;

        std::fs::create_dir_all(&local_dir).map_err(CoreError::Io)?;
        tokio::task::spawn_blocking(move || extract_archive(&archive_bytes, &doc_id, &local_dir))
            .await
            .map_err(|_| CoreError::Cancelled)?
    }

    pub async fn list_document_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.list_documents().await?.into_iter().map(|d| d.id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub async fn list_document_summaries(&self) -> Result<Vec<DocumentSummary>> {
        Ok(self
            .list_documents()
            .await?
            .into_iter()
            .map(|d| DocumentSummary { id: d.id, modified_at: d.modified_at })
            .collect())
    }
}

#[async_trait]
impl DocumentSource for CloudChannel {
    async fn list_document_ids(&self) -> Result<Vec<String>> {
        self.list_document_ids().await
    }

    async fn list_document_summaries(&self) -> Result<Vec<DocumentSummary>> {
        self.list_document_summaries().await
    }

    async fn download_document(&self, doc_id: String, local_dir: PathBuf) -> Result<Vec<String>> {
        self.download_document(doc_id, local_dir).await
    }
}

/// Extracts `<doc_id>.metadata`, `<doc_id>.content`, an optional
/// `<doc_id>.pdf`, and any `<doc_id>/<page_id>` stroke entries from a zip
/// archive into `local_dir`, mirroring the device's own on-disk layout for
/// the same document.
fn extract_archive(bytes: &[u8], doc_id: &str, local_dir: &Path) -> Result<Vec<String>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| CoreError::InvalidArchive(e.to_string()))?;

    let mut written = Vec::new();
    let mut has_metadata = false;
    let mut has_content = false;
    let metadata_name = format!("{doc_id}.metadata");
    let content_name = format!("{doc_id}.content");
    let pdf_name = format!("{doc_id}.pdf");
    let page_prefix = format!("{doc_id}/");

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| CoreError::InvalidArchive(e.to_string()))?;
        let name = entry.name().to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(CoreError::Io)?;

        let target = if name == metadata_name {
            has_metadata = true;
            Some(local_dir.join(&name))
        } else if name == content_name {
            has_content = true;
            Some(local_dir.join(&name))
        } else if name == pdf_name {
            Some(local_dir.join(&name))
        } else if let Some(page_id) = name.strip_prefix(&page_prefix) {
            let page_dir = local_dir.join(doc_id);
            std::fs::create_dir_all(&page_dir).map_err(CoreError::Io)?;
            Some(page_dir.join(page_id))
        } else {
            None
        };

        if let Some(path) = target {
            std::fs::write(&path, &buf).map_err(CoreError::Io)?;
            written.push(path.to_string_lossy().to_string());
        }
    }

    if !has_metadata || !has_content {
        return Err(CoreError::InvalidArchive(format!(
            "archive for {doc_id} is missing its metadata or content record"
        )));
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_applies_default_timeout() {
        let config = CloudChannelConfig::new("https://cloud.example", "token");
        assert_eq!(config.request_timeout, DEFAULT_TIMEOUT);
    }

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::FileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extract_archive_writes_metadata_content_and_stroke_blobs() {
        let doc_id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        let archive = build_archive(&[
            (&format!("{doc_id}.metadata"), b"meta"),
            (&format!("{doc_id}.content"), b"content"),
            (&format!("{doc_id}/page-1"), b"strokes"),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let written = extract_archive(&archive, doc_id, dir.path()).unwrap();

        assert_eq!(written.len(), 3);
        assert!(dir.path().join(format!("{doc_id}.metadata")).exists());
        assert!(dir.path().join(doc_id).join("page-1").exists());
    }

    #[test]
    fn extract_archive_rejects_archive_missing_content_record() {
        let doc_id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        let archive = build_archive(&[(&format!("{doc_id}.metadata"), b"meta")]);
        let dir = tempfile::tempdir().unwrap();

        assert!(extract_archive(&archive, doc_id, dir.path()).is_err());
    }
}
