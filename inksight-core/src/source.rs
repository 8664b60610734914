//! The interface the Hybrid Router and Incremental Sync Engine use to talk
//! to either backend without caring which one they have.

use crate::error::Result;
use crate::model::DocumentSummary;
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Canonical ids of every document currently visible on the backend.
    async fn list_document_ids(&self) -> Result<Vec<String>>;

    /// Id and last-modified timestamp of every document currently visible on
    /// the backend, cheap enough to call before deciding what to download.
    async fn list_document_summaries(&self) -> Result<Vec<DocumentSummary>>;

    /// Downloads every artifact for `doc_id` into `local_dir`, returning the
    /// local paths written.
    async fn download_document(&self, doc_id: String, local_dir: PathBuf) -> Result<Vec<String>>;
}
