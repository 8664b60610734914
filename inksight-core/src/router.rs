//! Channel E: picks which backend (SSH or cloud) a call goes through,
//! according to the configured [`AccessMode`], and caches reachability so
//! the fast path never blocks on a fresh probe.

use crate::cloud_channel::CloudChannel;
use crate::device_channel::DeviceChannel;
use crate::error::{CoreError, Result};
use crate::model::{AccessMode, ConnectivityStatus, DocumentSummary};
use crate::prober::ReachabilityProber;
use crate::source::DocumentSource;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub type StatusHandler = Arc<dyn Fn(ConnectivityStatus) + Send + Sync>;

/// Outcome of a batch download pass: successes, the backend it ran against,
/// and every per-document failure, never aborting the batch on one bad id.
#[derive(Debug)]
pub struct SyncAllReport {
    pub synced: Vec<String>,
    pub source: ConnectivityStatus,
    pub errors: Vec<(String, String)>,
}

pub struct HybridRouter {
    mode: RwLock<AccessMode>,
    device: Arc<DeviceChannel>,
    cloud: Arc<CloudChannel>,
    prober: ReachabilityProber,
    status: RwLock<Option<ConnectivityStatus>>,
    on_status_change: RwLock<Option<StatusHandler>>,
}

impl HybridRouter {
    pub fn new(
        mode: AccessMode,
        device: Arc<DeviceChannel>,
        cloud: Arc<CloudChannel>,
        prober: ReachabilityProber,
    ) -> Self {
        Self {
            mode: RwLock::new(mode),
            device,
            cloud,
            prober,
            status: RwLock::new(None),
            on_status_change: RwLock::new(None),
        }
    }

    pub async fn set_status_handler(&self, handler: StatusHandler) {
        *self.on_status_change.write().await = Some(handler);
    }

    pub async fn get_mode(&self) -> AccessMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: AccessMode) {
        *self.mode.write().await = mode;
    }

    /// `false` until the first probe has completed, regardless of what it
    /// finds.
    pub async fn is_online(&self) -> bool {
        matches!(
            *self.status.read().await,
            Some(ConnectivityStatus::Ssh) | Some(ConnectivityStatus::Cloud)
        )
    }

    pub async fn current_status(&self) -> Option<ConnectivityStatus> {
        *self.status.read().await
    }

    /// Refreshes the cached status from a fresh probe, firing the status
    /// handler only on an actual transition.
    pub async fn refresh_status(&self) -> ConnectivityStatus {
        let detected = self.prober.detect_mode().await;
        let previous = { *self.status.read().await };
        if previous != Some(detected) {
            *self.status.write().await = Some(detected);
            info!(?previous, ?detected, "connectivity status changed");
            if let Some(handler) = self.on_status_change.read().await.as_ref() {
                handler(detected);
            }
        }
        detected
    }

    /// The backend selection policy: returns the channel to try first and,
    /// for hybrid modes, the one to fall back to on an `Err`.
    async fn backend_order(&self) -> Vec<Backend> {
        match *self.mode.read().await {
            AccessMode::SshOnly => vec![Backend::Ssh],
            AccessMode::CloudOnly => vec![Backend::Cloud],
            AccessMode::HybridSshFirst => vec![Backend::Ssh, Backend::Cloud],
            AccessMode::HybridCloudFirst => vec![Backend::Cloud, Backend::Ssh],
        }
    }

    fn source_for(&self, backend: Backend) -> &dyn DocumentSource {
        match backend {
            Backend::Ssh => self.device.as_ref(),
            Backend::Cloud => self.cloud.as_ref(),
        }
    }

    /// Lists document ids. In a hybrid mode, both backends are consulted and
    /// merged by id when the primary succeeds — the primary's entries
    /// overwrite the fallback's on a shared id — rather than returning only
    /// whichever backend answered first. In a single-backend mode this is
    /// just that backend's listing.
    pub async fn list_document_ids(&self) -> Result<Vec<String>> {
        let summaries = self.list_document_summaries().await?;
        Ok(summaries.into_iter().map(|s| s.id).collect())
    }

    /// Same merge semantics as [`Self::list_document_ids`], but carrying each
    /// document's last-modified timestamp too.
    pub async fn list_document_summaries(&self) -> Result<Vec<DocumentSummary>> {
        let order = self.backend_order().await;
        let mut last_err = None;
        let mut merged: Option<HashMap<String, DocumentSummary>> = None;

        for backend in order {
            match self.source_for(backend).list_document_summaries().await {
                Ok(summaries) => match merged {
                    None => {
                        merged = Some(summaries.into_iter().map(|s| (s.id.clone(), s)).collect());
                    }
                    Some(ref mut primary) => {
                        // `primary` already holds the first backend's results;
                        // fill in ids the primary didn't have, but never
                        // overwrite one it did.
                        for summary in summaries {
                            primary.entry(summary.id.clone()).or_insert(summary);
                        }
                    }
                },
                Err(e) => {
                    info!(?backend, error = %e, "backend failed, trying next in policy order");
                    last_err = Some(e);
                }
            }
        }

        match merged {
            Some(map) => {
                let mut summaries: Vec<DocumentSummary> = map.into_values().collect();
                summaries.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(summaries)
            }
            None => Err(last_err.unwrap_or(CoreError::ConnectionFailed("no backend configured".to_string()))),
        }
    }

    pub async fn download_document(&self, doc_id: String, local_dir: PathBuf) -> Result<Vec<String>> {
        let mut last_err = None;
        for backend in self.backend_order().await {
            let result = match backend {
                Backend::Ssh => self.device.download_document(doc_id.clone(), local_dir.clone()).await,
                Backend::Cloud => self.cloud.download_document(doc_id.clone(), local_dir.clone()).await,
            };
            match result {
                Ok(paths) => return Ok(paths),
                Err(e) => {
                    info!(?backend, error = %e, "backend failed, trying next in policy order");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(CoreError::ConnectionFailed("no backend configured".to_string())))
    }

    /// Enumerates every document id visible on the active backend and
    /// downloads whichever of them isn't already listed in `already_present`,
    /// rather than re-downloading a document already in the local cache. A
    /// per-document download failure is folded into `errors` and never
    /// aborts the rest of the batch.
    pub async fn sync_all(
        &self,
        local_cache_dir: &std::path::Path,
        already_present: &[String],
    ) -> Result<SyncAllReport> {
        let source = self.refresh_status().await;
        let ids = self.list_document_ids().await?;
        let present: std::collections::HashSet<&String> = already_present.iter().collect();

        let mut report = SyncAllReport { synced: Vec::new(), source, errors: Vec::new() };
        for id in ids {
            if present.contains(&id) {
                continue;
            }
            match self.download_document(id.clone(), local_cache_dir.to_path_buf()).await {
                Ok(_) => report.synced.push(id),
                Err(e) => {
                    info!(doc_id = %id, error = %e, "document download failed, continuing batch");
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
enum Backend {
    Ssh,
    Cloud,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_channel::CloudChannelConfig;
    use crate::device_channel::{Credentials, DeviceChannelConfig};
    use crate::prober::ProberConfig;

    fn router_with_mode(mode: AccessMode) -> HybridRouter {
        let device = Arc::new(DeviceChannel::new(DeviceChannelConfig::new(
            "192.0.2.1",
            "root",
            Credentials::Password("x".to_string()),
        )));
        let cloud = Arc::new(CloudChannel::new(CloudChannelConfig::new("https://cloud.invalid", "token")).unwrap());
        let prober = ReachabilityProber::new(ProberConfig::new("192.0.2.1", 22, "cloud.invalid"));
        HybridRouter::new(mode, device, cloud, prober)
    }

    #[tokio::test]
    async fn hybrid_ssh_first_tries_ssh_before_cloud() {
        let router = router_with_mode(AccessMode::HybridSshFirst);
        assert!(matches!(router.backend_order().await.as_slice(), [Backend::Ssh, Backend::Cloud]));
    }

    #[tokio::test]
    async fn hybrid_cloud_first_tries_cloud_before_ssh() {
        let router = router_with_mode(AccessMode::HybridCloudFirst);
        assert!(matches!(router.backend_order().await.as_slice(), [Backend::Cloud, Backend::Ssh]));
    }

    #[tokio::test]
    async fn ssh_only_never_falls_back_to_cloud() {
        let router = router_with_mode(AccessMode::SshOnly);
        assert!(matches!(router.backend_order().await.as_slice(), [Backend::Ssh]));
    }
}
