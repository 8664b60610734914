//! Channel F: the incremental sync engine. Owns the durable `.sync-state.json`
//! and is the only component allowed to write it; every other component
//! treats `SyncState.documentVersions` as read-only.

use crate::conflict::{self, Resolution};
use crate::error::{CoreError, Result};
use crate::model::{
    ChangeEvent, ChangeKind, ConflictStrategy, DocumentVersion, SyncState, SyncStateFile, TransientSyncState,
};
use crate::router::HybridRouter;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

const STATE_FILE_NAME: &str = ".sync-state.json";

#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub deleted: Vec<String>,
    pub duration: Duration,
}

pub struct SyncEngine {
    router: Arc<HybridRouter>,
    local_cache_dir: PathBuf,
    conflict_strategy: ConflictStrategy,
    state: RwLock<SyncState>,
}

impl SyncEngine {
    /// Loads `.sync-state.json` from `local_cache_dir`, or starts from an
    /// empty state if absent or unreadable. A corrupt state file is never
    /// surfaced as an error: it is silently treated as "no prior state",
    /// which costs a redundant re-download of everything, not a failure.
    pub async fn initialize(
        router: Arc<HybridRouter>,
        local_cache_dir: PathBuf,
        conflict_strategy: ConflictStrategy,
    ) -> Result<Self> {
        std::fs::create_dir_all(&local_cache_dir)?;
        let state_path = local_cache_dir.join(STATE_FILE_NAME);
        let state = match std::fs::read(&state_path) {
            Ok(bytes) => match serde_json::from_slice::<SyncStateFile>(&bytes) {
                Ok(file) => file.into(),
                Err(e) => {
                    warn!(error = %e, "sync state file is corrupt, resetting to empty");
                    SyncState::new(local_cache_dir.clone())
                }
            },
            Err(_) => SyncState::new(local_cache_dir.clone()),
        };

        Ok(Self {
            router,
            local_cache_dir,
            conflict_strategy,
            state: RwLock::new(state),
        })
    }

    pub async fn get_sync_state(&self) -> SyncState {
        self.state.read().await.clone()
    }

    async fn persist(&self) -> Result<()> {
        let file: SyncStateFile = {
            let guard = self.state.read().await;
            (&*guard).into()
        };
        let path = self.local_cache_dir.join(STATE_FILE_NAME);
        tokio::task::spawn_blocking(move || atomic_write_json(&path, &file))
            .await
            .map_err(|_| CoreError::Cancelled)?
    }

    /// The full sync:
    /// 1. list every document's id and `modifiedAt` from the active backend,
    /// 2. for each, compare `modifiedAt` to the recorded `DocumentVersion`
    ///    and skip with no I/O at all when they already match,
    /// 3. otherwise download, hash, record, and append to `synced`,
    /// 4. fold per-document faults into `failed` instead of aborting — one
    ///    bad document never blocks the rest of the batch,
    /// 5. prune any id tracked in state but absent from this listing into
    ///    `deleted`, then persist and advance `last_sync_at`.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let start = Instant::now();
        let remote = self.router.list_document_summaries().await?;
        let mut report = SyncReport::default();
        let mut seen = std::collections::HashSet::with_capacity(remote.len());

        for summary in &remote {
            seen.insert(summary.id.clone());
            let previous = self.state.read().await.document_versions.get(&summary.id).cloned();
            if let Some(prev) = &previous {
                if prev.modified_at == summary.modified_at {
                    continue;
                }
            }

            match self.download_and_record(&summary.id, summary.modified_at).await {
                Ok(()) => report.synced.push(summary.id.clone()),
                Err(e) => {
                    warn!(doc_id = %summary.id, error = %e, "document sync failed, continuing batch");
                    report.failed.push((summary.id.clone(), e.to_string()));
                }
            }
        }

        let stale: Vec<String> = {
            let state = self.state.read().await;
            state.document_versions.keys().filter(|id| !seen.contains(*id)).cloned().collect()
        };
        if !stale.is_empty() {
            let mut state = self.state.write().await;
            for id in &stale {
                state.document_versions.remove(id);
            }
        }
        report.deleted = stale;

        self.state.write().await.last_sync_at = Utc::now();
        self.persist().await?;
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Applies a batch of change events from the File Monitor. An empty
    /// batch is a pure no-op: no backend call, no state read, no persist,
    /// just an empty report. `Deleted` drops the tracked version outright;
    /// `Created`/`Modified` look up the document's current remote mtime and
    /// download unconditionally. A per-event failure is folded into
    /// `failed` and leaves that document's state untouched.
    pub async fn incremental_sync(&self, events: Vec<ChangeEvent>) -> Result<SyncReport> {
        if events.is_empty() {
            return Ok(SyncReport::default());
        }

        let start = Instant::now();
        let mut report = SyncReport::default();

        for event in events {
            match event.kind {
                ChangeKind::Deleted => {
                    let existed = self.state.write().await.document_versions.remove(&event.document_id).is_some();
                    if existed {
                        report.deleted.push(event.document_id);
                    }
                }
                ChangeKind::Created | ChangeKind::Modified => match self.remote_mtime(&event.document_id).await {
                    Ok(Some(mtime)) => match self.download_and_record(&event.document_id, mtime).await {
                        Ok(()) => report.synced.push(event.document_id),
                        Err(e) => report.failed.push((event.document_id, e.to_string())),
                    },
                    Ok(None) => report
                        .failed
                        .push((event.document_id, "document no longer present on backend".to_string())),
                    Err(e) => report.failed.push((event.document_id, e.to_string())),
                },
            }
        }

        self.state.write().await.last_sync_at = Utc::now();
        self.persist().await?;
        report.duration = start.elapsed();
        Ok(report)
    }

    /// The live, single-document operation: compares the local cache's mtime
    /// against the device's current mtime and, when state disagrees with
    /// both, hands the conflict to the Conflict Resolver.
    ///
    /// | local mtime | remote mtime | outcome |
    /// |---|---|---|
    /// | missing | — | download, no comparison needed |
    /// | == | == | `Synced`, no I/O beyond the two mtime reads |
    /// | last-known differs from both local and remote | — | `Conflict` — resolved per strategy |
    /// | < | > | `RemoteAhead` — device copy adopted |
    /// | > | < | `LocalAhead` — resolved per strategy |
    pub async fn sync_document(&self, doc_id: &str) -> Result<TransientSyncState> {
        let remote_mtime = self
            .remote_mtime(doc_id)
            .await?
            .ok_or_else(|| CoreError::DocumentNotFound(doc_id.to_string()))?;

        let local_mtime = local_metadata_mtime(&self.local_cache_dir, doc_id);
        let Some(local_mtime) = local_mtime else {
            self.download_and_record(doc_id, remote_mtime).await?;
            return Ok(TransientSyncState::Synced);
        };

        let previous = self.state.read().await.document_versions.get(doc_id).cloned();
        if let Some(prev) = &previous {
            if prev.modified_at != local_mtime && prev.modified_at != remote_mtime {
                return self
                    .resolve_conflict(doc_id, remote_mtime, local_mtime, TransientSyncState::Conflict)
                    .await;
            }
        }

        match local_mtime.cmp(&remote_mtime) {
            std::cmp::Ordering::Equal => Ok(TransientSyncState::Synced),
            std::cmp::Ordering::Less => {
                self.download_and_record(doc_id, remote_mtime).await?;
                Ok(TransientSyncState::RemoteAhead)
            }
            std::cmp::Ordering::Greater => {
                self.resolve_conflict(doc_id, remote_mtime, local_mtime, TransientSyncState::LocalAhead)
                    .await
            }
        }
    }

    /// Looks up `doc_id`'s current `modifiedAt` from the active backend,
    /// or `None` if the backend no longer lists it at all.
    async fn remote_mtime(&self, doc_id: &str) -> Result<Option<DateTime<Utc>>> {
        let summaries = self.router.list_document_summaries().await?;
        Ok(summaries.into_iter().find(|s| s.id == doc_id).map(|s| s.modified_at))
    }

    /// Downloads `doc_id` into a staging directory, hashes it, moves it into
    /// the cache, resets the moved `.metadata` file's mtime to
    /// `remote_mtime` (a fresh download otherwise gets "now" as its local
    /// mtime, which would corrupt every future mtime comparison), and
    /// records the new version.
    async fn download_and_record(&self, doc_id: &str, remote_mtime: DateTime<Utc>) -> Result<()> {
        let staging_dir = self.local_cache_dir.join(".staging").join(doc_id);
        std::fs::create_dir_all(&staging_dir)?;
        self.router
            .download_document(doc_id.to_string(), staging_dir.clone())
            .await?;
        let hash = compute_hash(&staging_dir, doc_id)?;
        move_staged_into_cache(&staging_dir, &self.local_cache_dir)?;
        set_local_mtime(&self.local_cache_dir, doc_id, remote_mtime)?;

        self.state.write().await.document_versions.insert(
            doc_id.to_string(),
            DocumentVersion { hash, modified_at: remote_mtime },
        );
        Ok(())
    }

    /// Downloads `doc_id` fresh to compare against the local copy, then asks
    /// the Conflict Resolver which side to keep.
    async fn resolve_conflict(
        &self,
        doc_id: &str,
        remote_mtime: DateTime<Utc>,
        local_mtime: DateTime<Utc>,
        reported_as: TransientSyncState,
    ) -> Result<TransientSyncState> {
        let staging_dir = self.local_cache_dir.join(".staging").join(doc_id);
        std::fs::create_dir_all(&staging_dir)?;
        self.router
            .download_document(doc_id.to_string(), staging_dir.clone())
            .await?;
        let remote_hash = compute_hash(&staging_dir, doc_id)?;
        let local_hash = compute_hash(&self.local_cache_dir, doc_id)?;

        let device = DocumentVersion { hash: remote_hash, modified_at: remote_mtime };
        let local = DocumentVersion { hash: local_hash, modified_at: local_mtime };

        let keep_device = matches!(
            conflict::resolve(&device, &local, self.conflict_strategy, |_, _| None),
            Resolution::KeepDevice | Resolution::NoConflict
        );

        if keep_device {
            move_staged_into_cache(&staging_dir, &self.local_cache_dir)?;
            set_local_mtime(&self.local_cache_dir, doc_id, remote_mtime)?;
            self.state.write().await.document_versions.insert(doc_id.to_string(), device);
        } else {
            std::fs::remove_dir_all(&staging_dir).ok();
            self.state.write().await.document_versions.insert(doc_id.to_string(), local);
        }

        Ok(reported_as)
    }
}

fn local_metadata_mtime(cache_dir: &Path, doc_id: &str) -> Option<DateTime<Utc>> {
    std::fs::metadata(cache_dir.join(format!("{doc_id}.metadata")))
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn set_local_mtime(cache_dir: &Path, doc_id: &str, modified_at: DateTime<Utc>) -> Result<()> {
    let path = cache_dir.join(format!("{doc_id}.metadata"));
    let time = filetime::FileTime::from_unix_time(modified_at.timestamp(), 0);
    filetime::set_file_mtime(&path, time).map_err(CoreError::Io)
}

fn compute_hash(dir: &Path, doc_id: &str) -> Result<String> {
    let metadata = std::fs::read(dir.join(format!("{doc_id}.metadata")))?;
    let content = std::fs::read(dir.join(format!("{doc_id}.content")))?;
    let mut hasher = Sha256::new();
    hasher.update(&metadata);
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

fn move_staged_into_cache(staging_dir: &Path, cache_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(staging_dir)? {
        let entry = entry?;
        let target = cache_dir.join(entry.file_name());
        if target.exists() {
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        std::fs::rename(entry.path(), &target)?;
    }
    std::fs::remove_dir_all(staging_dir).ok();
    Ok(())
}

fn atomic_write_json(path: &Path, file: &SyncStateFile) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(file)?;
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_channel::{CloudChannel, CloudChannelConfig};
    use crate::device_channel::{Credentials, DeviceChannel, DeviceChannelConfig};
    use crate::model::AccessMode;
    use crate::prober::{ProberConfig, ReachabilityProber};

    async fn unreachable_engine(tmp: &Path) -> SyncEngine {
        let mut device_config =
            DeviceChannelConfig::new("192.0.2.1", "root", Credentials::Password("x".to_string()));
        device_config.connect_timeout = std::time::Duration::from_millis(200);
        let device = Arc::new(DeviceChannel::new(device_config));
        let cloud = Arc::new(
            CloudChannel::new(CloudChannelConfig::new("https://cloud.invalid", "token")).unwrap(),
        );
        let prober = ReachabilityProber::new(ProberConfig::new("192.0.2.1", 22, "cloud.invalid"));
        let router = Arc::new(HybridRouter::new(AccessMode::SshOnly, device, cloud, prober));
        SyncEngine::initialize(router, tmp.to_path_buf(), Default::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn incremental_sync_with_no_events_is_a_pure_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = unreachable_engine(tmp.path()).await;

        let report = engine.incremental_sync(Vec::new()).await.unwrap();

        assert!(report.synced.is_empty());
        assert!(report.failed.is_empty());
        assert!(report.deleted.is_empty());
        assert_eq!(report.duration, Duration::default());
    }

    #[tokio::test]
    async fn incremental_sync_drops_deleted_document_from_state() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = unreachable_engine(tmp.path()).await;
        let doc_id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string();
        engine.state.write().await.document_versions.insert(
            doc_id.clone(),
            DocumentVersion { hash: "a".repeat(64), modified_at: Utc::now() },
        );

        let report = engine
            .incremental_sync(vec![ChangeEvent {
                document_id: doc_id.clone(),
                kind: ChangeKind::Deleted,
                observed_at: Utc::now(),
                affected_files: vec![],
            }])
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![doc_id.clone()]);
        assert!(!engine.get_sync_state().await.document_versions.contains_key(&doc_id));
    }

    #[test]
    fn compute_hash_is_order_stable_for_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let doc_id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        std::fs::write(dir.path().join(format!("{doc_id}.metadata")), b"meta").unwrap();
        std::fs::write(dir.path().join(format!("{doc_id}.content")), b"content").unwrap();

        let first = compute_hash(dir.path(), doc_id).unwrap();
        let second = compute_hash(dir.path(), doc_id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn compute_hash_fails_when_content_member_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let doc_id = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        std::fs::write(dir.path().join(format!("{doc_id}.metadata")), b"meta").unwrap();
        assert!(compute_hash(dir.path(), doc_id).is_err());
    }

    #[test]
    fn atomic_write_json_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sync-state.json");
        let file = SyncStateFile {
            last_sync_at: Utc::now(),
            local_cache_dir: dir.path().to_path_buf(),
            document_versions: Vec::new(),
        };
        atomic_write_json(&path, &file).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
