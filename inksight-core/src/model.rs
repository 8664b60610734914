//! Data model shared by every component of the hybrid access / sync core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Canonical UUID string form: `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
pub type DocumentId = String;

/// A single file in the device's document directory, as returned by SFTP
/// `readdir`. Produced by the Device Channel; consumed transiently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub modified_at: DateTime<Utc>,
}

/// The cheap listing shape: just enough to decide whether a document needs
/// re-downloading, without fetching its full metadata/content bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub modified_at: DateTime<Utc>,
}

/// The persisted version of a single document in the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    /// Lowercase hex-encoded SHA-256, 64 characters.
    pub hash: String,
    pub modified_at: DateTime<Utc>,
}

/// The durable aggregate owned by the Incremental Sync Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_at: DateTime<Utc>,
    pub local_cache_dir: PathBuf,
    pub document_versions: HashMap<DocumentId, DocumentVersion>,
}

impl SyncState {
    pub fn new(local_cache_dir: PathBuf) -> Self {
        Self {
            last_sync_at: Utc::now(),
            local_cache_dir,
            document_versions: HashMap::new(),
        }
    }
}

/// On-disk representation of `SyncState`. `documentVersions` is an array of
/// `[id, version]` pairs, not an object, so that replicas produced by other
/// language implementations round-trip identically regardless of map key
/// ordering.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStateFile {
    #[serde(rename = "lastSyncAt")]
    pub last_sync_at: DateTime<Utc>,
    #[serde(rename = "localCacheDir")]
    pub local_cache_dir: PathBuf,
    #[serde(rename = "documentVersions")]
    pub document_versions: Vec<(DocumentId, DocumentVersionFile)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentVersionFile {
    pub hash: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
}

impl From<&SyncState> for SyncStateFile {
    fn from(state: &SyncState) -> Self {
        Self {
            last_sync_at: state.last_sync_at,
            local_cache_dir: state.local_cache_dir.clone(),
            document_versions: state
                .document_versions
                .iter()
                .map(|(id, v)| {
                    (
                        id.clone(),
                        DocumentVersionFile {
                            hash: v.hash.clone(),
                            modified_at: v.modified_at,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl From<SyncStateFile> for SyncState {
    fn from(file: SyncStateFile) -> Self {
        Self {
            last_sync_at: file.last_sync_at,
            local_cache_dir: file.local_cache_dir,
            document_versions: file
                .document_versions
                .into_iter()
                .map(|(id, v)| {
                    (
                        id,
                        DocumentVersion {
                            hash: v.hash,
                            modified_at: v.modified_at,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Kind of change observed for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Produced by the File Monitor; in-memory only, consumed by the sync engine.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub document_id: DocumentId,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
    pub affected_files: Vec<String>,
}

/// The per-document status reported by short-lived, live operations.
/// Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientSyncState {
    Synced,
    LocalAhead,
    RemoteAhead,
    Conflict,
}

/// Cached liveness state, produced by the Reachability Prober and owned by
/// the Hybrid Router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Ssh,
    Cloud,
    Offline,
}

/// User-supplied backend selection policy; may change at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    SshOnly,
    CloudOnly,
    #[default]
    HybridSshFirst,
    HybridCloudFirst,
}

/// Conflict resolution policy, supplied at the sync engine's construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    DeviceWins,
    LocalWins,
    NewestWins,
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_file_round_trips_through_array_form() {
        let mut state = SyncState::new(PathBuf::from("/tmp/inksight"));
        state.document_versions.insert(
            "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa".to_string(),
            DocumentVersion {
                hash: "a".repeat(64),
                modified_at: Utc::now(),
            },
        );

        let file: SyncStateFile = (&state).into();
        let json = serde_json::to_string(&file).unwrap();
        let parsed: SyncStateFile = serde_json::from_str(&json).unwrap();
        let restored: SyncState = parsed.into();

        assert_eq!(restored.document_versions.len(), 1);
        assert_eq!(restored.local_cache_dir, state.local_cache_dir);
    }
}
