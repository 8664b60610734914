//! Channel H: runs an AI transform against a document and writes its output
//! to durable storage. Both the executor and the storage backend are
//! treated as opaque external contracts — this module only knows their
//! trait surface, never their implementation.

use crate::error::{CoreError, Result};
use crate::sync_engine::SyncEngine;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// What a transform run produced: the output bytes themselves plus the
/// billing/observability fields the coordinator has no way to derive on its
/// own (the executor is the only party that knows its own cost and runtime).
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Vec<u8>,
    pub extension: String,
    pub cost_units: f64,
    pub duration_ms: u64,
}

/// Runs a named transform over a document's files, producing output bytes.
/// Implemented outside this crate; the coordinator never inspects what
/// `transform_type` means.
#[async_trait]
pub trait TransformExecutor: Send + Sync {
    async fn execute(&self, doc_id: &str, transform_type: &str, input_dir: &Path) -> Result<TransformOutput>;
}

/// Durable storage for transform output. Implemented outside this crate.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, doc_id: &str, transform_type: &str, output: &[u8]) -> Result<String>;
}

pub struct TransformCoordinator {
    sync_engine: Arc<SyncEngine>,
    executor: Arc<dyn TransformExecutor>,
    store: Arc<dyn DocumentStore>,
}

impl TransformCoordinator {
    pub fn new(sync_engine: Arc<SyncEngine>, executor: Arc<dyn TransformExecutor>, store: Arc<dyn DocumentStore>) -> Self {
        Self { sync_engine, executor, store }
    }

    /// Best-effort sync of `doc_id` before running the transform: a sync
    /// failure here is logged and the transform proceeds against whatever
    /// is already in the local cache, rather than blocking the transform on
    /// full connectivity. Once the executor returns, the coordinator itself
    /// writes the output to `<output_dir>/<doc_id>-<transform_type>.<ext>`
    /// before handing the same bytes to the store.
    pub async fn run(&self, doc_id: &str, transform_type: &str, output_dir: &Path) -> Result<PathBuf> {
        if let Err(e) = self.sync_engine.sync_document(doc_id).await {
            warn!(doc_id, error = %e, "pre-transform sync failed, continuing with cached copy");
        }

        let output = self.executor.execute(doc_id, transform_type, output_dir).await?;
        let file_path = output_dir.join(format!("{doc_id}-{transform_type}.{}", output.extension));
        std::fs::create_dir_all(output_dir).map_err(CoreError::Io)?;
        std::fs::write(&file_path, &output.bytes).map_err(CoreError::Io)?;

        self.store.put(doc_id, transform_type, &output.bytes).await?;
        info!(
            doc_id,
            transform_type,
            path = %file_path.display(),
            cost_units = output.cost_units,
            duration_ms = output.duration_ms,
            "transform complete"
        );
        Ok(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_channel::{CloudChannel, CloudChannelConfig};
    use crate::device_channel::{Credentials, DeviceChannel, DeviceChannelConfig};
    use crate::model::AccessMode;
    use crate::prober::{ProberConfig, ReachabilityProber};
    use crate::router::HybridRouter;
    use std::sync::Mutex as StdMutex;

    struct FakeExecutor {
        output: Vec<u8>,
    }

    #[async_trait]
    impl TransformExecutor for FakeExecutor {
        async fn execute(&self, _doc_id: &str, _transform_type: &str, _input_dir: &Path) -> Result<TransformOutput> {
            Ok(TransformOutput {
                bytes: self.output.clone(),
                extension: "txt".to_string(),
                cost_units: 1.0,
                duration_ms: 5,
            })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl TransformExecutor for FailingExecutor {
        async fn execute(&self, _doc_id: &str, _transform_type: &str, _input_dir: &Path) -> Result<TransformOutput> {
            Err(CoreError::Executor("boom".to_string()))
        }
    }

    struct FakeStore {
        puts: StdMutex<Vec<(String, String)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self { puts: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn put(&self, doc_id: &str, transform_type: &str, _output: &[u8]) -> Result<String> {
            self.puts.lock().unwrap().push((doc_id.to_string(), transform_type.to_string()));
            Ok(format!("store://{doc_id}/{transform_type}"))
        }
    }

    /// A coordinator wired to a disconnected device/cloud pair: every
    /// pre-transform sync fails, exercising the "continue on sync failure"
    /// path rather than needing a live backend.
    async fn unreachable_coordinator(
        tmp: &Path,
        executor: Arc<dyn TransformExecutor>,
        store: Arc<dyn DocumentStore>,
    ) -> TransformCoordinator {
        let mut device_config =
            DeviceChannelConfig::new("192.0.2.1", "root", Credentials::Password("x".to_string()));
        device_config.connect_timeout = std::time::Duration::from_millis(200);
        let device = Arc::new(DeviceChannel::new(device_config));
        let cloud = Arc::new(
            CloudChannel::new(CloudChannelConfig::new("https://cloud.invalid", "token")).unwrap(),
        );
        let prober = ReachabilityProber::new(ProberConfig::new("192.0.2.1", 22, "cloud.invalid"));
        let router = Arc::new(HybridRouter::new(AccessMode::SshOnly, device, cloud, prober));
        let sync_engine = Arc::new(
            SyncEngine::initialize(router, tmp.to_path_buf(), Default::default())
                .await
                .unwrap(),
        );
        TransformCoordinator::new(sync_engine, executor, store)
    }

    #[tokio::test]
    async fn run_continues_past_a_failed_pre_transform_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new());
        let executor: Arc<dyn TransformExecutor> = Arc::new(FakeExecutor { output: b"ocr text".to_vec() });
        let coordinator = unreachable_coordinator(tmp.path(), executor, store.clone()).await;

        let path = coordinator.run("doc-1", "ocr", tmp.path()).await.unwrap();
        assert_eq!(path, tmp.path().join("doc-1-ocr.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"ocr text");
        assert_eq!(store.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_propagates_executor_failure_without_storing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new());
        let executor: Arc<dyn TransformExecutor> = Arc::new(FailingExecutor);
        let coordinator = unreachable_coordinator(tmp.path(), executor, store.clone()).await;

        let result = coordinator.run("doc-1", "summarize", tmp.path()).await;
        assert!(result.is_err());
        assert!(store.puts.lock().unwrap().is_empty());
    }
}
