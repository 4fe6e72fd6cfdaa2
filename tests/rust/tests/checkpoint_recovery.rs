use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{load_checkpoint, load_meta, CheckpointManagerConfig, SnapshotSource};
use pserver::{PserverService, SgdOptimizerFactory};
use pserver_core::{ElementType, Error, Parameter, ParameterWithConfig};
use storage::{LocalStorage, MemoryMetadataStore, MetadataStore, StorageBackend};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(1);

/// Metadata store whose puts can be switched to fail
///
/// With `commit_failed_puts` set a failing put still writes the record, the
/// way a put can land and then time out.
struct FlakyMetadata {
    inner: MemoryMetadataStore,
    fail_puts: AtomicBool,
    commit_failed_puts: AtomicBool,
}

impl FlakyMetadata {
    fn new() -> Self {
        Self {
            inner: MemoryMetadataStore::new(),
            fail_puts: AtomicBool::new(false),
            commit_failed_puts: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadata {
    async fn get_key(&self, key: &str, timeout: Duration) -> pserver_core::Result<Option<Bytes>> {
        self.inner.get_key(key, timeout).await
    }

    async fn put_key(
        &self,
        key: &str,
        value: Bytes,
        timeout: Duration,
        must_not_exist: bool,
    ) -> pserver_core::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            if self.commit_failed_puts.load(Ordering::SeqCst) {
                self.inner.put_key(key, value, timeout, must_not_exist).await?;
                return Err(Error::Timeout {
                    operation: "put_key".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            return Err(Error::MetadataStore {
                message: "connection refused".to_string(),
            });
        }
        self.inner.put_key(key, value, timeout, must_not_exist).await
    }
}

struct Shard {
    _dir: TempDir,
    storage: Arc<LocalStorage>,
    metadata: Arc<FlakyMetadata>,
    config: CheckpointManagerConfig,
}

impl Shard {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        Ok(Self {
            storage: Arc::new(LocalStorage::new(dir.path())),
            metadata: Arc::new(FlakyMetadata::new()),
            config: CheckpointManagerConfig {
                shard_index: 3,
                metadata_timeout: TIMEOUT,
                ..Default::default()
            },
            _dir: dir,
        })
    }

    async fn start(&self) -> Result<PserverService> {
        let recovered =
            PserverService::recover(&self.config, &*self.storage, &*self.metadata)
                .await?;
        Ok(PserverService::new(
            self.config.clone(),
            Arc::new(SgdOptimizerFactory),
            self.storage.clone(),
            self.metadata.clone(),
            recovered,
        )?)
    }

    async fn blobs(&self) -> Result<Vec<String>> {
        Ok(self.storage.list(&self.config.dir).await?)
    }
}

fn bytes_of<T: Copy, const N: usize>(values: &[T], to_le: fn(T) -> [u8; N]) -> Bytes {
    values.iter().flat_map(|v| to_le(*v)).collect::<Vec<u8>>().into()
}

async fn init_abc(service: &PserverService) -> Result<()> {
    service.init_param(ParameterWithConfig::new(
        Parameter::new("A", ElementType::Float32, bytes_of(&[1.0f32, 2.0], f32::to_le_bytes)),
        Bytes::from_static(br#"{"learning_rate":0.5,"momentum":0.9}"#),
    ))?;
    service.init_param(ParameterWithConfig::new(
        Parameter::new("B", ElementType::Int64, bytes_of(&[10i64, -10], i64::to_le_bytes)),
        Bytes::from_static(br#"{"learning_rate":1.0}"#),
    ))?;
    service.init_param(ParameterWithConfig::new(
        Parameter::new("C", ElementType::Float64, bytes_of(&[0.125f64], f64::to_le_bytes)),
        Bytes::new(),
    ))?;
    service.finish_init_params().await?;
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_round_trip_preserves_entries() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    init_abc(&service).await?;

    service.send_grad(Parameter::new(
        "A",
        ElementType::Float32,
        bytes_of(&[1.0f32, -1.0], f32::to_le_bytes),
    ))?;
    service.send_grad(Parameter::new(
        "B",
        ElementType::Int64,
        bytes_of(&[3i64, 3], i64::to_le_bytes),
    ))?;

    let expected = service.store().snapshot();
    service.checkpoint_now().await?;
    service.shutdown().await;

    let loaded = load_checkpoint(
        &*shard.metadata,
        &*shard.storage,
        shard.config.shard_index,
        TIMEOUT,
    )
    .await?;
    assert_eq!(loaded, expected);

    let names: Vec<_> = loaded.iter().map(|p| p.param.param.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    assert_eq!(loaded[0].state.len(), 16);
    assert_eq!(loaded[1].param.param.element_type, ElementType::Int64);
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    init_abc(&service).await?;
    service.send_grad(Parameter::new(
        "A",
        ElementType::Float32,
        bytes_of(&[2.0f32, 2.0], f32::to_le_bytes),
    ))?;
    service.checkpoint_now().await?;
    let before = service.get_param("A").await?;
    service.shutdown().await;

    let restarted = shard.start().await?;
    assert_eq!(restarted.store().len(), 3);
    restarted.finish_init_params().await?;
    assert_eq!(restarted.get_param("A").await?, before);

    // Momentum state survived: the same gradient moves both copies equally
    let g = Parameter::new(
        "A",
        ElementType::Float32,
        bytes_of(&[1.0f32, 1.0], f32::to_le_bytes),
    );
    service.send_grad(g.clone())?;
    restarted.send_grad(g)?;
    assert_eq!(
        restarted.get_param("A").await?,
        service.get_param("A").await?
    );

    restarted.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_corrupted_blob_fails_checksum() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    init_abc(&service).await?;
    let meta = service.checkpoint_now().await?;
    service.shutdown().await;

    let mut blob = shard.storage.read(&meta.path).await?.to_vec();
    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    shard.storage.write(&meta.path, Bytes::from(blob)).await?;

    let result = load_checkpoint(
        &*shard.metadata,
        &*shard.storage,
        shard.config.shard_index,
        TIMEOUT,
    )
    .await;
    assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));

    let restart = shard.start().await;
    assert!(restart.is_err());
    Ok(())
}

#[tokio::test]
async fn test_two_ticks_leave_one_checkpoint() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    init_abc(&service).await?;

    let first = service.checkpoint_now().await?;
    let second = service.checkpoint_now().await?;
    service.shutdown().await;

    assert_ne!(first.path, second.path);
    assert_eq!(shard.blobs().await?, vec![second.path.clone()]);
    assert_eq!(shard.metadata.inner.len(), 1);

    let published = load_meta(&*shard.metadata, shard.config.shard_index, TIMEOUT).await?;
    assert_eq!(published, second);
    Ok(())
}

#[tokio::test]
async fn test_failed_publish_keeps_previous_checkpoint() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    init_abc(&service).await?;

    let good = service.checkpoint_now().await?;
    let expected = service.store().snapshot();

    service.send_grad(Parameter::new(
        "C",
        ElementType::Float64,
        bytes_of(&[1.0f64], f64::to_le_bytes),
    ))?;
    shard.metadata.fail_puts.store(true, Ordering::SeqCst);
    let failed = service.checkpoint_now().await;
    assert!(matches!(failed, Err(Error::MetadataStore { .. })));
    service.shutdown().await;

    assert_eq!(shard.blobs().await?, vec![good.path.clone()]);
    let published = load_meta(&*shard.metadata, shard.config.shard_index, TIMEOUT).await?;
    assert_eq!(published, good);

    let loaded = load_checkpoint(
        &*shard.metadata,
        &*shard.storage,
        shard.config.shard_index,
        TIMEOUT,
    )
    .await?;
    assert_eq!(loaded, expected);

    let stats = service.status();
    assert_eq!(stats.checkpoints_succeeded, 1);
    assert_eq!(stats.checkpoints_failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_fresh_shard_starts_empty() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    assert!(service.store().is_empty());
    assert!(shard.blobs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_put_timeout_after_commit_keeps_shard_recoverable() -> Result<()> {
    let shard = Shard::new()?;
    let service = shard.start().await?;
    init_abc(&service).await?;
    service.checkpoint_now().await?;

    service.send_grad(Parameter::new(
        "C",
        ElementType::Float64,
        bytes_of(&[1.0f64], f64::to_le_bytes),
    ))?;
    let expected = service.store().snapshot();

    shard.metadata.commit_failed_puts.store(true, Ordering::SeqCst);
    shard.metadata.fail_puts.store(true, Ordering::SeqCst);
    let result = service.checkpoint_now().await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    service.shutdown().await;

    // The record landed, so the blob it names must still be there
    let published = load_meta(&*shard.metadata, shard.config.shard_index, TIMEOUT).await?;
    assert!(shard.blobs().await?.contains(&published.path));

    shard.metadata.fail_puts.store(false, Ordering::SeqCst);
    let restarted = shard.start().await?;
    assert_eq!(restarted.store().snapshot(), expected);
    Ok(())
}
