//! Periodic checkpointing of a parameter shard
//!
//! A tick snapshots the shard, writes the blob under a fresh UUID, publishes
//! the new pointer to the metadata store, and only then deletes the blob the
//! previous pointer referenced. Until the publish succeeds the previous
//! pointer and blob stay valid, so the metadata store never points at a
//! partial checkpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use pserver_core::{
    checkpoint_key, CheckpointMeta, CheckpointSnapshot, Error, PserverConfig, Result, ShardIndex,
};
use storage::{MetadataStore, StorageBackend};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{checksum, codec, recovery};

/// Source of the entries captured by a checkpoint
///
/// Implementors must copy every entry within a single lock scope so the
/// snapshot reflects one instant.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> CheckpointSnapshot;
}

/// Checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Shard whose metadata key the manager publishes to
    pub shard_index: ShardIndex,

    /// Time between ticks
    pub interval: Duration,

    /// Directory for checkpoint blobs within the blob storage
    pub dir: String,

    /// Timeout for each metadata store call
    pub metadata_timeout: Duration,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            shard_index: 0,
            interval: Duration::from_secs(60),
            dir: "checkpoints".to_string(),
            metadata_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&PserverConfig> for CheckpointManagerConfig {
    fn from(config: &PserverConfig) -> Self {
        Self {
            shard_index: config.shard.index,
            interval: config.checkpoint.interval,
            dir: config.checkpoint.dir.clone(),
            metadata_timeout: config.metadata.timeout,
        }
    }
}

/// Counters of finished ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// Checkpoint manager for one shard
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
    source: Arc<dyn SnapshotSource>,
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,

    /// Serializes ticks so two never race on the previous pointer
    tick_lock: tokio::sync::Mutex<()>,

    /// Last pointer this manager published
    last_checkpoint: RwLock<Option<CheckpointMeta>>,

    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl CheckpointManager {
    /// Create a new checkpoint manager
    pub fn new(
        config: CheckpointManagerConfig,
        source: Arc<dyn SnapshotSource>,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            source,
            storage,
            metadata,
            tick_lock: tokio::sync::Mutex::new(()),
            last_checkpoint: RwLock::new(None),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CheckpointManagerConfig {
        &self.config
    }

    /// Last checkpoint published by this manager
    pub fn last_checkpoint(&self) -> Option<CheckpointMeta> {
        self.last_checkpoint.read().clone()
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Run a single checkpoint tick
    ///
    /// On error nothing published before the tick is modified.
    pub async fn checkpoint(&self) -> Result<CheckpointMeta> {
        let _tick = self.tick_lock.lock().await;
        let start = Instant::now();
        info!(shard_index = self.config.shard_index, "Begin save checkpoint");

        match self.run_tick().await {
            Ok(meta) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                *self.last_checkpoint.write() = Some(meta.clone());
                info!(
                    shard_index = self.config.shard_index,
                    checkpoint_id = %meta.uuid,
                    path = %meta.path,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Checkpoint saved"
                );
                Ok(meta)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn run_tick(&self) -> Result<CheckpointMeta> {
        let snapshot = self.source.snapshot();
        let entries = snapshot.len();
        let blob = codec::encode(&snapshot)?;
        drop(snapshot);

        self.storage.create_dir(&self.config.dir).await?;

        let id = Uuid::new_v4().to_string();
        let path = format!("{}/{}", self.config.dir.trim_end_matches('/'), id);
        let size = self.storage.write(&path, blob.clone()).await?;
        let checksum = checksum::checksum(&blob);

        debug!(path = %path, entries, size_bytes = size, checksum = %checksum, "Checkpoint blob written");

        let previous = match self.previous_meta().await {
            Ok(previous) => previous,
            Err(e) => {
                // Nothing was published yet
                self.remove_blob(&path, "Failed to delete unpublished checkpoint")
                    .await;
                return Err(e);
            }
        };

        let meta = CheckpointMeta::new(id, path, checksum);
        if let Err(e) = self.publish(&meta).await {
            self.discard_if_unpublished(&meta.path).await;
            return Err(e);
        }

        if let Some(previous) = previous.filter(|p| p.path != meta.path) {
            self.remove_blob(&previous.path, "Failed to delete old checkpoint")
                .await;
        }
        Ok(meta)
    }

    /// Pointer published by the previous tick, if any
    async fn previous_meta(&self) -> Result<Option<CheckpointMeta>> {
        let timeout = self.config.metadata_timeout;
        match recovery::load_meta(self.metadata.as_ref(), self.config.shard_index, timeout).await {
            Ok(meta) => Ok(Some(meta)),
            Err(Error::CheckpointNotFound { .. }) => {
                info!(
                    shard_index = self.config.shard_index,
                    "Do not have existing checkpoint"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, meta: &CheckpointMeta) -> Result<()> {
        let record = serde_json::to_vec(meta)?;
        self.metadata
            .put_key(
                &checkpoint_key(self.config.shard_index),
                Bytes::from(record),
                self.config.metadata_timeout,
                false,
            )
            .await
    }

    /// Delete `path` after a failed publish unless the pointer names it
    ///
    /// A put that reports an error may still have committed, so the blob is
    /// kept whenever the current pointer cannot be shown to reference
    /// another file.
    async fn discard_if_unpublished(&self, path: &str) {
        match self.previous_meta().await {
            Ok(Some(current)) if current.path == path => {
                warn!(path = %path, "Publish reported failure but pointer names new checkpoint, keeping blob");
            }
            Ok(_) => {
                self.remove_blob(path, "Failed to delete unpublished checkpoint")
                    .await
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Cannot confirm publish outcome, keeping blob");
            }
        }
    }

    /// Best-effort blob deletion; failure is logged and never fails the tick
    async fn remove_blob(&self, path: &str, message: &str) {
        match self.storage.delete(path).await {
            Ok(()) => debug!(path = %path, "Deleted checkpoint blob"),
            Err(e) => warn!(path = %path, error = %e, "{}", message),
        }
    }

    /// Start the periodic checkpoint loop
    ///
    /// The first tick fires one full interval after the call. Tick errors
    /// are logged and the loop retries on the next interval.
    pub fn spawn(self: &Arc<Self>) -> CheckpointTaskHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let manager = Arc::clone(self);

        let task = tokio::spawn(async move {
            let period = manager.config.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                shard_index = manager.config.shard_index,
                interval_ms = period.as_millis() as u64,
                "Starting checkpoint loop"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.checkpoint().await {
                            error!(
                                shard_index = manager.config.shard_index,
                                error = %e,
                                "Checkpoint failed"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Checkpoint loop shutting down");
                        break;
                    }
                }
            }
        });

        CheckpointTaskHandle { shutdown_tx, task }
    }
}

/// Thread-safe handle to checkpoint manager
pub type CheckpointManagerHandle = Arc<CheckpointManager>;

/// Handle to a running checkpoint loop
pub struct CheckpointTaskHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl CheckpointTaskHandle {
    /// Stop the loop and wait for it to exit
    ///
    /// A tick already in progress runs to completion first.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Checkpoint loop panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
