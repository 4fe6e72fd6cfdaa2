//! Parameter server shard service
//!
//! Implements the four shard operations on top of the initialization gate,
//! the parameter store, and the checkpoint manager.

use std::sync::Arc;
use std::time::Instant;

use checkpoint::{
    load_checkpoint, CheckpointManager, CheckpointManagerConfig, CheckpointManagerHandle,
    CheckpointTaskHandle, SnapshotSource,
};
use parking_lot::Mutex;
use pserver_core::{
    CheckpointMeta, CheckpointSnapshot, Error, Gradient, Parameter, ParameterWithConfig, Result,
    ShardIndex,
};
use serde::Serialize;
use storage::{MetadataStore, StorageBackend};
use tracing::{debug, info, instrument, warn};

use crate::gate::InitGate;
use crate::optimizer::OptimizerFactory;
use crate::store::ParameterStore;

/// Snapshot of the service state for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub shard_index: ShardIndex,
    pub initialized: bool,
    pub parameters: usize,
    pub checkpointing: bool,
    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,
    pub last_checkpoint: Option<CheckpointMeta>,
    pub uptime_secs: u64,
}

/// Parameter server shard service
#[derive(Clone)]
pub struct PserverService {
    shard_index: ShardIndex,

    /// Parameter entries
    store: Arc<ParameterStore>,

    /// Open until parameter initialization finishes
    gate: Arc<InitGate>,

    /// Checkpoint manager reading from `store`
    checkpoint_manager: CheckpointManagerHandle,

    /// Background checkpoint loop, started when the gate closes
    checkpoint_task: Arc<Mutex<Option<CheckpointTaskHandle>>>,

    /// Service start time for uptime tracking
    start_time: Instant,
}

impl PserverService {
    /// Create a new service
    ///
    /// With a recovered `checkpoint` the store starts with its entries and
    /// their optimizer state; otherwise it starts empty.
    pub fn new(
        config: CheckpointManagerConfig,
        factory: Arc<dyn OptimizerFactory>,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        checkpoint: Option<CheckpointSnapshot>,
    ) -> Result<Self> {
        let store = Arc::new(match checkpoint {
            Some(snapshot) => ParameterStore::from_checkpoint(factory, snapshot)?,
            None => ParameterStore::new(factory),
        });

        let shard_index = config.shard_index;
        let source: Arc<dyn SnapshotSource> = store.clone();
        let checkpoint_manager = Arc::new(CheckpointManager::new(config, source, storage, metadata));

        info!(shard_index, parameters = store.len(), "Parameter server created");

        Ok(Self {
            shard_index,
            store,
            gate: Arc::new(InitGate::new()),
            checkpoint_manager,
            checkpoint_task: Arc::new(Mutex::new(None)),
            start_time: Instant::now(),
        })
    }

    /// Load the snapshot a new service should start from
    ///
    /// Returns `None` for a shard that never checkpointed. Any other failure
    /// means the shard's prior state is unknown and the caller must not serve.
    pub async fn recover(
        config: &CheckpointManagerConfig,
        storage: &dyn StorageBackend,
        metadata: &dyn MetadataStore,
    ) -> Result<Option<CheckpointSnapshot>> {
        match load_checkpoint(metadata, storage, config.shard_index, config.metadata_timeout).await
        {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(Error::CheckpointNotFound { .. }) => {
                info!(shard_index = config.shard_index, "No checkpoint to recover from");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Initialize a parameter
    ///
    /// Legal only before [`Self::finish_init_params`].
    #[instrument(skip(self, param), fields(name = %param.param.name))]
    pub fn init_param(&self, param: ParameterWithConfig) -> Result<()> {
        self.store.init_param(&self.gate, param)
    }

    /// Finish parameter initialization
    ///
    /// Releases pending [`Self::get_param`] calls and starts the checkpoint
    /// loop. A second call fails with `AlreadyInitialized`.
    pub async fn finish_init_params(&self) -> Result<()> {
        self.store.seal(&self.gate)?;

        let handle = self.checkpoint_manager.spawn();
        *self.checkpoint_task.lock() = Some(handle);
        Ok(())
    }

    /// Apply a gradient to its parameter
    ///
    /// Fails immediately with `Uninitialized` before initialization finishes.
    pub fn send_grad(&self, gradient: Gradient) -> Result<()> {
        self.gate.ensure_closed()?;
        self.store.apply(&gradient)
    }

    /// Read a parameter, waiting for initialization to finish first
    pub async fn get_param(&self, name: &str) -> Result<Parameter> {
        if !self.gate.is_closed() {
            debug!(name, "Waiting for parameter initialization");
            self.gate.wait_closed().await;
        }
        self.store.get(name)
    }

    /// Run a checkpoint tick outside the periodic schedule
    pub async fn checkpoint_now(&self) -> Result<CheckpointMeta> {
        self.gate.ensure_closed()?;
        self.checkpoint_manager.checkpoint().await
    }

    /// Stop the checkpoint loop, waiting for a running tick to finish
    pub async fn shutdown(&self) {
        let handle = self.checkpoint_task.lock().take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                info!(shard_index = self.shard_index, "Parameter server shut down");
            }
            None => warn!(shard_index = self.shard_index, "Shutdown with no checkpoint loop running"),
        }
    }

    pub fn shard_index(&self) -> ShardIndex {
        self.shard_index
    }

    pub fn is_initialized(&self) -> bool {
        self.gate.is_closed()
    }

    /// Returns true while the checkpoint loop is running
    pub fn is_checkpointing(&self) -> bool {
        self.checkpoint_task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn store(&self) -> &Arc<ParameterStore> {
        &self.store
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManagerHandle {
        &self.checkpoint_manager
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn status(&self) -> ServiceStatus {
        let stats = self.checkpoint_manager.stats();
        ServiceStatus {
            shard_index: self.shard_index,
            initialized: self.is_initialized(),
            parameters: self.store.len(),
            checkpointing: self.is_checkpointing(),
            checkpoints_succeeded: stats.succeeded,
            checkpoints_failed: stats.failed,
            last_checkpoint: self.checkpoint_manager.last_checkpoint(),
            uptime_secs: self.uptime_secs(),
        }
    }
}
