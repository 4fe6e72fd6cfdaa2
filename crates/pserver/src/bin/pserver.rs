//! Parameter server binary entry point
//!
//! Recovers the shard from its last checkpoint, if any, and serves the HTTP
//! API until shutdown.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkpoint::CheckpointManagerConfig;
use pserver::{PserverServer, PserverService, SgdOptimizerFactory};
use pserver_core::config::MetadataBackend;
use pserver_core::PserverConfig;
use storage::{LocalMetadataStore, LocalStorage, MemoryMetadataStore, MetadataStore, StorageBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pserver=info,checkpoint=info,storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration");
            PserverConfig::from_file(path)?
        }
        None => PserverConfig::default(),
    };
    config.validate()?;

    let storage: Arc<dyn StorageBackend> =
        Arc::new(LocalStorage::new(&config.checkpoint.storage_root));
    let metadata: Arc<dyn MetadataStore> = match &config.metadata.backend {
        MetadataBackend::Memory => {
            tracing::warn!("Using in-memory metadata store; checkpoints will not survive a restart");
            Arc::new(MemoryMetadataStore::new())
        }
        MetadataBackend::Local { root } => Arc::new(LocalMetadataStore::new(root)),
    };

    let manager_config = CheckpointManagerConfig::from(&config);
    let recovered =
        PserverService::recover(&manager_config, storage.as_ref(), metadata.as_ref()).await?;

    tracing::info!(
        shard_index = config.shard.index,
        recovered = recovered.is_some(),
        "Starting parameter server"
    );

    let service = PserverService::new(
        manager_config,
        Arc::new(SgdOptimizerFactory),
        storage,
        metadata,
        recovered,
    )?;

    PserverServer::from_config(&config.http, service)?.run().await?;
    Ok(())
}
