//! Startup recovery from the last published checkpoint
//!
//! The metadata record is trusted only after the blob it points to passes the
//! checksum check; a corrupted blob is never decoded.

use std::time::Duration;

use pserver_core::{checkpoint_key, CheckpointMeta, CheckpointSnapshot, Error, Result, ShardIndex};
use storage::{MetadataStore, StorageBackend};
use tracing::{info, instrument};

use crate::{checksum, codec};

/// Fetch the current checkpoint pointer of a shard
///
/// Fails with `CheckpointNotFound` when the shard has never checkpointed.
pub async fn load_meta(
    metadata: &dyn MetadataStore,
    shard_index: ShardIndex,
    timeout: Duration,
) -> Result<CheckpointMeta> {
    let record = metadata
        .get_key(&checkpoint_key(shard_index), timeout)
        .await?;

    match record {
        Some(value) if !value.is_empty() => Ok(serde_json::from_slice(&value)?),
        _ => Err(Error::CheckpointNotFound { shard_index }),
    }
}

/// Load and verify the latest checkpoint of a shard
///
/// # Errors
/// - `CheckpointNotFound` if no checkpoint was ever published (normal for a
///   fresh shard)
/// - `ChecksumMismatch` if the blob does not match the recorded checksum
/// - storage, metadata, or encoding errors otherwise
#[instrument(skip(metadata, storage))]
pub async fn load_checkpoint(
    metadata: &dyn MetadataStore,
    storage: &dyn StorageBackend,
    shard_index: ShardIndex,
    timeout: Duration,
) -> Result<CheckpointSnapshot> {
    let meta = load_meta(metadata, shard_index, timeout).await?;
    let blob = storage.read(&meta.path).await?;

    checksum::verify(&meta.path, &blob, &meta.checksum)?;
    let snapshot = codec::decode(&blob)?;

    info!(
        shard_index,
        checkpoint_id = %meta.uuid,
        path = %meta.path,
        entries = snapshot.len(),
        size_bytes = blob.len(),
        "Loaded checkpoint"
    );

    Ok(snapshot)
}
