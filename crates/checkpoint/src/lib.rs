//! Checkpointing for a parameter server shard
//!
//! Provides the blob codec and checksum, the periodic checkpoint manager, and
//! the recovery loader used at startup.

pub mod checksum;
pub mod codec;
pub mod manager;
pub mod recovery;

pub use manager::{
    CheckpointManager, CheckpointManagerConfig, CheckpointManagerHandle, CheckpointStats,
    CheckpointTaskHandle, SnapshotSource,
};
pub use recovery::{load_checkpoint, load_meta};
