//! Storage - blob storage and metadata store backends for the parameter server
//!
//! Provides the two collaborators the checkpoint protocol writes through:
//! - **Blob storage** ([`StorageBackend`]): durable checkpoint files, with a
//!   local filesystem implementation
//! - **Metadata store** ([`MetadataStore`]): small consistent records keyed by
//!   shard, with in-memory and local-directory implementations
//!
//! # Example
//!
//! ```no_run
//! use storage::{LocalStorage, StorageBackend};
//! use bytes::Bytes;
//!
//! # async fn example() -> pserver_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/pserver");
//! storage.create_dir("checkpoints").await?;
//! storage.write("checkpoints/blob", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("checkpoints/blob").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
pub mod metadata;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use metadata::{LocalMetadataStore, MemoryMetadataStore, MetadataStore};
