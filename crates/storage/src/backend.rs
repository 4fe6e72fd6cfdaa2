//! Blob storage backend trait definition
//!
//! Defines the async interface the checkpoint manager and recovery loader
//! use to persist checkpoint blobs.

use async_trait::async_trait;
use bytes::Bytes;
use pserver_core::Result;

/// Async trait for blob storage backends
///
/// Paths are relative to the backend root and use `/` as separator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a directory and any missing parents
    ///
    /// Succeeds if the directory already exists.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Read data from the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path and flush it to durable storage
    ///
    /// The file is either fully written or not present at `path`.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete data at the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
