//! Metadata store clients
//!
//! A metadata store keeps small records, such as the current checkpoint
//! pointer of each shard, under string keys. Every call carries a timeout; a
//! call that exceeds it fails with `Error::Timeout` and has no other effect on
//! the caller.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pserver_core::{Error, Result};
use tracing::{debug, instrument};

use crate::{LocalStorage, StorageBackend};

/// Async trait for metadata store clients
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the record stored under `key`
    ///
    /// Returns `Ok(None)` when the key does not exist.
    async fn get_key(&self, key: &str, timeout: Duration) -> Result<Option<Bytes>>;

    /// Store `value` under `key`
    ///
    /// With `must_not_exist` set, fails if the key already holds a record.
    async fn put_key(
        &self,
        key: &str,
        value: Bytes,
        timeout: Duration,
        must_not_exist: bool,
    ) -> Result<()>;
}

/// Run a metadata store operation under a timeout
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn key_exists(key: &str) -> Error {
    Error::MetadataStore {
        message: format!("key already exists: {}", key),
    }
}

/// In-process metadata store
///
/// Records live as long as the store. Used for tests and single-process
/// deployments that do not need recovery across restarts.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: DashMap<String, Bytes>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.records.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_key(&self, key: &str, timeout: Duration) -> Result<Option<Bytes>> {
        with_timeout("get_key", timeout, async {
            Ok(self.records.get(key).map(|v| v.value().clone()))
        })
        .await
    }

    async fn put_key(
        &self,
        key: &str,
        value: Bytes,
        timeout: Duration,
        must_not_exist: bool,
    ) -> Result<()> {
        with_timeout("put_key", timeout, async {
            match self.records.entry(key.to_string()) {
                Entry::Occupied(_) if must_not_exist => Err(key_exists(key)),
                Entry::Occupied(mut entry) => {
                    entry.insert(value);
                    Ok(())
                }
                Entry::Vacant(entry) => {
                    entry.insert(value);
                    Ok(())
                }
            }
        })
        .await
    }
}

/// Metadata store keeping one file per key under a local directory
///
/// Keys map to paths relative to the root, so `/checkpoints/0` lives at
/// `<root>/checkpoints/0`. Records survive restarts of the process.
#[derive(Debug)]
pub struct LocalMetadataStore {
    storage: LocalStorage,

    /// Serializes puts so `must_not_exist` checks are atomic in-process
    put_lock: tokio::sync::Mutex<()>,
}

impl LocalMetadataStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            storage: LocalStorage::new(root),
            put_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn record_path(key: &str) -> Result<&str> {
        let path = key.trim_start_matches('/');
        if path.is_empty() || path.split('/').any(|part| part == "..") {
            return Err(Error::MetadataStore {
                message: format!("invalid key: {:?}", key),
            });
        }
        Ok(path)
    }
}

#[async_trait]
impl MetadataStore for LocalMetadataStore {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn get_key(&self, key: &str, timeout: Duration) -> Result<Option<Bytes>> {
        let path = Self::record_path(key)?;
        with_timeout("get_key", timeout, async {
            match self.storage.read(path).await {
                Ok(value) => Ok(Some(value)),
                Err(Error::StoragePathNotFound { .. }) => Ok(None),
                Err(e) => Err(Error::MetadataStore {
                    message: e.to_string(),
                }),
            }
        })
        .await
    }

    #[instrument(skip(self, value), fields(backend = "local", size = value.len()))]
    async fn put_key(
        &self,
        key: &str,
        value: Bytes,
        timeout: Duration,
        must_not_exist: bool,
    ) -> Result<()> {
        let path = Self::record_path(key)?;
        with_timeout("put_key", timeout, async {
            let _guard = self.put_lock.lock().await;
            if must_not_exist && self.storage.exists(path).await? {
                return Err(key_exists(key));
            }
            self.storage
                .write(path, value)
                .await
                .map_err(|e| Error::MetadataStore {
                    message: e.to_string(),
                })?;
            debug!(key, "Metadata record stored");
            Ok(())
        })
        .await
    }
}
