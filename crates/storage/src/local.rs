//! Local filesystem blob storage
//!
//! Writes go to a hidden temp file that is synced and then renamed into
//! place, so a reader never observes a partially written blob.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use pserver_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Blob storage under a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of a storage path; leading slashes are ignored
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Hidden sibling that a write goes to before being renamed into place
    fn staging_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
    }

    fn is_staging_file(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(".tmp")
    }

    /// Storage path of a file under the root, with `/` separators
    fn storage_path(&self, file: &Path) -> Option<String> {
        file.strip_prefix(&self.root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }
}

fn storage_error(action: &str, path: impl std::fmt::Debug, err: io::Error) -> Error {
    Error::Storage {
        message: format!("{action} {path:?}: {err}"),
    }
}

/// Like [`storage_error`] but a missing file becomes `StoragePathNotFound`
fn path_error(action: &str, path: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: path.to_string(),
        }
    } else {
        storage_error(action, path, err)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_dir(&self, path: &str) -> Result<()> {
        let dir = self.resolve_path(path);
        if fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Ok(());
        }

        debug!(?dir, "Creating directory");
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error("create directory", &dir, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.resolve_path(path))
            .await
            .map_err(|e| path_error("read", path, e))?;
        debug!(size = data.len(), "Blob read");
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.resolve_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("create directory", parent, e))?;
        }

        let staging = Self::staging_path(&target);
        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| storage_error("create", &staging, e))?;

        let synced = async {
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = synced {
            let _ = fs::remove_file(&staging).await;
            return Err(storage_error("write", path, e));
        }

        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(storage_error("publish", path, e));
        }

        debug!(?target, "Blob written");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve_path(path))
            .await
            .map_err(|e| path_error("delete", path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve_path(path)).await.unwrap_or(false))
    }

    /// Files whose storage path starts with `prefix`, sorted
    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let entry_path = entry.path();

                if file_type.is_dir() {
                    // Only descend where a match is still possible
                    if let Some(rel) = self.storage_path(&entry_path) {
                        if prefix.starts_with(&rel) || rel.starts_with(prefix) {
                            pending.push(entry_path);
                        }
                    }
                } else if file_type.is_file()
                    && !Self::is_staging_file(&entry.file_name().to_string_lossy())
                {
                    if let Some(rel) = self.storage_path(&entry_path) {
                        if rel.starts_with(prefix) {
                            found.push(rel);
                        }
                    }
                }
            }
        }

        found.sort();
        debug!(count = found.len(), "Listed blobs");
        Ok(found)
    }
}
