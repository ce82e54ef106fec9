//! File-backed storage backends.
//!
//! `FileKv` keeps the whole key space in one JSON map file, loaded and
//! persisted under an async lock; `FileBlobs` maps blob paths onto a
//! directory tree. Suitable for single-process deployments and the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{BlobStore, KvEntry, KvStore, StorageError};

/// KV store persisted as a single JSON map file.
pub struct FileKv {
    path: PathBuf,
    // Guards the whole load-modify-persist cycle.
    lock: Mutex<()>,
}

impl FileKv {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<HashMap<String, KvEntry>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization {
                message: format!("corrupt kv file {}: {e}", self.path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::io(e)),
        }
    }

    async fn persist(&self, entries: &HashMap<String, KvEntry>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::io)?;
        }
        let bytes = serde_json::to_vec_pretty(entries).map_err(|e| StorageError::Serialization {
            message: e.to_string(),
        })?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(StorageError::io)
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let now = Utc::now().timestamp_millis();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                self.persist(&entries).await?;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), KvEntry::new(value, ttl));
        self.persist(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }
}

/// Blob store rooted at a directory; blob paths map to files beneath it.
pub struct FileBlobs {
    root: PathBuf,
}

impl FileBlobs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FileBlobs {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(StorageError::io(e)),
        }
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::io)?;
        }
        tokio::fs::write(target, bytes).await.map_err(StorageError::io)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_start_matches('/');
        let mut paths = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(StorageError::io)? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(blob_path) = blob_path_of(&self.root, &path) {
                    if blob_path.trim_start_matches('/').starts_with(prefix) {
                        paths.push(blob_path);
                    }
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn blob_path_of(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    Some(format!("/{}", relative.to_string_lossy().replace('\\', "/")))
}
