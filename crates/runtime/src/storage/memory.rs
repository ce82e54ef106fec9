//! In-memory storage backends, used by tests and local runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{BlobStore, KvEntry, KvStore, StorageError};

/// In-memory KV store with lazy TTL eviction.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StorageError> {
        let now = Utc::now().timestamp_millis();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
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
        self.entries
            .lock()
            .insert(key.to_string(), KvEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// In-memory blob store keyed by path.
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.blobs.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.blobs.lock().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut paths: Vec<String> = self
            .blobs
            .lock()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn kv_read_your_writes() {
        let kv = MemoryKv::new();
        kv.put("running", json!(true), None).await.unwrap();
        let entry = kv.get("running").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(true));
        kv.delete("running").await.unwrap();
        assert!(kv.get("running").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kv_expired_entries_are_evicted_on_read() {
        let kv = MemoryKv::new();
        kv.put("token", json!("abc"), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(kv.get("token").await.unwrap().is_none());
        assert_eq!(kv.len(), 0);
    }

    #[tokio::test]
    async fn blob_list_filters_by_prefix() {
        let blobs = MemoryBlobs::new();
        blobs.write("/public/pdps/a.html", b"a").await.unwrap();
        blobs.write("/public/pdps/b.html", b"b").await.unwrap();
        blobs.write("/other/c.html", b"c").await.unwrap();
        let listed = blobs.list("/public/pdps/").await.unwrap();
        assert_eq!(listed, vec!["/public/pdps/a.html", "/public/pdps/b.html"]);
    }

    #[tokio::test]
    async fn blob_read_missing_is_not_found() {
        let blobs = MemoryBlobs::new();
        let err = blobs.read("/missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
