//! Durable key/value and blob storage interfaces.
//!
//! The runtime delegates durable storage to external providers with
//! at-most-once PUT semantics and per-key TTL. Both capabilities are
//! best-effort: reads may transiently fail and callers compensate with
//! retries where the operation is safe to retry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::{FileBlobs, FileKv};
pub use memory::{MemoryBlobs, MemoryKv};

/// Errors produced by storage backends.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("storage I/O error: {message}")]
    Io { message: String },

    #[error("storage serialization error: {message}")]
    Serialization { message: String },
}

impl StorageError {
    pub fn io(message: impl std::fmt::Display) -> Self {
        StorageError::Io {
            message: message.to_string(),
        }
    }
}

/// A value read from the KV store, with its expiry when one was set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: serde_json::Value,
    /// Epoch milliseconds; `None` means the entry never expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl KvEntry {
    pub fn new(value: serde_json::Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Utc::now().timestamp_millis() + t.as_millis() as i64),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// Durable key/value store with per-key TTL.
///
/// Writes must be read-your-writes within the same process but need not be
/// globally linearizable. Expired entries are evicted lazily on read.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StorageError>;

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Durable blob store addressed by path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
