//! Per-locale SKU state persisted as line-oriented records in blob storage.
//!
//! One line per SKU: `sku,last_rendered_at_ms,content_hash,last_published_path`.
//! Bad lines are skipped on load; state files are rewritten whole on save.

use std::collections::BTreeMap;

use crate::storage::{BlobStore, StorageError};
use crate::types::RuntimeError;

/// Blob path of the SKU-state record for a locale.
pub fn state_blob_path(locale: Option<&str>) -> String {
    format!(
        "check-product-changes/{}.state",
        locale.filter(|l| !l.is_empty()).unwrap_or("default")
    )
}

/// Blob path of the published-products index for a locale.
pub fn products_index_path(locale: Option<&str>) -> String {
    format!(
        "check-product-changes/{}-products.json",
        locale.filter(|l| !l.is_empty()).unwrap_or("default")
    )
}

/// State tracked for one SKU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkuStateEntry {
    /// Epoch milliseconds of the last render (including skipped renders).
    pub last_rendered_at: i64,
    pub content_hash: Option<String>,
    pub last_published_path: Option<String>,
}

/// All SKU state for one locale.
#[derive(Debug, Clone, Default)]
pub struct LocaleState {
    pub entries: BTreeMap<String, SkuStateEntry>,
}

impl LocaleState {
    /// Load the state for a locale; a missing blob yields empty state.
    pub async fn load(
        blobs: &dyn BlobStore,
        locale: Option<&str>,
    ) -> Result<Self, RuntimeError> {
        match blobs.read(&state_blob_path(locale)).await {
            Ok(bytes) => Ok(Self::parse(&String::from_utf8_lossy(&bytes))),
            Err(StorageError::NotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the state record for a locale.
    pub async fn save(
        &self,
        blobs: &dyn BlobStore,
        locale: Option<&str>,
    ) -> Result<(), RuntimeError> {
        blobs
            .write(&state_blob_path(locale), self.serialize().as_bytes())
            .await?;
        Ok(())
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(4, ',');
            let (Some(sku), Some(ts)) = (fields.next(), fields.next()) else {
                tracing::warn!(line, "malformed state line skipped");
                continue;
            };
            let Ok(last_rendered_at) = ts.parse::<i64>() else {
                tracing::warn!(line, "state line with bad timestamp skipped");
                continue;
            };
            let content_hash = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
            let last_published_path = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
            entries.insert(
                sku.to_string(),
                SkuStateEntry {
                    last_rendered_at,
                    content_hash,
                    last_published_path,
                },
            );
        }
        Self { entries }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (sku, entry) in &self.entries {
            out.push_str(&format!(
                "{},{},{},{}\n",
                sku,
                entry.last_rendered_at,
                entry.content_hash.as_deref().unwrap_or(""),
                entry.last_published_path.as_deref().unwrap_or(""),
            ));
        }
        out
    }

    pub fn content_hash(&self, sku: &str) -> Option<&str> {
        self.entries.get(sku)?.content_hash.as_deref()
    }

    /// Stamp a render without changing the stored hash (skip-if-unchanged).
    pub fn touch(&mut self, sku: &str, now_ms: i64) {
        self.entries.entry(sku.to_string()).or_default().last_rendered_at = now_ms;
    }

    /// Record a successful render and publish path.
    pub fn record(&mut self, sku: &str, now_ms: i64, hash: &str, path: &str) {
        self.entries.insert(
            sku.to_string(),
            SkuStateEntry {
                last_rendered_at: now_ms,
                content_hash: Some(hash.to_string()),
                last_published_path: Some(path.to_string()),
            },
        );
    }

    pub fn remove(&mut self, sku: &str) -> Option<SkuStateEntry> {
        self.entries.remove(sku)
    }

    pub fn skus(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Load the published-products index for a locale.
pub async fn load_products_index(
    blobs: &dyn BlobStore,
    locale: Option<&str>,
) -> Result<Vec<String>, RuntimeError> {
    match blobs.read(&products_index_path(locale)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        Err(StorageError::NotFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Persist the published-products index for a locale.
pub async fn save_products_index(
    blobs: &dyn BlobStore,
    locale: Option<&str>,
    skus: &[String],
) -> Result<(), RuntimeError> {
    let bytes = serde_json::to_vec(skus).unwrap_or_default();
    blobs.write(&products_index_path(locale), &bytes).await?;
    Ok(())
}
