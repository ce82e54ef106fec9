//! Core domain types shared across the prerender runtime.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::RuntimeError;

/// Kind of catalog mutation carried by a journal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProductUpdate,
    PriceUpdate,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::ProductUpdate => write!(f, "product_update"),
            EventKind::PriceUpdate => write!(f, "price_update"),
        }
    }
}

/// Processing priority for queued events.
///
/// Ordered so that `High` sorts before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Rank used for queue ordering; lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// An event held in the durable event queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: String,
    pub sku: String,
    pub kind: EventKind,
    #[serde(default)]
    pub priority: Priority,
    /// Enqueue time, epoch milliseconds.
    pub queued_at: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueuedEvent {
    pub fn new(sku: impl Into<String>, kind: EventKind, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sku: sku.into(),
            kind,
            priority,
            queued_at: Utc::now().timestamp_millis(),
            attempts: 0,
            last_attempt_at: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Where a SKU was located inside a journal event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkuLocation {
    /// `data.sku`
    Data,
    /// `data.product.sku`
    NestedProduct,
}

/// A raw event pulled from the journal, position attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    /// Opaque cursor position issued by the journal service.
    pub position: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JournalEvent {
    /// Extract the SKU from the event payload.
    ///
    /// Tries `data.sku` first, then `data.product.sku`. Events carrying
    /// neither are dropped by the consumer.
    pub fn sku(&self) -> Option<(String, SkuLocation)> {
        if let Some(sku) = self.data.get("sku").and_then(|v| v.as_str()) {
            return Some((sku.to_string(), SkuLocation::Data));
        }
        if let Some(sku) = self
            .data
            .get("product")
            .and_then(|p| p.get("sku"))
            .and_then(|v| v.as_str())
        {
            return Some((sku.to_string(), SkuLocation::NestedProduct));
        }
        None
    }

    /// Optional URL key, when the producer included one.
    pub fn url_key(&self) -> Option<String> {
        self.data
            .get("urlKey")
            .or_else(|| self.data.get("url_key"))
            .or_else(|| self.data.get("product").and_then(|p| p.get("urlKey")))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Kind of mutation, judged by the event-type suffix.
    pub fn kind(&self) -> Option<EventKind> {
        if self.event_type.ends_with("price.update") {
            Some(EventKind::PriceUpdate)
        } else if self.event_type.ends_with("product.update") {
            Some(EventKind::ProductUpdate)
        } else {
            None
        }
    }
}

/// Per-record lifecycle state for one admin batch entry.
///
/// Created when a rendered page is queued for preview; stage timestamps are
/// stamped as the batch moves through preview/publish (or the unpublish
/// pair for deletions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub sku: String,
    pub path: String,
    pub rendered_at: DateTime<Utc>,
    #[serde(default)]
    pub previewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub live_unpublished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preview_unpublished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchRecord {
    pub fn new(sku: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            path: path.into(),
            rendered_at: Utc::now(),
            previewed_at: None,
            published_at: None,
            live_unpublished_at: None,
            preview_unpublished_at: None,
            failed: false,
            error: None,
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.failed = true;
        self.error = Some(error.into());
    }
}

/// Progress counters reported by an admin bulk job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub failed: u64,
}

/// Handle for an asynchronous admin bulk job. Terminal state is `stopped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminJobHandle {
    pub topic: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default)]
    pub details_link: Option<String>,
}

/// Overall outcome of one orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Completed,
    Error,
    Skipped,
}

/// Counters describing partial or complete progress of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub events_fetched: u64,
    pub unique_skus: u64,
    pub processed: u64,
    pub failed: u64,
    pub published: u64,
    pub unpublished: u64,
    pub ignored: u64,
}

/// Result document returned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunState,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub statistics: RunStatistics,
    #[serde(default)]
    pub timings: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn skipped() -> Self {
        Self {
            status: RunState::Skipped,
            elapsed_ms: 0,
            statistics: RunStatistics::default(),
            timings: HashMap::new(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sku_extraction_prefers_top_level() {
        let event = JournalEvent {
            position: "p1".into(),
            event_type: "com.adobe.commerce.product.update".into(),
            data: json!({"sku": "ADB177", "product": {"sku": "NESTED"}}),
        };
        assert_eq!(event.sku(), Some(("ADB177".into(), SkuLocation::Data)));
    }

    #[test]
    fn sku_extraction_falls_back_to_nested_product() {
        let event = JournalEvent {
            position: "p2".into(),
            event_type: "com.adobe.commerce.price.update".into(),
            data: json!({"product": {"sku": "ADB177"}}),
        };
        assert_eq!(
            event.sku(),
            Some(("ADB177".into(), SkuLocation::NestedProduct))
        );
        assert_eq!(event.kind(), Some(EventKind::PriceUpdate));
    }

    #[test]
    fn sku_extraction_missing_yields_none() {
        let event = JournalEvent {
            position: "p3".into(),
            event_type: "com.adobe.commerce.product.update".into(),
            data: json!({"other": true}),
        };
        assert!(event.sku().is_none());
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }
}
