//! Durable event queue backed by a single KV record.
//!
//! The whole queue lives under one key; every mutation is a
//! load-modify-store cycle. Ordering is by priority (high before normal
//! before low) with stable FIFO within a priority. Entries carry a retry
//! counter and are deduplicated by `(sku, kind)` within the dedup window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{KvStore, StorageError};
use crate::types::QueuedEvent;

/// KV key holding the pending-events record.
pub const PENDING_EVENTS_KEY: &str = "event_queue/pending_events";

/// Queue knobs.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub dedup_window: Duration,
    pub queue_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            batch_size: 5,
            max_retries: 3,
            dedup_window: Duration::from_millis(300_000),
            queue_ttl: Duration::from_secs(3600),
        }
    }
}

/// Errors produced by the durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("queue record malformed: {message}")]
    Malformed { message: String },
}

/// Monotonic counters persisted alongside the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub processed: u64,
    pub failed: u64,
    pub duplicate: u64,
    pub expired: u64,
    pub dropped: u64,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { position: usize, queue_size: usize },
    /// An entry with the same `(sku, kind)` is already queued within the
    /// dedup window.
    DuplicateRejected,
    /// Capacity pressure left no room for the event at all.
    Dropped,
}

/// Snapshot returned by [`DurableEventQueue::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub by_priority: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub statistics: QueueStatistics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueRecord {
    #[serde(default)]
    events: Vec<QueuedEvent>,
    #[serde(default)]
    statistics: QueueStatistics,
}

/// KV-backed priority queue with dedup, TTL, bounded capacity, and retry
/// accounting.
pub struct DurableEventQueue {
    kv: Arc<dyn KvStore>,
    config: QueueConfig,
}

impl DurableEventQueue {
    pub fn new(kv: Arc<dyn KvStore>, config: QueueConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue an event, deduplicating against pending entries and evicting
    /// the oldest entries under capacity pressure.
    pub async fn enqueue(&self, event: QueuedEvent) -> Result<EnqueueOutcome, QueueError> {
        let mut record = self.load().await?;
        let now = Utc::now().timestamp_millis();
        let window_ms = self.config.dedup_window.as_millis() as i64;

        let duplicate = record.events.iter().any(|e| {
            e.sku == event.sku && e.kind == event.kind && e.queued_at > now - window_ms
        });
        if duplicate {
            record.statistics.duplicate += 1;
            self.store(&record).await?;
            tracing::debug!(sku = %event.sku, kind = %event.kind, "duplicate event rejected");
            return Ok(EnqueueOutcome::DuplicateRejected);
        }

        if self.config.max_queue_size == 0 {
            record.statistics.dropped += 1;
            self.store(&record).await?;
            return Ok(EnqueueOutcome::Dropped);
        }

        // Bounded buffer: evict the oldest entries rather than rejecting
        // the newcomer.
        while record.events.len() >= self.config.max_queue_size {
            let evict = record
                .events
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.queued_at)
                .map(|(i, _)| i);
            match evict {
                Some(i) => {
                    let evicted = record.events.remove(i);
                    record.statistics.dropped += 1;
                    tracing::warn!(sku = %evicted.sku, "queue at capacity, dropping oldest event");
                }
                None => break,
            }
        }

        let id = event.id.clone();
        record.events.push(event);
        sort_by_priority(&mut record.events);
        let position = record
            .events
            .iter()
            .position(|e| e.id == id)
            .unwrap_or(record.events.len() - 1);
        let queue_size = record.events.len();
        self.store(&record).await?;
        Ok(EnqueueOutcome::Queued {
            position,
            queue_size,
        })
    }

    /// Take up to `batch_size` events in priority order. Events remain
    /// queued until [`mark_processed`](Self::mark_processed) removes them.
    pub async fn dequeue(&self, batch_size: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        let mut record = self.load().await?;
        let now = Utc::now().timestamp_millis();
        let count = batch_size.min(record.events.len());
        let batch: Vec<QueuedEvent> = record.events.iter().take(count).cloned().collect();
        for event in record.events.iter_mut().take(count) {
            event.last_attempt_at = Some(now);
        }
        self.store(&record).await?;
        Ok(batch)
    }

    /// Settle a batch: successful events are removed; failed events gain an
    /// attempt and are removed once `attempts` reaches `max_retries`.
    ///
    /// Returns `(settled, remaining)`.
    pub async fn mark_processed(
        &self,
        ids: &[String],
        success: bool,
    ) -> Result<(usize, usize), QueueError> {
        let mut record = self.load().await?;
        let mut settled = 0usize;
        let max_retries = self.config.max_retries;

        let QueueRecord { events, statistics } = &mut record;
        events.retain_mut(|event| {
            if !ids.contains(&event.id) {
                return true;
            }
            if success {
                statistics.processed += 1;
                settled += 1;
                return false;
            }
            event.attempts += 1;
            if event.attempts >= max_retries {
                statistics.failed += 1;
                settled += 1;
                tracing::warn!(sku = %event.sku, attempts = event.attempts, "event failed permanently");
                false
            } else {
                true
            }
        });

        let remaining = record.events.len();
        self.store(&record).await?;
        Ok((settled, remaining))
    }

    /// Current queue composition and statistics.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let record = self.load_and_sync().await?;
        let mut by_priority: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for event in &record.events {
            *by_priority
                .entry(format!("{:?}", event.priority).to_lowercase())
                .or_default() += 1;
            *by_type.entry(event.kind.to_string()).or_default() += 1;
        }
        Ok(QueueStatus {
            queue_size: record.events.len(),
            by_priority,
            by_type,
            statistics: record.statistics,
        })
    }

    /// Drop all pending events. Statistics survive.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut record = self.load().await?;
        record.events.clear();
        self.store(&record).await
    }

    /// Load the record and purge entries older than the queue TTL.
    async fn load(&self) -> Result<QueueRecord, QueueError> {
        let mut record = match self.kv.get(PENDING_EVENTS_KEY).await? {
            Some(entry) => serde_json::from_value(entry.value).map_err(|e| {
                QueueError::Malformed {
                    message: e.to_string(),
                }
            })?,
            None => QueueRecord::default(),
        };

        let now = Utc::now().timestamp_millis();
        let ttl_ms = self.config.queue_ttl.as_millis() as i64;
        let before = record.events.len();
        record.events.retain(|e| e.queued_at >= now - ttl_ms);
        let purged = before - record.events.len();
        if purged > 0 {
            record.statistics.expired += purged as u64;
            tracing::info!(purged, "expired events purged from queue");
        }
        Ok(record)
    }

    /// Load and, when the TTL purge removed something, persist the cleanup.
    async fn load_and_sync(&self) -> Result<QueueRecord, QueueError> {
        let record = self.load().await?;
        self.store(&record).await?;
        Ok(record)
    }

    async fn store(&self, record: &QueueRecord) -> Result<(), QueueError> {
        let value = serde_json::to_value(record).map_err(|e| QueueError::Malformed {
            message: e.to_string(),
        })?;
        self.kv.put(PENDING_EVENTS_KEY, value, None).await?;
        Ok(())
    }
}

/// Stable sort: priority rank first, FIFO (enqueue time) within a priority.
fn sort_by_priority(events: &mut [QueuedEvent]) {
    events.sort_by_key(|e| (e.priority.rank(), e.queued_at));
}
