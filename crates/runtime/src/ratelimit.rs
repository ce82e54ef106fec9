//! Token-bucket rate limiting for admin-facing work.
//!
//! Refill is computed lazily on each call; the blocking [`TokenBucket::acquire`]
//! serves waiters in FIFO order. The persistent variant keeps its state in
//! the KV store and fails open on storage errors: rate limiting must never
//! block correctness.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::storage::KvStore;

/// KV key for the persistent publishing bucket.
pub const PUBLISHING_BUCKET_KEY: &str = "rate_limiter/publishing_bucket";

const PERSISTENT_STATE_TTL: Duration = Duration::from_secs(120);

/// Rate limiter knobs.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub max_tokens: u32,
    /// Tokens added per second.
    pub refill_rate: u32,
    pub acquire_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 20,
            refill_rate: 20,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a non-blocking acquisition attempt.
#[derive(Debug, Clone)]
pub struct AcquireDecision {
    pub allowed: bool,
    pub tokens_remaining: u32,
    pub requests_in_last_second: usize,
    pub retry_after_ms: Option<u64>,
}

/// Blocking acquire timed out.
#[derive(Debug, Error)]
#[error("rate limit acquire timed out after {timeout_ms} ms")]
pub struct AcquireTimeout {
    pub timeout_ms: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
    recent: VecDeque<Instant>,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// In-process token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
    notify: Notify,
}

impl TokenBucket {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
                recent: VecDeque::new(),
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            config,
            notify: Notify::new(),
        }
    }

    /// Consume one token if available; never blocks.
    pub fn try_acquire(&self) -> AcquireDecision {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        prune_recent(&mut state.recent, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            state.recent.push_back(now);
            AcquireDecision {
                allowed: true,
                tokens_remaining: state.tokens,
                requests_in_last_second: state.recent.len(),
                retry_after_ms: None,
            }
        } else {
            AcquireDecision {
                allowed: false,
                tokens_remaining: 0,
                requests_in_last_second: state.recent.len(),
                retry_after_ms: Some(self.ms_until_next_token(&state, now)),
            }
        }
    }

    /// Block until a token is available or the timeout elapses. Waiters are
    /// served in FIFO order.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), AcquireTimeout> {
        let deadline = Instant::now() + timeout;
        let ticket = {
            let mut state = self.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push_back(ticket);
            ticket
        };

        loop {
            let head_wait = {
                let now = Instant::now();
                let mut state = self.state.lock();
                self.refill(&mut state, now);
                prune_recent(&mut state.recent, now);

                if state.waiters.front() == Some(&ticket) {
                    if state.tokens > 0 {
                        state.tokens -= 1;
                        state.recent.push_back(now);
                        state.waiters.pop_front();
                        drop(state);
                        self.notify.notify_waiters();
                        return Ok(());
                    }
                    Some(Duration::from_millis(self.ms_until_next_token(&state, now)))
                } else {
                    None
                }
            };

            let now = Instant::now();
            if now >= deadline {
                let mut state = self.state.lock();
                state.waiters.retain(|t| *t != ticket);
                drop(state);
                self.notify.notify_waiters();
                return Err(AcquireTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let remaining = deadline - now;
            match head_wait {
                // Head of the queue: sleep until the next token accrues.
                Some(wait) => {
                    let wait = wait.min(remaining).max(Duration::from_millis(1));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                // Not at the head yet: wait to be woken.
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(remaining) => {}
                    }
                }
            }
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.config.refill_rate == 0 {
            return;
        }
        let elapsed_ms = now.duration_since(state.last_refill).as_millis() as u64;
        let new_tokens = elapsed_ms * self.config.refill_rate as u64 / 1000;
        if new_tokens == 0 {
            return;
        }
        state.tokens = state
            .tokens
            .saturating_add(new_tokens.min(u32::MAX as u64) as u32)
            .min(self.config.max_tokens);
        if state.tokens >= self.config.max_tokens {
            state.last_refill = now;
        } else {
            // Advance by the whole intervals actually consumed, keeping the
            // fractional remainder for the next refill.
            state.last_refill +=
                Duration::from_millis(new_tokens * 1000 / self.config.refill_rate as u64);
        }
    }

    fn ms_until_next_token(&self, state: &BucketState, now: Instant) -> u64 {
        if self.config.refill_rate == 0 {
            return u64::MAX;
        }
        let per_token_ms = (1000 / self.config.refill_rate as u64).max(1);
        let since_refill = now.duration_since(state.last_refill).as_millis() as u64;
        (per_token_ms - since_refill % per_token_ms).max(1)
    }
}

fn prune_recent(recent: &mut VecDeque<Instant>, now: Instant) {
    let window = Duration::from_secs(1);
    while let Some(front) = recent.front() {
        if now.duration_since(*front) > window {
            recent.pop_front();
        } else {
            break;
        }
    }
}

/// Persistent bucket state as stored in KV (epoch milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistentState {
    tokens: u32,
    last_refill_ms: i64,
    #[serde(default)]
    recent: Vec<i64>,
}

/// Token bucket whose state lives in the KV store, shared across processes.
///
/// On any storage failure the limiter fails open (allows the request) after
/// logging a warning.
pub struct PersistentTokenBucket {
    kv: Arc<dyn KvStore>,
    key: String,
    config: RateLimiterConfig,
}

impl PersistentTokenBucket {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimiterConfig) -> Self {
        Self {
            kv,
            key: PUBLISHING_BUCKET_KEY.to_string(),
            config,
        }
    }

    pub async fn try_acquire(&self) -> AcquireDecision {
        match self.try_acquire_inner().await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(error = %err, "rate limiter storage failed, failing open");
                AcquireDecision {
                    allowed: true,
                    tokens_remaining: self.config.max_tokens,
                    requests_in_last_second: 0,
                    retry_after_ms: None,
                }
            }
        }
    }

    async fn try_acquire_inner(&self) -> Result<AcquireDecision, crate::storage::StorageError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = match self.kv.get(&self.key).await? {
            Some(entry) => serde_json::from_value::<PersistentState>(entry.value)
                .unwrap_or_else(|_| self.fresh_state(now_ms)),
            None => self.fresh_state(now_ms),
        };

        // Lazy refill on epoch-millisecond arithmetic.
        if self.config.refill_rate > 0 {
            let elapsed_ms = (now_ms - state.last_refill_ms).max(0) as u64;
            let new_tokens = elapsed_ms * self.config.refill_rate as u64 / 1000;
            if new_tokens > 0 {
                state.tokens = state
                    .tokens
                    .saturating_add(new_tokens.min(u32::MAX as u64) as u32)
                    .min(self.config.max_tokens);
                if state.tokens >= self.config.max_tokens {
                    state.last_refill_ms = now_ms;
                } else {
                    state.last_refill_ms +=
                        (new_tokens * 1000 / self.config.refill_rate as u64) as i64;
                }
            }
        }
        state.recent.retain(|t| now_ms - *t <= 1000);

        let decision = if state.tokens > 0 {
            state.tokens -= 1;
            state.recent.push(now_ms);
            AcquireDecision {
                allowed: true,
                tokens_remaining: state.tokens,
                requests_in_last_second: state.recent.len(),
                retry_after_ms: None,
            }
        } else {
            let per_token_ms = if self.config.refill_rate == 0 {
                u64::MAX
            } else {
                (1000 / self.config.refill_rate as u64).max(1)
            };
            AcquireDecision {
                allowed: false,
                tokens_remaining: 0,
                requests_in_last_second: state.recent.len(),
                retry_after_ms: Some(per_token_ms),
            }
        };

        self.kv
            .put(
                &self.key,
                serde_json::to_value(&state).unwrap_or_default(),
                Some(PERSISTENT_STATE_TTL),
            )
            .await?;
        Ok(decision)
    }

    fn fresh_state(&self, now_ms: i64) -> PersistentState {
        PersistentState {
            tokens: self.config.max_tokens,
            last_refill_ms: now_ms,
            recent: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvEntry, MemoryKv, StorageError};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn config(max_tokens: u32, refill_rate: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            max_tokens,
            refill_rate,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bound_is_enforced() {
        let bucket = TokenBucket::new(config(2, 1));
        assert!(bucket.try_acquire().allowed);
        assert!(bucket.try_acquire().allowed);
        let denied = bucket.try_acquire();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms.unwrap() > 0);
        assert_eq!(denied.requests_in_last_second, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let bucket = TokenBucket::new(config(2, 2));
        assert!(bucket.try_acquire().allowed);
        assert!(bucket.try_acquire().allowed);
        assert!(!bucket.try_acquire().allowed);

        tokio::time::advance(Duration::from_millis(500)).await;
        // 500 ms at 2 tokens/s accrues exactly one token.
        assert!(bucket.try_acquire().allowed);
        assert!(!bucket.try_acquire().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_serves_waiters_in_fifo_order() {
        let bucket = Arc::new(TokenBucket::new(config(1, 1)));
        bucket.try_acquire();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let bucket = bucket.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire(Duration::from_secs(10)).await.unwrap();
                order.lock().push(i);
            }));
            // Let the waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_times_out() {
        let bucket = TokenBucket::new(config(1, 0));
        bucket.try_acquire();
        let err = bucket.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.timeout_ms, 50);
    }

    #[tokio::test]
    async fn persistent_bucket_consumes_and_persists() {
        let kv = Arc::new(MemoryKv::new());
        let bucket = PersistentTokenBucket::new(kv.clone(), config(2, 0));
        assert!(bucket.try_acquire().await.allowed);
        assert!(bucket.try_acquire().await.allowed);
        assert!(!bucket.try_acquire().await.allowed);
        assert!(kv.get(PUBLISHING_BUCKET_KEY).await.unwrap().is_some());
    }

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn get(&self, _key: &str) -> Result<Option<KvEntry>, StorageError> {
            Err(StorageError::io("backend down"))
        }

        async fn put(
            &self,
            _key: &str,
            _value: serde_json::Value,
            _ttl: Option<Duration>,
        ) -> Result<(), StorageError> {
            Err(StorageError::io("backend down"))
        }

        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::io("backend down"))
        }
    }

    #[tokio::test]
    async fn persistent_bucket_fails_open_on_storage_errors() {
        let bucket = PersistentTokenBucket::new(Arc::new(FailingKv), config(1, 0));
        assert!(bucket.try_acquire().await.allowed);
        assert!(bucket.try_acquire().await.allowed);
    }
}
