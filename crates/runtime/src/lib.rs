//! Commerce prerender runtime.
//!
//! Consumes the remote catalog event journal and maintains rendered product
//! pages on the delivery backend: for every affected SKU it fetches product
//! data, renders deterministic HTML, persists it to content-addressed blob
//! storage, and drives the preview → publish (and unpublish → delete)
//! lifecycle against the admin API. Runs resume safely after restarts,
//! deduplicate work, respect rate limits, and track the journal cursor.

pub mod admin;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod filter;
pub mod http;
pub mod journal;
pub mod orchestrator;
pub mod queue;
pub mod ratelimit;
pub mod render;
pub mod retry;
pub mod state;
pub mod storage;
pub mod types;

// Re-export the surface a deployment touches.
pub use admin::{AdminConfig, AdminError, AdminScheduler, BatchOutcome};
pub use auth::{AccessToken, AuthError, ImsCredentials, TokenManager};
pub use catalog::{CatalogClient, CatalogConfig, CatalogSource};
pub use config::{ConfigError, RuntimeConfig};
pub use filter::{FilterDecision, SkuFilter, SkuFilterConfig};
pub use http::{HttpClient, HttpError, RequestOptions};
pub use journal::{JournalClient, JournalConfig, JournalPage, JournalSource};
pub use orchestrator::{run, RuntimeContainer, RUNNING_KEY};
pub use queue::{DurableEventQueue, EnqueueOutcome, QueueConfig, QueueError, QueueStatus};
pub use ratelimit::{AcquireDecision, PersistentTokenBucket, RateLimiterConfig, TokenBucket};
pub use render::{RenderContext, RenderPipeline, RenderResult};
pub use retry::{backoff_with_jitter, run_with_retry, RetryPolicy};
pub use state::LocaleState;
pub use storage::{BlobStore, FileBlobs, FileKv, KvStore, MemoryBlobs, MemoryKv, StorageError};
pub use types::{
    BatchRecord, EventKind, JournalEvent, Priority, QueuedEvent, RunResult, RunState,
    RunStatistics, RuntimeError,
};
