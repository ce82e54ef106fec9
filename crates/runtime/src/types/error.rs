//! Error taxonomy for the prerender runtime.
//!
//! Subsystem errors live next to their modules; this module aggregates them
//! into [`RuntimeError`] and carries the variants that classify how a
//! failure propagates: per-SKU errors never abort a batch, batch errors
//! never abort a run, global errors abort the run.

use thiserror::Error;

use crate::admin::AdminError;
use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Top-level runtime error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Missing or malformed configuration, bad URL, bad path template.
    /// Fatal to the run.
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    /// The catalog has no product for this SKU. Per-SKU ignorable.
    #[error("product not found: {sku}")]
    NotFound { sku: String },

    /// A rate-limit acquire timed out; the caller typically routes the
    /// event to the durable queue instead.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Orchestrator-level fatal wrapper: a step cannot safely continue.
    #[error("job failed: {0}")]
    JobFailed(String),
}

impl RuntimeError {
    /// Whether this error aborts the whole run (as opposed to being
    /// recovered per SKU or per batch).
    pub fn is_fatal(&self) -> bool {
        match self {
            RuntimeError::Validation(_)
            | RuntimeError::Config(_)
            | RuntimeError::Auth(_)
            | RuntimeError::JobFailed(_) => true,
            RuntimeError::Admin(err) => err.is_global(),
            RuntimeError::NotFound { .. } | RuntimeError::RateLimited(_) => false,
            RuntimeError::Http(_) | RuntimeError::Storage(_) | RuntimeError::Queue(_) => false,
        }
    }
}
