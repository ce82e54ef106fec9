//! Access-token lifecycle for the identity service.
//!
//! Tokens are obtained with the client-credentials grant, refreshed early
//! (before the refresh buffer elapses), cached in memory, and persisted to
//! the KV store so restarts reuse a still-valid token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{HttpClient, HttpError, RequestOptions};
use crate::storage::{KvStore, StorageError};

pub mod admin_token;

pub use admin_token::{validate_admin_token, AdminTokenClaims};

/// KV key holding the cached access token.
pub const ACCESS_TOKEN_KEY: &str = "adobe_io_access_token";

/// Default token lifetime when the issuer omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 86_400;

/// Tokens closer to expiry than this are refreshed.
const REFRESH_BUFFER: Duration = Duration::from_secs(300);

const TOKEN_SCOPE: &str = "adobeio_api,openid,read_organizations";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// One of client id, client secret, or IMS org id is empty.
    #[error("credentials missing: {field}")]
    CredentialsMissing { field: &'static str },

    /// The identity service rejected the grant.
    #[error("issuer rejected token request (HTTP {status}): {body}")]
    IssuerRejected { status: u16, body: String },

    #[error("token response malformed: {message}")]
    Malformed { message: String },

    #[error(transparent)]
    Transport(#[from] HttpError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Client-credentials grant inputs.
#[derive(Debug, Clone, Default)]
pub struct ImsCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub ims_org_id: String,
    pub endpoint: String,
}

/// A stored access token with issue and expiry stamps (epoch milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: u64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl AccessToken {
    /// Consumers never observe a token within the refresh buffer of expiry.
    pub fn is_valid(&self, now_ms: i64, buffer: Duration) -> bool {
        self.expires_at - now_ms > buffer.as_millis() as i64
    }
}

/// Manages the access token used against journal and identity-guarded APIs.
pub struct TokenManager {
    http: Arc<HttpClient>,
    kv: Arc<dyn KvStore>,
    credentials: ImsCredentials,
    refresh_buffer: Duration,
    // Also serves as the singleflight guard: concurrent refreshes collapse
    // onto whichever caller holds the lock first.
    cached: tokio::sync::Mutex<Option<AccessToken>>,
}

impl TokenManager {
    pub fn new(http: Arc<HttpClient>, kv: Arc<dyn KvStore>, credentials: ImsCredentials) -> Self {
        Self {
            http,
            kv,
            credentials,
            refresh_buffer: REFRESH_BUFFER,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Return a valid access token, refreshing early when the cached one is
    /// within the refresh buffer of expiry.
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp_millis();

        if let Some(token) = cached.as_ref() {
            if token.is_valid(now, self.refresh_buffer) {
                return Ok(token.access_token.clone());
            }
        }

        // Not in memory (or stale): try the KV copy before going to the
        // issuer, so restarts reuse a still-valid token.
        if let Some(entry) = self.kv.get(ACCESS_TOKEN_KEY).await? {
            if let Ok(token) = serde_json::from_value::<AccessToken>(entry.value) {
                if token.is_valid(now, self.refresh_buffer) {
                    let value = token.access_token.clone();
                    *cached = Some(token);
                    return Ok(value);
                }
            }
        }

        let token = self.fetch_token().await?;
        let value = token.access_token.clone();
        self.kv
            .put(
                ACCESS_TOKEN_KEY,
                serde_json::to_value(&token).map_err(|e| AuthError::Malformed {
                    message: e.to_string(),
                })?,
                Some(Duration::from_secs(token.expires_in)),
            )
            .await?;
        *cached = Some(token);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<AccessToken, AuthError> {
        self.check_credentials()?;

        tracing::info!(client_id = %self.credentials.client_id, "requesting access token");
        let fields = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.credentials.client_id.clone()),
            (
                "client_secret".to_string(),
                self.credentials.client_secret.clone(),
            ),
            ("scope".to_string(), TOKEN_SCOPE.to_string()),
        ];

        let response = self
            .http
            .request(
                "ims-token",
                &self.credentials.endpoint,
                RequestOptions::post_form(fields),
            )
            .await
            .map_err(|e| match e {
                HttpError::Status { status, body, .. } => {
                    AuthError::IssuerRejected { status, body }
                }
                other => AuthError::Transport(other),
            })?
            .ok_or_else(|| AuthError::Malformed {
                message: "empty token response".to_string(),
            })?;

        let access_token = response
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::Malformed {
                message: "response lacks access_token".to_string(),
            })?
            .to_string();
        let expires_in = response
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_EXPIRES_IN);
        let token_type = response
            .get("token_type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let created_at = Utc::now().timestamp_millis();
        Ok(AccessToken {
            access_token,
            token_type,
            expires_in,
            created_at,
            expires_at: created_at + (expires_in as i64) * 1000,
        })
    }

    fn check_credentials(&self) -> Result<(), AuthError> {
        if self.credentials.client_id.is_empty() {
            return Err(AuthError::CredentialsMissing { field: "client_id" });
        }
        if self.credentials.client_secret.is_empty() {
            return Err(AuthError::CredentialsMissing {
                field: "client_secret",
            });
        }
        if self.credentials.ims_org_id.is_empty() {
            return Err(AuthError::CredentialsMissing {
                field: "ims_org_id",
            });
        }
        Ok(())
    }

    pub fn ims_org_id(&self) -> &str {
        &self.credentials.ims_org_id
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }
}
