//! Shared HTTP client wrapper.
//!
//! Every remote exchange in the runtime (admin, catalog, identity, journal)
//! goes through [`HttpClient`]; no other module touches response plumbing.
//! Non-2xx responses are shaped into [`HttpError::Status`] carrying the
//! upstream correlation header (`x-error`) and a truncated body.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const BODY_TRUNCATE: usize = 500;
const USER_AGENT: &str = concat!("prerender-runtime/", env!("CARGO_PKG_VERSION"));

/// Errors produced by the HTTP wrapper.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-2xx response from the upstream.
    #[error("{name} returned HTTP {status} (x-error: {}): {body}", .x_error.as_deref().unwrap_or("-"))]
    Status {
        name: String,
        status: u16,
        x_error: Option<String>,
        body: String,
    },

    /// Transport-level failure (connect, timeout, TLS).
    #[error("{name} transport error: {message}")]
    Transport { name: String, message: String },

    /// Response body could not be decoded as JSON.
    #[error("{name} returned undecodable body: {message}")]
    Decode { name: String, message: String },

    /// Request could not be constructed (bad URL or header).
    #[error("{name} request invalid: {message}")]
    InvalidRequest { name: String, message: String },
}

impl HttpError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Request body payloads accepted by [`HttpClient::request`].
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post_json(body: serde_json::Value) -> Self {
        Self {
            method: Some(Method::POST),
            body: Some(RequestBody::Json(body)),
            ..Self::default()
        }
    }

    pub fn post_form(fields: Vec<(String, String)>) -> Self {
        Self {
            method: Some(Method::POST),
            body: Some(RequestBody::Form(fields)),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Thin wrapper over `reqwest::Client` with uniform timeout handling,
/// JSON decoding, and structured error shaping.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Perform a request and decode the response as JSON.
    ///
    /// Returns `None` for responses without a decodable body (204 and other
    /// bodyless 2xx); statuses in `200..204` are decoded. Non-2xx responses
    /// become [`HttpError::Status`].
    pub async fn request(
        &self,
        name: &str,
        url: &str,
        opts: RequestOptions,
    ) -> Result<Option<serde_json::Value>, HttpError> {
        let (status, _headers, body) = self.execute(name, url, opts).await?;
        if status >= 204 {
            return Ok(None);
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| HttpError::Decode {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Perform a request and return the raw response text.
    ///
    /// Used where the upstream speaks a non-JSON or line-oriented format
    /// (journal JSONL, HTML templates).
    pub async fn request_text(
        &self,
        name: &str,
        url: &str,
        opts: RequestOptions,
    ) -> Result<Option<String>, HttpError> {
        let (status, _headers, body) = self.execute(name, url, opts).await?;
        if status == 204 {
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn execute(
        &self,
        name: &str,
        url: &str,
        opts: RequestOptions,
    ) -> Result<(u16, HeaderMap, String), HttpError> {
        let method = opts.method.unwrap_or(Method::GET);
        let mut headers = HeaderMap::new();
        for (key, value) in &opts.headers {
            let key = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                HttpError::InvalidRequest {
                    name: name.to_string(),
                    message: format!("bad header name {key:?}: {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| HttpError::InvalidRequest {
                name: name.to_string(),
                message: format!("bad header value: {e}"),
            })?;
            headers.insert(key, value);
        }

        let mut builder = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(opts.timeout.unwrap_or(self.default_timeout));

        builder = match opts.body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Form(fields)) => builder.form(&fields),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| HttpError::Transport {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let x_error = response_headers
                .get("x-error")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            tracing::debug!(
                operation = name,
                status = status.as_u16(),
                x_error = x_error.as_deref().unwrap_or(""),
                "request failed"
            );
            return Err(HttpError::Status {
                name: name.to_string(),
                status: status.as_u16(),
                x_error,
                body: truncate(&body, BODY_TRUNCATE),
            });
        }

        Ok((status.as_u16(), response_headers, body))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
