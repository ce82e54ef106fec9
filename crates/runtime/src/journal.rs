//! Journal consumer: cursor-based pull from the remote event journal.
//!
//! The journal signals end-of-stream with a 500 by convention; 400/404
//! likewise map to an empty page with the cursor unchanged. Responses are
//! either a JSON envelope (`{"events": [...], "_page": {}}`), a bare
//! array, or newline-delimited JSON.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::TokenManager;
use crate::http::{HttpClient, HttpError, RequestOptions};
use crate::storage::KvStore;
use crate::types::{JournalEvent, RuntimeError};

/// KV key holding the persisted journal cursor.
pub const EVENTS_POSITION_KEY: &str = "events_position";

/// Journal endpoint configuration.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub url: String,
    /// Event-type suffixes to keep; everything else is discarded.
    pub event_type_suffixes: Vec<String>,
}

impl JournalConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            event_type_suffixes: vec!["product.update".to_string(), "price.update".to_string()],
        }
    }
}

/// One page of journal events.
#[derive(Debug, Clone, Default)]
pub struct JournalPage {
    pub events: Vec<JournalEvent>,
    /// Position of the last event fetched; `None` when the page was empty.
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Source of journal pages. The HTTP client implements this; tests provide
/// scripted implementations.
#[async_trait]
pub trait JournalSource: Send + Sync {
    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<JournalPage, RuntimeError>;
}

/// HTTP journal client authenticated with the access token.
pub struct JournalClient {
    http: Arc<HttpClient>,
    tokens: Arc<TokenManager>,
    config: JournalConfig,
}

impl JournalClient {
    pub fn new(http: Arc<HttpClient>, tokens: Arc<TokenManager>, config: JournalConfig) -> Self {
        Self {
            http,
            tokens,
            config,
        }
    }
}

#[async_trait]
impl JournalSource for JournalClient {
    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<JournalPage, RuntimeError> {
        let token = self.tokens.get_access_token().await?;

        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| RuntimeError::Validation(format!("bad journal URL: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                pairs.append_pair("since", cursor);
            }
        }

        let opts = RequestOptions::get()
            .with_header("Authorization", format!("Bearer {token}"))
            .with_header("x-api-key", self.tokens.client_id())
            .with_header("x-ims-org-id", self.tokens.ims_org_id());

        let body = match self.http.request_text("journal-fetch", url.as_str(), opts).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(JournalPage::default()),
            // End-of-stream convention: nothing new to consume.
            Err(HttpError::Status { status, .. }) if matches!(status, 400 | 404 | 500) => {
                tracing::debug!(status, "journal signalled no events available");
                return Ok(JournalPage::default());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(parse_page(&body, limit, &self.config.event_type_suffixes))
    }
}

/// Parse a journal response body into a page.
///
/// `has_more` and the cursor are judged on the raw event count, before the
/// event-type filter: the cursor must advance past consumed events of every
/// type.
pub(crate) fn parse_page(body: &str, limit: usize, suffixes: &[String]) -> JournalPage {
    let raw = parse_events(body);
    let next_cursor = raw.iter().rev().find_map(position_of);
    let has_more = !raw.is_empty() && raw.len() >= limit;

    let mut events = Vec::new();
    for value in &raw {
        let Some(position) = position_of(value) else {
            tracing::warn!("journal event without position dropped");
            continue;
        };
        let event_type = value
            .get("type")
            .or_else(|| value.get("event_type"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if !suffixes.iter().any(|s| event_type.ends_with(s.as_str())) {
            continue;
        }
        events.push(JournalEvent {
            position,
            event_type,
            data: value.get("data").cloned().unwrap_or(Value::Null),
        });
    }

    JournalPage {
        events,
        next_cursor,
        has_more,
    }
}

fn parse_events(body: &str) -> Vec<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return match value {
            Value::Array(items) => items,
            Value::Object(ref map) => match map.get("events") {
                Some(Value::Array(items)) => items.clone(),
                _ => vec![value],
            },
            _ => Vec::new(),
        };
    }

    // Newline-delimited JSON.
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable journal line dropped");
                None
            }
        })
        .collect()
}

fn position_of(value: &Value) -> Option<String> {
    match value.get("position") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Read the persisted cursor.
pub async fn load_cursor(kv: &dyn KvStore) -> Result<Option<String>, RuntimeError> {
    let entry = kv.get(EVENTS_POSITION_KEY).await?;
    Ok(entry.and_then(|e| e.value.as_str().map(|s| s.to_string())))
}

/// Persist the cursor after a batch's work has been scheduled.
pub async fn store_cursor(kv: &dyn KvStore, position: &str) -> Result<(), RuntimeError> {
    kv.put(EVENTS_POSITION_KEY, Value::String(position.to_string()), None)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> Vec<String> {
        vec!["product.update".to_string(), "price.update".to_string()]
    }

    #[test]
    fn parses_json_envelope() {
        let body = r#"{"events":[
            {"position":"p1","type":"com.adobe.commerce.product.update","data":{"sku":"A"}},
            {"position":"p2","type":"com.adobe.commerce.price.update","data":{"sku":"B"}}
        ],"_page":{}}"#;
        let page = parse_page(body, 50, &suffixes());
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
        assert!(!page.has_more);
    }

    #[test]
    fn parses_bare_array_and_reports_has_more_at_limit() {
        let body = r#"[
            {"position":"p1","type":"x.product.update","data":{"sku":"A"}},
            {"position":"p2","type":"x.product.update","data":{"sku":"B"}}
        ]"#;
        let page = parse_page(body, 2, &suffixes());
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn parses_jsonl_with_bad_lines_dropped() {
        let body = concat!(
            r#"{"position":"p1","type":"x.product.update","data":{"sku":"A"}}"#,
            "\n",
            "not json\n",
            r#"{"position":"p3","type":"x.price.update","data":{"sku":"C"}}"#,
        );
        let page = parse_page(body, 50, &suffixes());
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("p3"));
    }

    #[test]
    fn event_type_filter_keeps_cursor_advancing() {
        let body = r#"[
            {"position":"p1","type":"x.product.update","data":{"sku":"A"}},
            {"position":"p2","type":"x.category.update","data":{}}
        ]"#;
        let page = parse_page(body, 50, &suffixes());
        // The category event is filtered out, but the cursor still points
        // past it.
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
    }

    #[test]
    fn numeric_positions_are_stringified() {
        let body = r#"[{"position":42,"type":"x.product.update","data":{"sku":"A"}}]"#;
        let page = parse_page(body, 50, &suffixes());
        assert_eq!(page.next_cursor.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn cursor_round_trips_through_kv() {
        let kv = crate::storage::MemoryKv::new();
        assert!(load_cursor(&kv).await.unwrap().is_none());
        store_cursor(&kv, "p99").await.unwrap();
        assert_eq!(load_cursor(&kv).await.unwrap().as_deref(), Some("p99"));
    }
}
