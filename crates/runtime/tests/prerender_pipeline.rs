//! End-to-end orchestrator scenarios against scripted journal and catalog
//! sources, in-memory storage, and the stubbed `"mock"` admin backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use prerender_runtime::admin::{AdminConfig, AdminScheduler};
use prerender_runtime::auth::{ImsCredentials, TokenManager};
use prerender_runtime::catalog::CatalogSource;
use prerender_runtime::journal::{JournalPage, JournalSource, EVENTS_POSITION_KEY};
use prerender_runtime::orchestrator::{self, RuntimeContainer, RUNNING_KEY};
use prerender_runtime::render::{content_hash, render_product};
use prerender_runtime::state::LocaleState;
use prerender_runtime::storage::{BlobStore, KvStore, MemoryBlobs, MemoryKv};
use prerender_runtime::types::{JournalEvent, RunState, RuntimeError};
use prerender_runtime::{HttpClient, RuntimeConfig};

struct ScriptedJournal {
    pages: Mutex<Vec<JournalPage>>,
    calls: Mutex<Vec<Option<String>>>,
}

impl ScriptedJournal {
    fn new(pages: Vec<JournalPage>) -> Self {
        Self {
            pages: Mutex::new(pages),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn remaining_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

#[async_trait]
impl JournalSource for ScriptedJournal {
    async fn fetch(&self, cursor: Option<&str>, _limit: usize) -> Result<JournalPage, RuntimeError> {
        self.calls.lock().push(cursor.map(|s| s.to_string()));
        let mut pages = self.pages.lock();
        if pages.is_empty() {
            Ok(JournalPage::default())
        } else {
            Ok(pages.remove(0))
        }
    }
}

struct ScriptedCatalog {
    products: HashMap<String, Value>,
}

impl ScriptedCatalog {
    fn new(products: &[Value]) -> Self {
        Self {
            products: products
                .iter()
                .map(|p| {
                    (
                        p.get("sku").and_then(|s| s.as_str()).unwrap().to_string(),
                        p.clone(),
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl CatalogSource for ScriptedCatalog {
    async fn product_by_sku(&self, sku: &str) -> Result<Value, RuntimeError> {
        self.products
            .get(sku)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                sku: sku.to_string(),
            })
    }

    async fn product_by_url_key(&self, url_key: &str) -> Result<Value, RuntimeError> {
        self.products
            .values()
            .find(|p| p.get("urlKey").and_then(|v| v.as_str()) == Some(url_key))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                sku: url_key.to_string(),
            })
    }

    async fn last_modified(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, String>, RuntimeError> {
        Ok(skus
            .iter()
            .filter(|sku| self.products.contains_key(*sku))
            .map(|sku| (sku.clone(), "2026-01-01T00:00:00Z".to_string()))
            .collect())
    }
}

fn test_config(overrides: &[(&str, &str)]) -> RuntimeConfig {
    let mut options: HashMap<String, String> = [
        ("ORG", "mock"),
        ("SITE", "store"),
        ("JOURNALLING_URL", "https://journal.example/events"),
        ("COMMERCE_ENDPOINT", "https://catalog.example/graphql"),
        ("CLIENT_ID", "client"),
        ("CLIENT_SECRET", "secret"),
        ("IMS_ORG_ID", "org@AdobeOrg"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (key, value) in overrides {
        options.insert(key.to_string(), value.to_string());
    }
    RuntimeConfig::from_options(&options).unwrap()
}

struct Harness {
    container: RuntimeContainer,
    kv: Arc<MemoryKv>,
    blobs: Arc<MemoryBlobs>,
}

fn harness(
    config: RuntimeConfig,
    journal: Arc<ScriptedJournal>,
    catalog: Arc<ScriptedCatalog>,
) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let blobs = Arc::new(MemoryBlobs::new());
    let http = Arc::new(HttpClient::new());
    let tokens = Arc::new(TokenManager::new(
        http.clone(),
        kv.clone(),
        ImsCredentials {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            ims_org_id: config.ims_org_id.clone(),
            endpoint: "http://127.0.0.1:9/ims/token/v3".to_string(),
        },
    ));
    let admin = AdminScheduler::new(http.clone(), AdminConfig::new(&config.org, &config.site));
    let container = RuntimeContainer::with_sources(
        config,
        kv.clone(),
        blobs.clone(),
        http,
        tokens,
        journal,
        catalog,
        admin,
    );
    Harness {
        container,
        kv,
        blobs,
    }
}

fn bezier_tee() -> Value {
    json!({
        "sku": "ADB177",
        "name": "Bezier Tee",
        "urlKey": "bezier-tee",
        "shortDescription": "A tee with curves.",
        "priceRange": {"minimum": {"final": {"amount": {"value": 19.99, "currency": "USD"}}}},
        "images": [{"url": "https://cdn.example/adb177.jpg", "label": "front"}],
    })
}

fn product_event(position: &str, sku: &str) -> JournalEvent {
    JournalEvent {
        position: position.to_string(),
        event_type: "com.adobe.commerce.product.update".to_string(),
        data: json!({ "sku": sku }),
    }
}

fn page(events: Vec<JournalEvent>, has_more: bool) -> JournalPage {
    let next_cursor = events.last().map(|e| e.position.clone());
    JournalPage {
        events,
        next_cursor,
        has_more,
    }
}

#[tokio::test(start_paused = true)]
async fn product_update_is_rendered_and_published() {
    let journal = Arc::new(ScriptedJournal::new(vec![page(
        vec![product_event("p1", "ADB177")],
        false,
    )]));
    let catalog = Arc::new(ScriptedCatalog::new(&[bezier_tee()]));
    let h = harness(test_config(&[]), journal, catalog);

    let result = orchestrator::run(&h.container).await;

    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.published, 1);
    assert_eq!(result.statistics.processed, 1);
    assert_eq!(result.statistics.failed, 0);

    // Rendered page persisted at the derived path.
    assert!(h.blobs.contains("/public/pdps/products/bezier-tee/adb177.html"));

    // SKU state carries the content hash and publish path.
    let state = LocaleState::load(&*h.blobs, None).await.unwrap();
    let entry = &state.entries["ADB177"];
    assert!(entry.content_hash.is_some());
    assert_eq!(
        entry.last_published_path.as_deref(),
        Some("/products/bezier-tee/adb177")
    );

    // Cursor advanced to the event position; lock released.
    let cursor = h.kv.get(EVENTS_POSITION_KEY).await.unwrap().unwrap();
    assert_eq!(cursor.value, json!("p1"));
    assert!(h.kv.get(RUNNING_KEY).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn unchanged_product_is_skipped() {
    let product = bezier_tee();
    let html = render_product("ADB177", &product, None);
    let hash = content_hash(&html);

    let journal = Arc::new(ScriptedJournal::new(vec![page(
        vec![product_event("p1", "ADB177")],
        false,
    )]));
    let catalog = Arc::new(ScriptedCatalog::new(&[product]));
    let h = harness(test_config(&[]), journal, catalog);

    // Preload state with the hash the renderer will produce again.
    let mut state = LocaleState::default();
    state.record("ADB177", 1, &hash, "/products/bezier-tee/adb177");
    state.save(&*h.blobs, None).await.unwrap();

    let result = orchestrator::run(&h.container).await;

    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.ignored, 1);
    assert_eq!(result.statistics.published, 0);

    // No page blob was written; only state and index blobs exist.
    assert!(!h.blobs.contains("/public/pdps/products/bezier-tee/adb177.html"));

    // last_rendered_at was stamped.
    let state = LocaleState::load(&*h.blobs, None).await.unwrap();
    assert!(state.entries["ADB177"].last_rendered_at > 1);
    assert_eq!(state.entries["ADB177"].content_hash.as_deref(), Some(&*hash));
}

#[tokio::test(start_paused = true)]
async fn deleted_product_is_unpublished_and_blob_removed() {
    let journal = Arc::new(ScriptedJournal::new(Vec::new()));
    // Catalog still knows ADB177 but no longer SKU-OLD.
    let catalog = Arc::new(ScriptedCatalog::new(&[bezier_tee()]));
    let h = harness(test_config(&[]), journal, catalog);

    let mut state = LocaleState::default();
    state.record("ADB177", 1, "hash-a", "/products/bezier-tee/adb177");
    state.record("SKU-OLD", 1, "hash-old", "/products/sku-old");
    state.save(&*h.blobs, None).await.unwrap();
    h.blobs
        .write("/public/pdps/products/sku-old.html", b"<html/>")
        .await
        .unwrap();

    let result = orchestrator::run(&h.container).await;

    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.unpublished, 1);

    assert!(!h.blobs.contains("/public/pdps/products/sku-old.html"));
    let state = LocaleState::load(&*h.blobs, None).await.unwrap();
    assert!(!state.entries.contains_key("SKU-OLD"));
    assert!(state.entries.contains_key("ADB177"));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_events_overflow_into_queue() {
    let products: Vec<Value> = ["SKU-A", "SKU-B", "SKU-C"]
        .iter()
        .map(|sku| {
            json!({
                "sku": sku,
                "name": format!("Product {sku}"),
                "urlKey": sku.to_lowercase(),
            })
        })
        .collect();
    let journal = Arc::new(ScriptedJournal::new(vec![page(
        vec![
            product_event("p1", "SKU-A"),
            product_event("p2", "SKU-B"),
            product_event("p3", "SKU-C"),
        ],
        false,
    )]));
    let catalog = Arc::new(ScriptedCatalog::new(&products));
    let h = harness(
        test_config(&[("MAX_TOKENS", "2"), ("REFILL_RATE", "0")]),
        journal,
        catalog,
    );

    let result = orchestrator::run(&h.container).await;

    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.published, 2);

    // The third event waits in the durable queue for a later run.
    let status = h.container.queue.status().await.unwrap();
    assert_eq!(status.queue_size, 1);
}

#[tokio::test(start_paused = true)]
async fn queued_backlog_is_processed_on_next_run() {
    let products = [json!({"sku": "SKU-C", "name": "Product C", "urlKey": "sku-c"})];
    // First run: no tokens at all, one event -> queued, nothing published.
    let journal = Arc::new(ScriptedJournal::new(vec![page(
        vec![product_event("p1", "SKU-C")],
        false,
    )]));
    let catalog = Arc::new(ScriptedCatalog::new(&products));
    let h = harness(
        test_config(&[("MAX_TOKENS", "0"), ("REFILL_RATE", "0")]),
        journal,
        catalog.clone(),
    );
    let result = orchestrator::run(&h.container).await;
    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.published, 0);
    assert_eq!(h.container.queue.status().await.unwrap().queue_size, 1);

    // Second run over the same stores drains the backlog.
    let journal = Arc::new(ScriptedJournal::new(Vec::new()));
    let http = Arc::new(HttpClient::new());
    let config = test_config(&[("MAX_TOKENS", "0"), ("REFILL_RATE", "0")]);
    let tokens = Arc::new(TokenManager::new(
        http.clone(),
        h.kv.clone(),
        ImsCredentials::default(),
    ));
    let admin = AdminScheduler::new(http.clone(), AdminConfig::new("mock", "store"));
    let container = RuntimeContainer::with_sources(
        config,
        h.kv.clone(),
        h.blobs.clone(),
        http,
        tokens,
        journal,
        catalog,
        admin,
    );
    let result = orchestrator::run(&container).await;
    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.published, 1);
    assert_eq!(container.queue.status().await.unwrap().queue_size, 0);
    assert!(h.blobs.contains("/public/pdps/products/sku-c/sku-c.html"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_invocation_is_skipped() {
    let journal = Arc::new(ScriptedJournal::new(vec![page(
        vec![product_event("p1", "ADB177")],
        false,
    )]));
    let catalog = Arc::new(ScriptedCatalog::new(&[bezier_tee()]));
    let h = harness(test_config(&[]), journal.clone(), catalog);

    h.kv.put(RUNNING_KEY, json!(true), None).await.unwrap();

    let result = orchestrator::run(&h.container).await;
    assert_eq!(result.status, RunState::Skipped);
    // The journal was never touched.
    assert_eq!(journal.remaining_pages(), 1);
    // The other invocation's lock is left in place.
    assert!(h.kv.get(RUNNING_KEY).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn empty_journal_completes_with_cursor_unchanged() {
    let journal = Arc::new(ScriptedJournal::new(Vec::new()));
    let catalog = Arc::new(ScriptedCatalog::new(&[]));
    let h = harness(test_config(&[]), journal, catalog);

    let result = orchestrator::run(&h.container).await;

    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.processed, 0);
    assert!(h.kv.get(EVENTS_POSITION_KEY).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn cursor_advances_monotonically_across_batches() {
    let journal = Arc::new(ScriptedJournal::new(vec![
        page(vec![product_event("p1", "ADB177")], true),
        page(vec![product_event("p2", "ADB177")], false),
    ]));
    let catalog = Arc::new(ScriptedCatalog::new(&[bezier_tee()]));
    let h = harness(test_config(&[]), journal.clone(), catalog);

    let result = orchestrator::run(&h.container).await;
    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);

    let cursor = h.kv.get(EVENTS_POSITION_KEY).await.unwrap().unwrap();
    assert_eq!(cursor.value, json!("p2"));
    // The second fetch resumed from the first batch's cursor.
    assert_eq!(journal.calls.lock().as_slice(), &[None, Some("p1".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn missing_product_counts_failed_but_run_completes() {
    let journal = Arc::new(ScriptedJournal::new(vec![page(
        vec![product_event("p1", "GONE-1"), product_event("p2", "ADB177")],
        false,
    )]));
    let catalog = Arc::new(ScriptedCatalog::new(&[bezier_tee()]));
    let h = harness(test_config(&[]), journal, catalog);

    let result = orchestrator::run(&h.container).await;

    assert_eq!(result.status, RunState::Completed, "{:?}", result.error);
    assert_eq!(result.statistics.failed, 1);
    assert_eq!(result.statistics.published, 1);
}

#[tokio::test(start_paused = true)]
async fn validation_failure_fails_fast() {
    let journal = Arc::new(ScriptedJournal::new(Vec::new()));
    let catalog = Arc::new(ScriptedCatalog::new(&[]));
    // No journal URL configured.
    let config = RuntimeConfig::from_options(
        &[
            ("ORG".to_string(), "mock".to_string()),
            ("SITE".to_string(), "store".to_string()),
            (
                "COMMERCE_ENDPOINT".to_string(),
                "https://catalog.example/graphql".to_string(),
            ),
        ]
        .into_iter()
        .collect(),
    )
    .unwrap();
    let h = harness(config, journal, catalog);

    let result = orchestrator::run(&h.container).await;
    assert_eq!(result.status, RunState::Error);
    assert!(result.error.unwrap().contains("JOURNALLING_URL"));
}
