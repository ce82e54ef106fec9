//! Orchestrator: one invocation of the prerender pipeline.
//!
//! Loads state, consumes the journal, coalesces and filters SKUs, renders
//! under the rate limit, drives preview/publish and the unpublish pair
//! through the admin scheduler, and persists cursor and SKU state. The
//! whole run executes under a single-writer `running` lock whose TTL
//! guarantees unlock even if the process dies.
//!
//! The cursor is advanced after a batch's work has been *scheduled*, not
//! completed; downstream steps are idempotent keyed by SKU and content
//! hash, which makes re-processing after a crash safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;

use crate::admin::{AdminConfig, AdminScheduler, BatchCompletion};
use crate::auth::{ImsCredentials, TokenManager};
use crate::catalog::{
    derive_catalog_config, fetch_remote_config, CatalogClient, CatalogConfig, CatalogSource,
};
use crate::config::RuntimeConfig;
use crate::filter::SkuFilter;
use crate::http::{HttpClient, RequestOptions};
use crate::journal::{self, JournalClient, JournalConfig, JournalSource};
use crate::queue::DurableEventQueue;
use crate::ratelimit::TokenBucket;
use crate::render::{page_blob_path, product_path, RenderContext, RenderPipeline, RenderResult};
use crate::state::{save_products_index, LocaleState};
use crate::storage::{BlobStore, KvStore};
use crate::types::{
    BatchRecord, EventKind, JournalEvent, Priority, QueuedEvent, RunResult, RunState,
    RunStatistics, RuntimeError,
};

/// KV key of the single-writer run lock.
pub const RUNNING_KEY: &str = "running";

/// Chunk size for catalog last-modified lookups.
const LAST_MODIFIED_CHUNK: usize = 50;

/// Dependency container handed to the orchestrator; replaces module-level
/// singletons so each run owns its collaborators explicitly.
pub struct RuntimeContainer {
    pub config: RuntimeConfig,
    pub kv: Arc<dyn KvStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub http: Arc<HttpClient>,
    pub tokens: Arc<TokenManager>,
    pub limiter: Arc<TokenBucket>,
    pub queue: Arc<DurableEventQueue>,
    pub filter: Arc<SkuFilter>,
    pub journal: Arc<dyn JournalSource>,
    pub catalog: Arc<dyn CatalogSource>,
    pub admin: AdminScheduler,
}

impl RuntimeContainer {
    /// Build a container against the real remote collaborators.
    pub async fn build(
        config: RuntimeConfig,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, RuntimeError> {
        let http = Arc::new(HttpClient::new());
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            kv.clone(),
            ImsCredentials {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                ims_org_id: config.ims_org_id.clone(),
                endpoint: config.ims_endpoint.clone(),
            },
        ));

        let catalog_config = match &config.config_name {
            Some(name) => {
                let rows = fetch_remote_config(
                    &http,
                    &config.content_url,
                    name,
                    config.config_sheet.as_deref(),
                )
                .await?;
                derive_catalog_config(&rows)?
            }
            None => CatalogConfig {
                endpoint: config.commerce_endpoint.clone().unwrap_or_default(),
                headers: vec![("x-api-key".to_string(), config.client_id.clone())],
            },
        };
        let catalog = Arc::new(CatalogClient::new(http.clone(), catalog_config));

        let journal = Arc::new(JournalClient::new(
            http.clone(),
            tokens.clone(),
            JournalConfig::new(&config.journalling_url),
        ));

        let mut admin_config = AdminConfig::new(&config.org, &config.site);
        admin_config.host = config.admin_host.clone();
        admin_config.auth_token = config.admin_auth_token.clone();
        let admin = AdminScheduler::new(http.clone(), admin_config);

        Ok(Self::with_sources(
            config, kv, blobs, http, tokens, journal, catalog, admin,
        ))
    }

    /// Assemble a container from explicit collaborators. Tests use this to
    /// script the journal and catalog.
    #[allow(clippy::too_many_arguments)]
    pub fn with_sources(
        config: RuntimeConfig,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        http: Arc<HttpClient>,
        tokens: Arc<TokenManager>,
        journal: Arc<dyn JournalSource>,
        catalog: Arc<dyn CatalogSource>,
        admin: AdminScheduler,
    ) -> Self {
        let limiter = Arc::new(TokenBucket::new(config.rate_limit));
        let queue = Arc::new(DurableEventQueue::new(kv.clone(), config.queue));
        let filter = Arc::new(SkuFilter::products_only());
        Self {
            config,
            kv,
            blobs,
            http,
            tokens,
            limiter,
            queue,
            filter,
            journal,
            catalog,
            admin,
        }
    }
}

/// Execute one run. Never panics across the lock: the `running` key is
/// released on every exit path.
pub async fn run(container: &RuntimeContainer) -> RunResult {
    let started = Instant::now();

    if let Err(err) = container.config.validate() {
        return error_result(err, started);
    }

    // Single-writer lock with a TTL equal to the invocation budget.
    match container.kv.get(RUNNING_KEY).await {
        Ok(Some(entry)) if entry.value.as_bool() == Some(true) => {
            tracing::info!("another run is in progress, skipping");
            return RunResult::skipped();
        }
        Ok(_) => {}
        Err(err) => return error_result(err.into(), started),
    }
    if let Err(err) = container
        .kv
        .put(
            RUNNING_KEY,
            json!(true),
            Some(container.config.function_deadline),
        )
        .await
    {
        return error_result(err.into(), started);
    }

    let outcome = run_locked(container).await;

    if let Err(err) = container.kv.delete(RUNNING_KEY).await {
        tracing::warn!(error = %err, "failed to release running lock; TTL will reclaim it");
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok((statistics, timings)) => RunResult {
            status: RunState::Completed,
            elapsed_ms,
            statistics,
            timings,
            error: None,
        },
        Err(err) => RunResult {
            status: RunState::Error,
            elapsed_ms,
            statistics: RunStatistics::default(),
            timings: HashMap::new(),
            error: Some(err.to_string()),
        },
    }
}

fn error_result(err: RuntimeError, started: Instant) -> RunResult {
    RunResult {
        status: RunState::Error,
        elapsed_ms: started.elapsed().as_millis() as u64,
        statistics: RunStatistics::default(),
        timings: HashMap::new(),
        error: Some(err.to_string()),
    }
}

/// One unit of render work coalesced from journal events.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub sku: String,
    pub url_key: Option<String>,
    pub kind: EventKind,
}

/// Coalesce events into a deduplicated SKU set preserving journal order.
pub(crate) fn coalesce_events(events: &[JournalEvent]) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    let mut work = Vec::new();
    for event in events {
        let Some((sku, _location)) = event.sku() else {
            tracing::warn!(event_type = %event.event_type, "event without SKU dropped");
            continue;
        };
        if seen.insert(sku.clone()) {
            work.push(WorkItem {
                sku,
                url_key: event.url_key(),
                kind: event.kind().unwrap_or(EventKind::ProductUpdate),
            });
        }
    }
    work
}

struct LocaleBatchResult {
    locale: Option<String>,
    state: LocaleState,
    records: Vec<BatchRecord>,
    /// Publish path → content hash, applied to state once publish lands.
    hashes: HashMap<String, String>,
    ignored: u64,
    failed: u64,
    failed_skus: HashSet<String>,
}

enum CompletionKind {
    Publish,
    Unpublish,
}

struct PendingCompletion {
    kind: CompletionKind,
    locale: Option<String>,
    hashes: HashMap<String, String>,
    completion: BatchCompletion,
}

async fn run_locked(
    container: &RuntimeContainer,
) -> Result<(RunStatistics, HashMap<String, u64>), RuntimeError> {
    let config = &container.config;
    let mut stats = RunStatistics::default();
    let mut timings = HashMap::new();

    let locales = config.locales_or_default();
    container.admin.start_processing();

    // Per-run pipeline per locale; the layout template is fetched once per
    // locale and cached for the run.
    let mut pipelines: HashMap<Option<String>, Arc<RenderPipeline>> = HashMap::new();
    let mut states: HashMap<Option<String>, LocaleState> = HashMap::new();
    for locale in &locales {
        let template = match &config.products_template {
            Some(url) => fetch_template(&container.http, url, locale.as_deref()).await,
            None => None,
        };
        pipelines.insert(
            locale.clone(),
            Arc::new(RenderPipeline::new(
                container.catalog.clone(),
                container.blobs.clone(),
                RenderContext {
                    locale: locale.clone(),
                    path_format: config.product_page_url_format.clone(),
                    store_url: config.store_url.clone(),
                    template,
                },
            )),
        );
        states.insert(
            locale.clone(),
            LocaleState::load(&*container.blobs, locale.as_deref()).await?,
        );
    }

    let mut completions: Vec<PendingCompletion> = Vec::new();
    let mut batch_no = 0usize;

    // Backlog first: events throttled in earlier runs wait in the durable
    // queue and are not subject to the rate limiter again.
    if config.queue_enabled {
        let events = container
            .queue
            .dequeue(config.queue.batch_size)
            .await
            .unwrap_or_default();
        if !events.is_empty() {
            batch_no += 1;
            let work: Vec<WorkItem> = events
                .iter()
                .map(|e| WorkItem {
                    sku: e.sku.clone(),
                    url_key: None,
                    kind: e.kind,
                })
                .collect();
            let failed_skus = schedule_batch(
                container,
                &locales,
                &pipelines,
                &mut states,
                &work,
                batch_no,
                &mut stats,
                &mut completions,
            )
            .await?;

            let mut ok_ids = Vec::new();
            let mut failed_ids = Vec::new();
            for event in &events {
                if failed_skus.contains(&event.sku) {
                    failed_ids.push(event.id.clone());
                } else {
                    ok_ids.push(event.id.clone());
                }
            }
            if !ok_ids.is_empty() {
                container.queue.mark_processed(&ok_ids, true).await?;
            }
            if !failed_ids.is_empty() {
                container.queue.mark_processed(&failed_ids, false).await?;
            }
        }
    }

    // Journal consumption: cursor advances after each batch's work has
    // been scheduled.
    let consume_started = Instant::now();
    let mut cursor = journal::load_cursor(&*container.kv).await?;
    while batch_no < config.max_batches {
        let page = container
            .journal
            .fetch(cursor.as_deref(), config.journal_limit)
            .await?;
        if page.events.is_empty() && page.next_cursor.is_none() {
            break;
        }
        batch_no += 1;
        stats.events_fetched += page.events.len() as u64;

        let work = coalesce_events(&page.events);
        stats.unique_skus += work.len() as u64;
        let admitted = admit_work(container, work, &mut stats).await;

        schedule_batch(
            container,
            &locales,
            &pipelines,
            &mut states,
            &admitted,
            batch_no,
            &mut stats,
            &mut completions,
        )
        .await?;

        if let Some(position) = page.next_cursor.clone() {
            journal::store_cursor(&*container.kv, &position).await?;
            cursor = Some(position);
        }
        if !page.has_more {
            break;
        }
    }
    timings.insert("consume_ms".to_string(), consume_started.elapsed().as_millis() as u64);

    // Deletions: diff the known SKU set against the catalog, then drive
    // the unpublish pair. Blob deletion happens only after a successful
    // unpublish-preview, when completions are settled below.
    let unpublish_started = Instant::now();
    for locale in &locales {
        let state = states.get(locale).expect("state loaded");
        let deleted = diff_deleted_skus(container, state).await;
        if deleted.is_empty() {
            continue;
        }
        batch_no += 1;
        tracing::info!(
            locale = locale.as_deref().unwrap_or("default"),
            count = deleted.len(),
            "scheduling unpublish for deleted products"
        );
        let records: Vec<BatchRecord> = deleted
            .iter()
            .map(|sku| {
                let path = state
                    .entries
                    .get(sku)
                    .and_then(|e| e.last_published_path.clone())
                    .unwrap_or_else(|| {
                        product_path(
                            &config.product_page_url_format,
                            locale.as_deref(),
                            sku,
                            None,
                        )
                    });
                BatchRecord::new(sku.clone(), path)
            })
            .collect();
        let completion = container
            .admin
            .unpublish_and_delete(records, locale.clone(), batch_no);
        completions.push(PendingCompletion {
            kind: CompletionKind::Unpublish,
            locale: locale.clone(),
            hashes: HashMap::new(),
            completion,
        });
    }

    // Settle all admin completions, applying publish results to SKU state
    // and finishing deletions.
    let publish_started = Instant::now();
    for pending in completions {
        let outcome = match pending.completion.await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("admin batch dropped without resolution");
                stats.failed += 1;
                continue;
            }
        };
        let state = states.entry(pending.locale.clone()).or_default();
        let now_ms = Utc::now().timestamp_millis();
        for record in &outcome.records {
            match pending.kind {
                CompletionKind::Publish => {
                    if record.published_at.is_some() {
                        stats.published += 1;
                        stats.processed += 1;
                        if let Some(hash) = pending.hashes.get(&record.path) {
                            state.record(&record.sku, now_ms, hash, &record.path);
                        }
                    } else if record.failed {
                        stats.failed += 1;
                    }
                }
                CompletionKind::Unpublish => {
                    if record.preview_unpublished_at.is_some() {
                        container
                            .blobs
                            .delete(&page_blob_path(&record.path))
                            .await
                            .unwrap_or_else(|err| {
                                tracing::warn!(path = %record.path, error = %err, "blob delete failed");
                            });
                        state.remove(&record.sku);
                        stats.unpublished += 1;
                    } else if record.failed {
                        stats.failed += 1;
                    }
                }
            }
        }
    }
    timings.insert("publish_ms".to_string(), publish_started.elapsed().as_millis() as u64);
    timings.insert(
        "unpublish_ms".to_string(),
        unpublish_started.elapsed().as_millis() as u64,
    );

    container.admin.stop_processing().await;

    // Persist final state and the discovered-SKU index per locale.
    for locale in &locales {
        if let Some(state) = states.get(locale) {
            state.save(&*container.blobs, locale.as_deref()).await?;
            save_products_index(&*container.blobs, locale.as_deref(), &state.skus()).await?;
        }
    }

    if let Some(err) = container.admin.take_global_error() {
        return Err(RuntimeError::JobFailed(err.to_string()));
    }

    Ok((stats, timings))
}

/// Apply the SKU filter and the rate limiter; throttled events go to the
/// durable queue when it is enabled.
async fn admit_work(
    container: &RuntimeContainer,
    work: Vec<WorkItem>,
    stats: &mut RunStatistics,
) -> Vec<WorkItem> {
    let config = &container.config;
    let mut admitted = Vec::new();
    for item in work {
        let decision = container.filter.should_process(&item.sku);
        if !decision.allowed {
            tracing::debug!(sku = %item.sku, stage = ?decision.stage, reason = %decision.reason, "sku filtered");
            continue;
        }

        let rate = container.limiter.try_acquire();
        if rate.allowed {
            admitted.push(item);
            continue;
        }

        if config.queue_enabled {
            tracing::warn!(
                sku = %item.sku,
                retry_after_ms = rate.retry_after_ms.unwrap_or(0),
                "rate limited, deferring to durable queue"
            );
            let event = QueuedEvent::new(&item.sku, item.kind, Priority::Normal);
            if let Err(err) = container.queue.enqueue(event).await {
                tracing::warn!(sku = %item.sku, error = %err, "failed to queue throttled event");
                stats.failed += 1;
            }
        } else {
            match container.limiter.acquire(config.rate_limit.acquire_timeout).await {
                Ok(()) => admitted.push(item),
                Err(err) => {
                    tracing::warn!(sku = %item.sku, error = %err, "rate limit acquire timed out");
                    stats.failed += 1;
                }
            }
        }
    }
    admitted
}

/// Render one batch across all locales in parallel and dispatch the
/// changed records to preview/publish. Returns the SKUs that failed to
/// render in any locale.
#[allow(clippy::too_many_arguments)]
async fn schedule_batch(
    container: &RuntimeContainer,
    locales: &[Option<String>],
    pipelines: &HashMap<Option<String>, Arc<RenderPipeline>>,
    states: &mut HashMap<Option<String>, LocaleState>,
    work: &[WorkItem],
    batch_no: usize,
    stats: &mut RunStatistics,
    completions: &mut Vec<PendingCompletion>,
) -> Result<HashSet<String>, RuntimeError> {
    let mut all_failed_skus = HashSet::new();
    if work.is_empty() {
        return Ok(all_failed_skus);
    }

    // One task per locale, all in flight.
    let jobs: Vec<_> = locales
        .iter()
        .map(|locale| {
            let pipeline = pipelines.get(locale).expect("pipeline built").clone();
            let state = states.remove(locale).unwrap_or_default();
            render_locale_batch(locale.clone(), pipeline, state, work.to_vec())
        })
        .collect();
    let results = futures::future::join_all(jobs).await;

    for result in results {
        stats.ignored += result.ignored;
        stats.failed += result.failed;
        all_failed_skus.extend(result.failed_skus.iter().cloned());

        // Persist skip-only updates before dispatching the batch.
        result
            .state
            .save(&*container.blobs, result.locale.as_deref())
            .await?;
        states.insert(result.locale.clone(), result.state);

        if result.records.is_empty() {
            continue;
        }
        let completion =
            container
                .admin
                .preview_and_publish(result.records, result.locale.clone(), batch_no);
        completions.push(PendingCompletion {
            kind: CompletionKind::Publish,
            locale: result.locale,
            hashes: result.hashes,
            completion,
        });
    }
    Ok(all_failed_skus)
}

async fn render_locale_batch(
    locale: Option<String>,
    pipeline: Arc<RenderPipeline>,
    mut state: LocaleState,
    work: Vec<WorkItem>,
) -> LocaleBatchResult {
    let jobs: Vec<_> = work
        .iter()
        .map(|item| {
            let pipeline = pipeline.clone();
            let prior = state.content_hash(&item.sku).map(|s| s.to_string());
            let sku = item.sku.clone();
            let url_key = item.url_key.clone();
            async move {
                let result = pipeline
                    .process(&sku, url_key.as_deref(), prior.as_deref())
                    .await;
                (sku, result)
            }
        })
        .collect();
    let results = futures::future::join_all(jobs).await;

    let now_ms = Utc::now().timestamp_millis();
    let mut records = Vec::new();
    let mut hashes = HashMap::new();
    let mut ignored = 0u64;
    let mut failed = 0u64;
    let mut failed_skus = HashSet::new();

    for (sku, result) in results {
        match result {
            Ok(RenderResult::Unchanged { sku }) => {
                state.touch(&sku, now_ms);
                ignored += 1;
            }
            Ok(RenderResult::Rendered(outcome)) => {
                hashes.insert(outcome.path.clone(), outcome.content_hash.clone());
                records.push(BatchRecord::new(outcome.sku, outcome.path));
            }
            Err(RuntimeError::NotFound { sku }) => {
                tracing::warn!(sku = %sku, "product not in catalog, skipping");
                failed += 1;
                failed_skus.insert(sku);
            }
            Err(err) => {
                tracing::warn!(sku = %sku, error = %err, "render failed");
                failed += 1;
                failed_skus.insert(sku);
            }
        }
    }

    LocaleBatchResult {
        locale,
        state,
        records,
        hashes,
        ignored,
        failed,
        failed_skus,
    }
}

/// SKUs present in local state but no longer in the catalog. Lookup
/// failures keep their chunk out of the deletion set: a flaky catalog must
/// never unpublish live products.
async fn diff_deleted_skus(container: &RuntimeContainer, state: &LocaleState) -> Vec<String> {
    let known = state.skus();
    if known.is_empty() {
        return Vec::new();
    }

    let chunks: Vec<Vec<String>> = known
        .chunks(LAST_MODIFIED_CHUNK)
        .map(|c| c.to_vec())
        .collect();
    // At most 50 lookups in flight at a time.
    let lookups: Vec<_> = futures::stream::iter(
        chunks
            .iter()
            .map(|chunk| container.catalog.last_modified(chunk)),
    )
    .buffered(LAST_MODIFIED_CHUNK)
    .collect()
    .await;

    let mut present: HashSet<String> = HashSet::new();
    for (chunk, lookup) in chunks.iter().zip(lookups) {
        match lookup {
            Ok(map) => present.extend(map.into_keys()),
            Err(err) => {
                tracing::warn!(error = %err, "last-modified lookup failed, keeping chunk");
                present.extend(chunk.iter().cloned());
            }
        }
    }

    known
        .into_iter()
        .filter(|sku| !present.contains(sku))
        .collect()
}

async fn fetch_template(http: &HttpClient, url: &str, locale: Option<&str>) -> Option<String> {
    let url = match locale {
        Some(locale) => url.replace("{locale}", locale),
        None => url.replace("/{locale}", "").replace("{locale}", ""),
    };
    match http
        .request_text("products-template", &url, RequestOptions::get())
        .await
    {
        Ok(template) => template,
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "template fetch failed, rendering standalone");
            None
        }
    }
}
