//! Admin job scheduler: bulk preview/publish and unpublish lifecycles.
//!
//! Four FIFO queues feed an in-flight set of at most two concurrent
//! batches; tasks beyond that wait in a pending list that is reordered
//! publish-first whenever capacity frees up. Each batch submits one bulk
//! job to the admin API and polls it to its terminal `stopped` state.
//!
//! Failure classification: a failed submission is batch-scoped (records
//! are marked failed, the run continues); a failed status poll or details
//! fetch is global and aborts the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::http::{HttpClient, RequestOptions};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::types::{AdminJobHandle, BatchRecord};

/// Maximum concurrently running admin batches.
pub const MAX_IN_FLIGHT: usize = 2;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MOCK_DELAY: Duration = Duration::from_secs(1);

/// Admin scheduler errors, split by blast radius.
#[derive(Debug, Error, Clone)]
pub enum AdminError {
    /// One batch's submission failed after retries; its records are marked
    /// failed and the run continues.
    #[error("admin batch {operation} failed: {message}")]
    Batch { operation: String, message: String },

    /// Job status polling or details retrieval failed; the run aborts.
    #[error("admin job {operation} failed: {message}")]
    Global { operation: String, message: String },
}

impl AdminError {
    pub fn is_global(&self) -> bool {
        matches!(self, AdminError::Global { .. })
    }
}

/// Admin endpoint configuration.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub org: String,
    pub site: String,
    pub host: String,
    pub auth_token: Option<String>,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub tick_interval: Duration,
}

impl AdminConfig {
    pub fn new(org: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            site: site.into(),
            host: "admin.hlx.page".to_string(),
            auth_token: None,
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    /// The literal org/site `"mock"` stubs every admin exchange.
    fn is_mock(&self) -> bool {
        self.org == "mock" || self.site == "mock"
    }
}

/// The four batch operations, in their lifecycle roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    Preview,
    Publish,
    UnpublishLive,
    UnpublishPreview,
}

impl BatchOp {
    /// Admin route the operation posts to.
    fn route(&self) -> &'static str {
        match self {
            BatchOp::Preview | BatchOp::UnpublishPreview => "preview",
            BatchOp::Publish | BatchOp::UnpublishLive => "live",
        }
    }

    fn is_delete(&self) -> bool {
        matches!(self, BatchOp::UnpublishLive | BatchOp::UnpublishPreview)
    }

    fn label(&self) -> &'static str {
        match self {
            BatchOp::Preview => "preview",
            BatchOp::Publish => "publish",
            BatchOp::UnpublishLive => "unpublish-live",
            BatchOp::UnpublishPreview => "unpublish-preview",
        }
    }
}

/// Resolution payload handed back to the batch originator.
#[derive(Debug)]
pub struct BatchOutcome {
    pub records: Vec<BatchRecord>,
    pub locale: Option<String>,
    pub batch_no: usize,
    pub failed: bool,
}

/// Completion handle for a submitted batch.
pub type BatchCompletion = oneshot::Receiver<BatchOutcome>;

struct AdminBatch {
    op: BatchOp,
    records: Vec<BatchRecord>,
    locale: Option<String>,
    batch_no: usize,
    done: Option<oneshot::Sender<BatchOutcome>>,
}

#[derive(Default)]
struct Queues {
    preview: Vec<AdminBatch>,
    publish: Vec<AdminBatch>,
    unpublish_live: Vec<AdminBatch>,
    unpublish_preview: Vec<AdminBatch>,
}

impl Queues {
    fn of(&mut self, op: BatchOp) -> &mut Vec<AdminBatch> {
        match op {
            BatchOp::Preview => &mut self.preview,
            BatchOp::Publish => &mut self.publish,
            BatchOp::UnpublishLive => &mut self.unpublish_live,
            BatchOp::UnpublishPreview => &mut self.unpublish_preview,
        }
    }

    fn total(&self) -> usize {
        self.preview.len() + self.publish.len() + self.unpublish_live.len()
            + self.unpublish_preview.len()
    }
}

#[derive(Default)]
struct Dispatch {
    in_flight: HashSet<String>,
    pending: Vec<(String, AdminBatch)>,
}

struct Inner {
    http: Arc<HttpClient>,
    config: AdminConfig,
    queues: Mutex<Queues>,
    dispatch: Mutex<Dispatch>,
    drain_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    running: AtomicBool,
    global_error: Mutex<Option<AdminError>>,
    task_seq: AtomicU64,
}

/// Scheduler for bulk admin jobs.
#[derive(Clone)]
pub struct AdminScheduler {
    inner: Arc<Inner>,
}

impl AdminScheduler {
    pub fn new(http: Arc<HttpClient>, config: AdminConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                config,
                queues: Mutex::new(Queues::default()),
                dispatch: Mutex::new(Dispatch::default()),
                drain_waiters: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                global_error: Mutex::new(None),
                task_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Start the scheduler loop. Idempotent: a second call while the loop
    /// runs (including while a stop is draining) is a no-op.
    pub fn start_processing(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                inner.log_queue_sizes();
                // One batch per queue per tick; publish first to clear the
                // mid-pipeline stage.
                for op in [
                    BatchOp::Publish,
                    BatchOp::Preview,
                    BatchOp::UnpublishLive,
                    BatchOp::UnpublishPreview,
                ] {
                    let batch = inner.queues.lock().of(op).pop_front_batch();
                    if let Some(batch) = batch {
                        Inner::track_in_flight(&inner, batch);
                    }
                }

                if inner.is_drained() {
                    let waiters: Vec<_> = inner.drain_waiters.lock().drain(..).collect();
                    if !waiters.is_empty() {
                        inner.running.store(false, Ordering::SeqCst);
                        for waiter in waiters {
                            let _ = waiter.send(());
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Resolve once every queue, the pending list, and the in-flight set
    /// are empty. Safe to call concurrently; every caller resolves.
    pub async fn stop_processing(&self) {
        if !self.inner.running.load(Ordering::SeqCst) && self.inner.is_drained() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.inner.drain_waiters.lock().push(tx);
        // The loop may have exited between the check above and the push;
        // serve the waiters here in that case.
        if !self.inner.running.load(Ordering::SeqCst) && self.inner.is_drained() {
            let waiters: Vec<_> = self.inner.drain_waiters.lock().drain(..).collect();
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        let _ = rx.await;
    }

    /// Enqueue records for the preview → publish lifecycle.
    pub fn preview_and_publish(
        &self,
        records: Vec<BatchRecord>,
        locale: Option<String>,
        batch_no: usize,
    ) -> BatchCompletion {
        self.enqueue(BatchOp::Preview, records, locale, batch_no)
    }

    /// Enqueue records for the unpublish-live → unpublish-preview
    /// lifecycle.
    pub fn unpublish_and_delete(
        &self,
        records: Vec<BatchRecord>,
        locale: Option<String>,
        batch_no: usize,
    ) -> BatchCompletion {
        self.enqueue(BatchOp::UnpublishLive, records, locale, batch_no)
    }

    /// A global failure recorded by any batch task, if one occurred.
    pub fn take_global_error(&self) -> Option<AdminError> {
        self.inner.global_error.lock().take()
    }

    fn enqueue(
        &self,
        op: BatchOp,
        records: Vec<BatchRecord>,
        locale: Option<String>,
        batch_no: usize,
    ) -> BatchCompletion {
        let (tx, rx) = oneshot::channel();
        self.inner.queues.lock().of(op).push(AdminBatch {
            op,
            records,
            locale,
            batch_no,
            done: Some(tx),
        });
        rx
    }
}

trait PopFront {
    fn pop_front_batch(&mut self) -> Option<AdminBatch>;
}

impl PopFront for Vec<AdminBatch> {
    fn pop_front_batch(&mut self) -> Option<AdminBatch> {
        if self.is_empty() {
            None
        } else {
            Some(self.remove(0))
        }
    }
}

impl Inner {
    fn log_queue_sizes(&self) {
        let queues = self.queues.lock();
        if queues.total() > 0 {
            tracing::debug!(
                preview = queues.preview.len(),
                publish = queues.publish.len(),
                unpublish_live = queues.unpublish_live.len(),
                unpublish_preview = queues.unpublish_preview.len(),
                "admin queue sizes"
            );
        }
    }

    fn is_drained(&self) -> bool {
        let dispatch = self.dispatch.lock();
        dispatch.in_flight.is_empty()
            && dispatch.pending.is_empty()
            && self.queues.lock().total() == 0
    }

    /// Start the batch immediately when in-flight capacity allows,
    /// otherwise park it on the pending list.
    fn track_in_flight(inner: &Arc<Inner>, batch: AdminBatch) {
        let name = format!(
            "{}-{}-{}",
            batch.op.label(),
            batch.batch_no,
            inner.task_seq.fetch_add(1, Ordering::Relaxed)
        );
        let mut dispatch = inner.dispatch.lock();
        if dispatch.in_flight.len() < MAX_IN_FLIGHT {
            dispatch.in_flight.insert(name.clone());
            drop(dispatch);
            tokio::spawn(Inner::run_batch(inner.clone(), name, batch));
        } else {
            dispatch.pending.push((name, batch));
        }
    }

    /// Remove a finished task and promote the next pending one, publish
    /// tasks first.
    fn finish_task(inner: &Arc<Inner>, name: &str) {
        let mut dispatch = inner.dispatch.lock();
        dispatch.in_flight.remove(name);
        if dispatch.pending.is_empty() || dispatch.in_flight.len() >= MAX_IN_FLIGHT {
            return;
        }
        reorder_publish_first(&mut dispatch.pending);
        let (next_name, next_batch) = dispatch.pending.remove(0);
        dispatch.in_flight.insert(next_name.clone());
        drop(dispatch);
        tokio::spawn(Inner::run_batch(inner.clone(), next_name, next_batch));
    }

    async fn run_batch(inner: Arc<Inner>, name: String, mut batch: AdminBatch) {
        let op = batch.op;
        let paths = stage_paths(op, &batch.records);

        let outcome = if paths.is_empty() {
            // Nothing survived the previous stage; resolve as a no-op.
            Ok(Vec::new())
        } else {
            inner.execute_bulk(&name, op, &paths).await
        };

        let now = Utc::now();
        match outcome {
            Ok(successful) => {
                if paths.is_empty() {
                    resolve(&mut batch, false);
                    Inner::finish_task(&inner, &name);
                    return;
                }
                let success_set: HashSet<&str> = successful.iter().map(|s| s.as_str()).collect();
                for record in &mut batch.records {
                    if !attempted(op, record) {
                        continue;
                    }
                    if success_set.contains(record.path.as_str()) {
                        stamp(op, record, now);
                    } else {
                        record.mark_failed(format!(
                            "{} did not report success for {}",
                            op.label(),
                            record.path
                        ));
                    }
                }
                match op {
                    BatchOp::Preview => inner.transition(batch, BatchOp::Publish),
                    BatchOp::UnpublishLive => inner.transition(batch, BatchOp::UnpublishPreview),
                    BatchOp::Publish | BatchOp::UnpublishPreview => resolve(&mut batch, false),
                }
            }
            Err(err @ AdminError::Batch { .. }) => {
                tracing::warn!(operation = %name, error = %err, "admin batch failed");
                for record in &mut batch.records {
                    record.mark_failed(err.to_string());
                }
                resolve(&mut batch, true);
            }
            Err(err) => {
                tracing::error!(operation = %name, error = %err, "admin job failed globally");
                for record in &mut batch.records {
                    record.mark_failed(err.to_string());
                }
                inner.global_error.lock().get_or_insert(err);
                resolve(&mut batch, true);
            }
        }

        Inner::finish_task(&inner, &name);
    }

    fn transition(&self, mut batch: AdminBatch, next: BatchOp) {
        batch.op = next;
        self.queues.lock().of(next).push(batch);
    }

    /// Submit the bulk job and poll it to completion; returns the paths the
    /// job reported as successful.
    async fn execute_bulk(
        &self,
        name: &str,
        op: BatchOp,
        paths: &[String],
    ) -> Result<Vec<String>, AdminError> {
        if self.config.is_mock() {
            tokio::time::sleep(MOCK_DELAY).await;
            return Ok(paths.to_vec());
        }

        let url = format!(
            "https://{}/{}/{}/{}/main/*",
            self.config.host,
            op.route(),
            self.config.org,
            self.config.site
        );
        let body = json!({
            "forceUpdate": true,
            "paths": paths,
            "delete": op.is_delete(),
        });

        let response = run_with_retry(name, self.config.retry, || {
            let opts = self.with_auth(RequestOptions::post_json(body.clone()));
            self.http.request(name, &url, opts)
        })
        .await
        .map_err(|e| AdminError::Batch {
            operation: name.to_string(),
            message: e.to_string(),
        })?;

        let job: AdminJobHandle = response
            .as_ref()
            .and_then(|v| v.get("job"))
            .and_then(|j| {
                serde_json::from_value(normalize_job(j.clone())).ok()
            })
            .ok_or_else(|| AdminError::Batch {
                operation: name.to_string(),
                message: "admin response carries no job".to_string(),
            })?;

        let details_link = self.poll_job(&job).await?;

        let Some(link) = details_link else {
            // No details means no per-path outcomes: everything in this
            // batch counts as failed.
            tracing::warn!(operation = name, "admin job finished without details link");
            return Ok(Vec::new());
        };

        let details = run_with_retry("job-details", self.config.retry, || {
            let opts = self.with_auth(RequestOptions::get());
            self.http.request("job-details", &link, opts)
        })
        .await
        .map_err(|e| AdminError::Global {
            operation: "job-details".to_string(),
            message: e.to_string(),
        })?;

        Ok(successful_paths(details.as_ref()))
    }

    /// Poll the job every `poll_interval` until its state is `stopped`.
    async fn poll_job(&self, job: &AdminJobHandle) -> Result<Option<String>, AdminError> {
        let status_url = format!(
            "https://{}/job/{}/{}",
            self.config.host, job.topic, job.name
        );
        let mut details_link = job.details_link.clone();
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let status = run_with_retry("job-status", self.config.retry, || {
                let opts = self.with_auth(RequestOptions::get());
                self.http.request("job-status", &status_url, opts)
            })
            .await
            .map_err(|e| AdminError::Global {
                operation: "job-status".to_string(),
                message: e.to_string(),
            })?;

            let Some(status) = status else { continue };
            if let Some(link) = status
                .get("links")
                .and_then(|l| l.get("details"))
                .and_then(|v| v.as_str())
            {
                details_link = Some(link.to_string());
            }
            let state = status.get("state").and_then(|v| v.as_str()).unwrap_or("");
            if state == "stopped" {
                return Ok(details_link);
            }
        }
    }

    fn with_auth(&self, opts: RequestOptions) -> RequestOptions {
        match &self.config.auth_token {
            Some(token) => opts.with_header("x-auth-token", token.clone()),
            None => opts,
        }
    }
}

/// Paths attempted at this stage: preview and unpublish-live take every
/// record; publish only previewed records; unpublish-preview only records
/// already unpublished from live.
fn attempted(op: BatchOp, record: &BatchRecord) -> bool {
    match op {
        BatchOp::Preview | BatchOp::UnpublishLive => true,
        BatchOp::Publish => record.previewed_at.is_some(),
        BatchOp::UnpublishPreview => record.live_unpublished_at.is_some(),
    }
}

fn stage_paths(op: BatchOp, records: &[BatchRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| attempted(op, r))
        .map(|r| r.path.clone())
        .collect()
}

fn stamp(op: BatchOp, record: &mut BatchRecord, now: chrono::DateTime<Utc>) {
    match op {
        BatchOp::Preview => record.previewed_at = Some(now),
        BatchOp::Publish => record.published_at = Some(now),
        BatchOp::UnpublishLive => record.live_unpublished_at = Some(now),
        BatchOp::UnpublishPreview => record.preview_unpublished_at = Some(now),
    }
}

fn resolve(batch: &mut AdminBatch, failed: bool) {
    if let Some(done) = batch.done.take() {
        let _ = done.send(BatchOutcome {
            records: std::mem::take(&mut batch.records),
            locale: batch.locale.take(),
            batch_no: batch.batch_no,
            failed,
        });
    }
}

/// Stable publish-first order for the pending list.
fn reorder_publish_first(pending: &mut [(String, AdminBatch)]) {
    pending.sort_by_key(|(_, batch)| (batch.op != BatchOp::Publish) as u8);
}

/// Admin job handles arrive as `{topic, name, state, progress, links}`;
/// fold `links.details` into the flat shape the runtime keeps.
fn normalize_job(mut job: serde_json::Value) -> serde_json::Value {
    let details = job
        .get("links")
        .and_then(|l| l.get("details"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let (Some(obj), Some(details)) = (job.as_object_mut(), details) {
        obj.insert("details_link".to_string(), serde_json::Value::String(details));
    }
    job
}

/// Per-path outcomes with an HTTP status in `[200, 300)` are successful.
fn successful_paths(details: Option<&serde_json::Value>) -> Vec<String> {
    let Some(details) = details else {
        return Vec::new();
    };
    let resources = details
        .get("data")
        .and_then(|d| d.get("resources"))
        .or_else(|| details.get("resources"))
        .and_then(|v| v.as_array());
    let Some(resources) = resources else {
        return Vec::new();
    };
    resources
        .iter()
        .filter(|r| {
            r.get("status")
                .and_then(|s| s.as_u64())
                .map(|s| (200..300).contains(&s))
                .unwrap_or(false)
        })
        .filter_map(|r| r.get("path").and_then(|p| p.as_str()).map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mock_scheduler() -> AdminScheduler {
        AdminScheduler::new(Arc::new(HttpClient::new()), AdminConfig::new("mock", "site"))
    }

    fn record(sku: &str) -> BatchRecord {
        BatchRecord::new(sku, format!("/products/{}", sku.to_lowercase()))
    }

    #[tokio::test(start_paused = true)]
    async fn preview_then_publish_orders_stage_timestamps() {
        let scheduler = mock_scheduler();
        scheduler.start_processing();

        let completion =
            scheduler.preview_and_publish(vec![record("ADB177"), record("ADB178")], None, 1);
        let outcome = completion.await.unwrap();

        assert!(!outcome.failed);
        assert_eq!(outcome.batch_no, 1);
        for record in &outcome.records {
            let previewed = record.previewed_at.expect("previewed");
            let published = record.published_at.expect("published");
            assert!(previewed < published);
            assert!(!record.failed);
        }
        scheduler.stop_processing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unpublish_pair_orders_stage_timestamps() {
        let scheduler = mock_scheduler();
        scheduler.start_processing();

        let completion = scheduler.unpublish_and_delete(vec![record("SKU-OLD")], None, 1);
        let outcome = completion.await.unwrap();

        assert!(!outcome.failed);
        let record = &outcome.records[0];
        let live = record.live_unpublished_at.expect("live unpublished");
        let preview = record.preview_unpublished_at.expect("preview unpublished");
        assert!(live < preview);
        scheduler.stop_processing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_resolves_immediately() {
        let scheduler = mock_scheduler();
        scheduler.start_processing();
        let outcome = scheduler
            .preview_and_publish(Vec::new(), None, 7)
            .await
            .unwrap();
        assert!(!outcome.failed);
        assert!(outcome.records.is_empty());
        scheduler.stop_processing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stop_callers_all_resolve() {
        let scheduler = mock_scheduler();
        scheduler.start_processing();
        let completion = scheduler.preview_and_publish(vec![record("ADB177")], None, 1);

        let a = scheduler.clone();
        let b = scheduler.clone();
        let (first, second) = tokio::join!(a.stop_processing(), b.stop_processing());
        let _ = (first, second);

        let outcome = completion.await.unwrap();
        assert!(!outcome.failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_start_resolves_immediately() {
        let scheduler = mock_scheduler();
        scheduler.stop_processing().await;
    }

    #[tokio::test]
    async fn unreachable_admin_is_a_batch_failure_not_global() {
        let mut config = AdminConfig::new("org", "site");
        config.host = "127.0.0.1:9".to_string();
        config.retry = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
        };
        config.tick_interval = Duration::from_millis(10);
        let scheduler = AdminScheduler::new(
            Arc::new(HttpClient::new().with_timeout(Duration::from_millis(200))),
            config,
        );
        scheduler.start_processing();

        let outcome = scheduler
            .preview_and_publish(vec![record("ADB177")], None, 1)
            .await
            .unwrap();
        assert!(outcome.failed);
        assert!(outcome.records.iter().all(|r| r.failed));
        assert!(scheduler.take_global_error().is_none());
        scheduler.stop_processing().await;
    }

    #[test]
    fn publish_stage_filters_unpreviewed_records() {
        let previewed = {
            let mut r = record("A");
            r.previewed_at = Some(Utc::now());
            r
        };
        let unpreviewed = record("B");
        let paths = stage_paths(BatchOp::Publish, &[previewed, unpreviewed]);
        assert_eq!(paths, vec!["/products/a"]);
    }

    #[test]
    fn unpublish_preview_requires_live_unpublish_first() {
        let mut done = record("A");
        done.live_unpublished_at = Some(Utc::now());
        let pending = record("B");
        let paths = stage_paths(BatchOp::UnpublishPreview, &[done, pending]);
        assert_eq!(paths, vec!["/products/a"]);
    }

    #[test]
    fn pending_list_reorders_publish_first_stably() {
        let make = |op, sku: &str| {
            (
                format!("{}-{sku}", op_label(op)),
                AdminBatch {
                    op,
                    records: vec![record(sku)],
                    locale: None,
                    batch_no: 0,
                    done: None,
                },
            )
        };
        fn op_label(op: BatchOp) -> &'static str {
            op.label()
        }

        let mut pending = vec![
            make(BatchOp::Preview, "P1"),
            make(BatchOp::Publish, "B1"),
            make(BatchOp::UnpublishLive, "U1"),
            make(BatchOp::Publish, "B2"),
        ];
        reorder_publish_first(&mut pending);
        let order: Vec<&str> = pending.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            order,
            vec!["publish-B1", "publish-B2", "preview-P1", "unpublish-live-U1"]
        );
    }

    #[test]
    fn successful_paths_filters_by_status_range() {
        let details = json!({
            "data": {"resources": [
                {"path": "/a", "status": 200},
                {"path": "/b", "status": 299},
                {"path": "/c", "status": 404},
                {"path": "/d"},
            ]}
        });
        assert_eq!(successful_paths(Some(&details)), vec!["/a", "/b"]);
        assert!(successful_paths(None).is_empty());
    }

    #[test]
    fn job_handle_normalizes_details_link() {
        let job = normalize_job(json!({
            "topic": "publish",
            "name": "job-1",
            "state": "running",
            "links": {"details": "https://admin/job/publish/job-1/details"}
        }));
        let handle: AdminJobHandle = serde_json::from_value(job).unwrap();
        assert_eq!(
            handle.details_link.as_deref(),
            Some("https://admin/job/publish/job-1/details")
        );
    }
}
