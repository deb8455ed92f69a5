//! Shared fakes for AppHarvest integration tests
//!
//! - [`ScriptedUpstream`]: deterministic categories and paginated reviews,
//!   with injectable failures
//! - [`FailingStore`]: a [`MemoryStore`] that fails chosen insert calls and
//!   records every batch it was handed
//! - [`ScriptedLauncher`]: in-process stand-in for worker processes
//! - [`FixedProbe`]: settable host pressure and process memory

#![allow(dead_code)]

use appharvest_ingest::error::Result;
use appharvest_ingest::framework::{
    MemoryProbe, ResourceProbe, ResourceSnapshot, WorkUnit, WorkerExit, WorkerLauncher,
};
use appharvest_ingest::store::{MemoryStore, RecordStore, StoreError, StoreErrorKind};
use appharvest_ingest::upstream::{
    AppDetail, AppSummary, ReviewItem, ReviewPage, UpstreamError, UpstreamSource,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,appharvest_ingest=info")),
        )
        .with_test_writer()
        .try_init();
}

/// Review id the scripted upstream assigns to the `n`-th review of `app_id`
pub fn review_id(app_id: &str, n: usize) -> String {
    format!("{app_id}-r{n}")
}

pub fn review_item(app_id: &str, n: usize) -> ReviewItem {
    ReviewItem {
        id: Some(review_id(app_id, n)),
        user_name: Some(format!("user{n}")),
        score: Some(json!(1 + (n % 5))),
        text: Some(format!("review number {n}")),
        date: Some("2024-03-01T12:00:00Z".to_string()),
        thumbs_up: Some(json!(n % 7)),
        version: Some("1.0.0".to_string()),
        ..Default::default()
    }
}

/// Store row matching what the sink writes for `review_item(app_id, n)`
pub fn stored_review_row(app_id: &str, n: usize) -> Value {
    json!({
        "app_id": app_id,
        "review_id": review_id(app_id, n),
        "rating": 1 + (n % 5),
    })
}

pub fn page_cursor(index: usize) -> String {
    format!("page-{index}")
}

struct ScriptedApp {
    pages: usize,
    per_page: usize,
}

struct CancelAfter {
    pages: usize,
    token: CancellationToken,
}

/// Deterministic upstream: `pages` pages of `per_page` reviews per app.
/// Cursors are `page-N`; the last page has no next cursor.
#[derive(Default)]
pub struct ScriptedUpstream {
    categories: Mutex<HashMap<String, Vec<String>>>,
    apps: Mutex<HashMap<String, ScriptedApp>>,
    failures: Mutex<VecDeque<UpstreamError>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
    served: AtomicUsize,
    cancel_after: Mutex<Option<CancelAfter>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(self, category: &str, app_id: &str, pages: usize, per_page: usize) -> Self {
        self.categories
            .lock()
            .entry(category.to_string())
            .or_default()
            .push(app_id.to_string());
        self.apps
            .lock()
            .insert(app_id.to_string(), ScriptedApp { pages, per_page });
        self
    }

    /// Fail the next `times` calls (of any kind) with `error`
    pub fn fail_next(&self, error: UpstreamError, times: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Cancel `token` while serving the `pages`-th review page
    pub fn cancel_after_pages(&self, pages: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some(CancelAfter { pages, token });
    }

    /// Every review page request as `(app_id, cursor)`
    pub fn page_requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().clone()
    }

    fn injected_failure(&self) -> Option<UpstreamError> {
        self.failures.lock().pop_front()
    }
}

#[async_trait]
impl UpstreamSource for ScriptedUpstream {
    async fn list(&self, category: &str) -> std::result::Result<Vec<AppSummary>, UpstreamError> {
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        let apps = self.categories.lock().get(category).cloned().unwrap_or_default();
        Ok(apps
            .into_iter()
            .map(|app_id| AppSummary {
                title: Some(format!("{app_id} title")),
                app_id,
                developer: Some("Example Studio".to_string()),
                score: Some(4.2),
            })
            .collect())
    }

    async fn details(&self, app_id: &str) -> std::result::Result<AppDetail, UpstreamError> {
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        Ok(AppDetail {
            app_id: app_id.to_string(),
            title: Some(format!("{app_id} title")),
            developer: Some("Example Studio".to_string()),
            genre: Some("Tools".to_string()),
            installs: Some("1,000+".to_string()),
            score: Some(json!(4.2)),
            ratings: Some(json!(120)),
            reviews: Some(json!(80)),
            price: Some(json!(0)),
            free: Some(true),
            version: Some("1.0.0".to_string()),
        })
    }

    async fn review_page(
        &self,
        app_id: &str,
        cursor: Option<&str>,
    ) -> std::result::Result<ReviewPage, UpstreamError> {
        self.requests
            .lock()
            .push((app_id.to_string(), cursor.map(str::to_string)));
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        let (pages, per_page) = match self.apps.lock().get(app_id) {
            Some(app) => (app.pages, app.per_page),
            None => return Ok(ReviewPage::default()),
        };
        let index = match cursor {
            None => 0,
            Some(c) => c
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| UpstreamError::Malformed(format!("unknown cursor {c}")))?,
        };

        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(cancel) = self.cancel_after.lock().as_ref() {
            if served >= cancel.pages {
                cancel.token.cancel();
            }
        }

        if index >= pages {
            return Ok(ReviewPage::default());
        }
        let start = index * per_page;
        Ok(ReviewPage {
            items: (start..start + per_page).map(|n| review_item(app_id, n)).collect(),
            next_cursor: (index + 1 < pages).then(|| page_cursor(index + 1)),
        })
    }
}

/// [`MemoryStore`] that fails chosen insert calls (1-based call numbers)
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failures: Mutex<HashMap<usize, StoreErrorKind>>,
    calls: AtomicUsize,
    batches: Mutex<Vec<(String, usize)>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_call(&self, call: usize, kind: StoreErrorKind) {
        self.failures.lock().insert(call, kind);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Row count of every insert call against `table`, in call order
    pub fn batch_sizes(&self, table: &str) -> Vec<usize> {
        self.batches
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, rows)| *rows)
            .collect()
    }

    fn next_call(&self, table: &str, rows: usize) -> std::result::Result<(), StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batches.lock().push((table.to_string(), rows));
        match self.failures.lock().get(&call).copied() {
            Some(kind) => Err(StoreError::new(kind, format!("injected failure on call {call}"))),
            None => Ok(()),
        }
    }

    /// Insert rows directly, bypassing failure injection and call counting
    pub async fn seed(&self, table: &str, rows: &[Value]) {
        if let Err(e) = self.inner.insert_many(table, rows).await {
            panic!("seeding {table} failed: {e}");
        }
    }

    pub fn count(&self, table: &str) -> usize {
        self.inner.count(table)
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner.rows(table)
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn insert_many(&self, table: &str, rows: &[Value]) -> std::result::Result<(), StoreError> {
        self.next_call(table, rows.len())?;
        self.inner.insert_many(table, rows).await
    }

    async fn insert_new(
        &self,
        table: &str,
        rows: &[Value],
        conflict_columns: &str,
    ) -> std::result::Result<usize, StoreError> {
        self.next_call(table, rows.len())?;
        self.inner.insert_new(table, rows, conflict_columns).await
    }

    async fn select_page(
        &self,
        table: &str,
        columns: &str,
        offset: usize,
        limit: usize,
    ) -> std::result::Result<Vec<Value>, StoreError> {
        self.inner.select_page(table, columns, offset, limit).await
    }
}

/// Host pressure and process memory under test control
pub struct FixedProbe {
    snapshot: Mutex<ResourceSnapshot>,
    process_mb: AtomicUsize,
}

impl FixedProbe {
    pub fn new(memory_percent: f64) -> Self {
        Self {
            snapshot: Mutex::new(ResourceSnapshot {
                memory_percent,
                load_per_cpu: 0.2,
            }),
            process_mb: AtomicUsize::new(0),
        }
    }

    pub fn set_memory_percent(&self, memory_percent: f64) {
        self.snapshot.lock().memory_percent = memory_percent;
    }

    pub fn set_process_mb(&self, mb: usize) {
        self.process_mb.store(mb, Ordering::SeqCst);
    }
}

impl ResourceProbe for FixedProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        *self.snapshot.lock()
    }
}

impl MemoryProbe for FixedProbe {
    fn process_memory_mb(&self) -> u64 {
        self.process_mb.load(Ordering::SeqCst) as u64
    }
}

/// Worker stand-in: runs for `duration` of (virtual) time, then exits with
/// the scripted result. Stops early, interrupted, on shutdown.
pub struct ScriptedLauncher {
    duration: Duration,
    exits: Mutex<HashMap<String, WorkerExit>>,
    launched: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            exits: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_exit(self, category: &str, exit: WorkerExit) -> Self {
        self.exits.lock().insert(category.to_string(), exit);
        self
    }

    /// Categories in launch order
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    /// Highest number of workers running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn run(&self, unit: WorkUnit, shutdown: CancellationToken) -> Result<WorkerExit> {
        self.launched.lock().push(unit.unit_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let exit = tokio::select! {
            _ = shutdown.cancelled() => WorkerExit::interrupted(),
            _ = tokio::time::sleep(self.duration) => self
                .exits
                .lock()
                .get(&unit.unit_id)
                .cloned()
                .unwrap_or_else(WorkerExit::success),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(exit)
    }
}
