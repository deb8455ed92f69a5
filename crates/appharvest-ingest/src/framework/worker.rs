//! Resumable per-unit worker
//!
//! Drives one app's paginated review stream through the throttle and sink:
//!
//! 1. wait on the throttle, fetch the next page (with retries)
//! 2. normalize each item into the in-memory batch, flushing whenever the
//!    batch is full or process memory crosses the limit
//! 3. at a page boundary with a full batch, flush and checkpoint
//! 4. stop when upstream has no next cursor, the per-unit cap is reached,
//!    or the throttle says to abort
//!
//! Checkpoints are only written at page boundaries with an empty batch, so a
//! ledger record's `(cursor_token, records_so_far)` always agree: every item
//! before that cursor is in the store and counted. Replaying from a
//! checkpoint re-reads already-stored reviews as duplicate skips.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ledger::ProgressLedger;
use super::resources::MemoryProbe;
use super::sink::RecordSink;
use super::throttle::{AdaptiveThrottle, ErrorClass};
use super::types::{Batch, FlushOutcome, ProgressRecord, WorkUnit, WorkUnitStatus};
use super::validation::{Normalizer, ValidationStats};
use crate::error::{HarvestError, Result};
use crate::upstream::{UpstreamError, UpstreamSource};

// ============================================================================
// Worker Defaults
// ============================================================================

pub const DEFAULT_BUFFER_SIZE: usize = 250;
pub const DEFAULT_MAX_RECORDS_PER_UNIT: u64 = 5000;
pub const DEFAULT_PAGE_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_RATE_LIMIT_PAUSE_MS: u64 = 5000;
pub const DEFAULT_MEMORY_CHECK_EVERY: u64 = 500;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 768;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub buffer_size: usize,
    pub max_records_per_unit: u64,
    pub page_max_retries: u32,
    pub retry_delay: Duration,
    pub rate_limit_pause: Duration,
    /// Inspect process memory every this many items; 0 disables the valve
    pub memory_check_every: u64,
    pub memory_limit_mb: u64,
    pub language: String,
    pub country: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_records_per_unit: DEFAULT_MAX_RECORDS_PER_UNIT,
            page_max_retries: DEFAULT_PAGE_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            rate_limit_pause: Duration::from_millis(DEFAULT_RATE_LIMIT_PAUSE_MS),
            memory_check_every: DEFAULT_MEMORY_CHECK_EVERY,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            language: "en".to_string(),
            country: "us".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.page_max_retries,
            retry_delay: self.retry_delay,
            rate_limit_pause: self.rate_limit_pause,
        }
    }
}

/// Retry rules for one throttled upstream call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Linear backoff step: the n-th retry waits `retry_delay * n`
    pub retry_delay: Duration,
    /// Extra pause after a rate-limit response; does not use up a retry
    pub rate_limit_pause: Duration,
}

/// Result of a throttled, retried upstream call
#[derive(Debug)]
pub enum Fetch<T> {
    Ok(T),
    Cancelled,
    /// The throttle's consecutive-error ceiling was exceeded
    Aborted(UpstreamError),
    /// Retries used up
    Exhausted(UpstreamError),
}

/// Issue one upstream call through the throttle, retrying failures.
///
/// Rate-limit responses pause for `rate_limit_pause` without consuming the
/// retry budget; the throttle's abort ceiling still bounds them.
pub async fn fetch_with_retry<T, F, Fut>(
    throttle: &mut AdaptiveThrottle,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    what: &str,
    mut call: F,
) -> Fetch<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, UpstreamError>>,
{
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Fetch::Cancelled,
            _ = throttle.wait_for_next_request() => {},
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Fetch::Cancelled,
            result = call() => result,
        };

        let err = match result {
            Ok(value) => {
                throttle.record_success();
                return Fetch::Ok(value);
            },
            Err(err) => err,
        };

        let class = throttle.record_error(&err);
        if throttle.should_abort() {
            warn!(
                what,
                consecutive_errors = throttle.consecutive_errors(),
                error = %err,
                "Too many consecutive upstream errors, aborting"
            );
            return Fetch::Aborted(err);
        }

        let pause = if class == ErrorClass::RateLimit {
            policy.rate_limit_pause
        } else {
            failures += 1;
            if failures > policy.max_retries {
                warn!(what, attempts = failures, error = %err, "Upstream retries exhausted");
                return Fetch::Exhausted(err);
            }
            policy.retry_delay.saturating_mul(failures)
        };

        warn!(
            what,
            attempt = failures,
            max_retries = policy.max_retries,
            class = ?class,
            pause_ms = pause.as_millis() as u64,
            error = %err,
            "Upstream request failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Fetch::Cancelled,
            _ = tokio::time::sleep(pause) => {},
        }
    }
}

/// What happened to one unit
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub unit_id: String,
    /// Total records known stored for the unit, including earlier runs
    pub records_so_far: u64,
    /// Sink accounting for this run only
    pub flushed: FlushOutcome,
    pub pages: u64,
    pub validation: ValidationStats,
    /// False when the run was paused by cancellation
    pub completed: bool,
    /// Where a later run should resume
    pub cursor: Option<String>,
}

impl UnitOutcome {
    pub fn records_written(&self) -> u64 {
        self.flushed.inserted
    }
}

/// Mutable state of one `process_unit` call
struct UnitRun {
    partition: String,
    unit_id: String,
    base: u64,
    taken: u64,
    /// Cursor of the next page to fetch
    cursor: Option<String>,
    checkpoint_cursor: Option<String>,
    checkpoint_records: u64,
    batch: Batch,
    flushed: FlushOutcome,
    pages: u64,
    items_seen: u64,
    normalizer: Normalizer,
}

impl UnitRun {
    fn records_so_far(&self) -> u64 {
        self.base + self.flushed.accepted()
    }

    fn progress(&self, status: WorkUnitStatus) -> ProgressRecord {
        ProgressRecord::new(&self.partition, &self.unit_id, status, self.records_so_far())
            .with_cursor(self.cursor.clone())
    }

    fn outcome(&self, completed: bool) -> UnitOutcome {
        UnitOutcome {
            unit_id: self.unit_id.clone(),
            records_so_far: self.records_so_far(),
            flushed: self.flushed,
            pages: self.pages,
            validation: self.normalizer.stats(),
            completed,
            cursor: self.cursor.clone(),
        }
    }
}

pub struct ResumableWorker {
    upstream: Arc<dyn UpstreamSource>,
    sink: RecordSink,
    ledger: Arc<ProgressLedger>,
    memory: Arc<dyn MemoryProbe>,
    config: WorkerConfig,
}

impl ResumableWorker {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        sink: RecordSink,
        ledger: Arc<ProgressLedger>,
        memory: Arc<dyn MemoryProbe>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            upstream,
            sink,
            ledger,
            memory,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn sink(&self) -> &RecordSink {
        &self.sink
    }

    /// Drive one unit to completion, resuming from `resume` when given.
    ///
    /// Returns `UnitFailed` when page or sink retries run out and
    /// `UnitAborted` when the throttle gives up; both are recorded in the
    /// ledger before returning, after flushing whatever was buffered.
    pub async fn process_unit(
        &self,
        unit: &WorkUnit,
        resume: Option<&ProgressRecord>,
        throttle: &mut AdaptiveThrottle,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome> {
        let started = Instant::now();
        let cap = self.config.max_records_per_unit;
        let base = resume.map_or(0, |r| r.records_so_far);
        let cursor = resume.and_then(|r| r.cursor_token.clone());

        let mut run = UnitRun {
            partition: unit.partition.clone(),
            unit_id: unit.unit_id.clone(),
            base,
            taken: base,
            checkpoint_cursor: cursor.clone(),
            checkpoint_records: base,
            cursor,
            batch: Batch::new(self.config.buffer_size),
            flushed: FlushOutcome::default(),
            pages: 0,
            items_seen: 0,
            normalizer: Normalizer::new(&self.config.language, &self.config.country),
        };

        if base > 0 {
            info!(
                unit_id = %run.unit_id,
                records_so_far = base,
                cursor = run.cursor.as_deref().unwrap_or("-"),
                "Resuming unit"
            );
        } else {
            debug!(unit_id = %run.unit_id, "Starting unit");
        }

        let policy = self.config.retry_policy();

        while run.taken < cap {
            if cancel.is_cancelled() {
                return self.pause(&mut run).await;
            }

            let page_cursor = run.cursor.clone();
            let fetch = fetch_with_retry(throttle, cancel, &policy, "review page", || {
                self.upstream.review_page(&unit.unit_id, page_cursor.as_deref())
            })
            .await;

            let page = match fetch {
                Fetch::Ok(page) => page,
                Fetch::Cancelled => return self.pause(&mut run).await,
                Fetch::Aborted(err) => {
                    self.flush_buffer(&mut run).await?;
                    self.record_failure(&run, &err.to_string())?;
                    return Err(HarvestError::UnitAborted {
                        unit_id: run.unit_id.clone(),
                        consecutive_errors: throttle.consecutive_errors(),
                        records_so_far: run.records_so_far(),
                    });
                },
                Fetch::Exhausted(err) => {
                    self.flush_buffer(&mut run).await?;
                    self.record_failure(&run, &err.to_string())?;
                    return Err(HarvestError::UnitFailed {
                        unit_id: run.unit_id.clone(),
                        reason: format!("page fetch failed: {err}"),
                        records_so_far: run.records_so_far(),
                    });
                },
            };

            run.pages += 1;
            let next_cursor = page.next_cursor.filter(|c| !c.is_empty());
            let last_page = page.items.is_empty() || next_cursor.is_none();

            for item in &page.items {
                if run.taken >= cap {
                    break;
                }
                let Ok(record) = run.normalizer.review(&run.unit_id, item) else {
                    continue;
                };

                if run.batch.is_full() {
                    self.flush_buffer(&mut run).await?;
                }
                run.batch.push(record).map_err(|_| {
                    HarvestError::Validation(format!("buffer overflow for unit {}", run.unit_id))
                })?;
                run.taken += 1;
                run.items_seen += 1;

                if self.memory_pressure(run.items_seen) {
                    warn!(
                        unit_id = %run.unit_id,
                        buffered = run.batch.len(),
                        limit_mb = self.config.memory_limit_mb,
                        "Memory limit exceeded, flushing early"
                    );
                    self.flush_buffer(&mut run).await?;
                }
            }

            run.cursor = next_cursor;
            let done = last_page || run.taken >= cap;

            debug!(
                unit_id = %run.unit_id,
                page = run.pages,
                items = page.items.len(),
                taken = run.taken,
                buffered = run.batch.len(),
                "Page processed"
            );

            if done {
                break;
            }
            if run.batch.is_full() {
                self.flush_buffer(&mut run).await?;
                self.checkpoint(&mut run)?;
            }
        }

        self.flush_buffer(&mut run).await?;
        let record = run.progress(WorkUnitStatus::Completed);
        self.ledger.append(&record)?;

        let elapsed = started.elapsed();
        let per_minute = if elapsed.as_secs_f64() > 0.0 {
            run.flushed.accepted() as f64 / elapsed.as_secs_f64() * 60.0
        } else {
            0.0
        };
        let stats = run.normalizer.stats();
        info!(
            unit_id = %run.unit_id,
            records_so_far = run.records_so_far(),
            inserted = run.flushed.inserted,
            skipped = run.flushed.skipped,
            dropped = run.flushed.dropped,
            missing_key = stats.missing_key,
            clamped = stats.clamped,
            pages = run.pages,
            elapsed_secs = elapsed.as_secs(),
            records_per_minute = per_minute as u64,
            "Unit completed"
        );

        Ok(run.outcome(true))
    }

    /// Fetch and store one app's metadata. Best effort: failures are logged
    /// and reported as `None` without affecting the unit.
    pub async fn capture_metadata(
        &self,
        category: &str,
        app_id: &str,
        throttle: &mut AdaptiveThrottle,
        cancel: &CancellationToken,
    ) -> Option<FlushOutcome> {
        let policy = self.config.retry_policy();
        let detail = match fetch_with_retry(throttle, cancel, &policy, "app details", || {
            self.upstream.details(app_id)
        })
        .await
        {
            Fetch::Ok(detail) => detail,
            Fetch::Cancelled => return None,
            Fetch::Aborted(err) | Fetch::Exhausted(err) => {
                warn!(app_id, error = %err, "Skipping app metadata");
                return None;
            },
        };

        let mut normalizer = Normalizer::new(&self.config.language, &self.config.country);
        let record = normalizer.app_meta(category, &detail).ok()?;
        Some(self.sink.flush(std::slice::from_ref(&record)).await)
    }

    fn memory_pressure(&self, items_seen: u64) -> bool {
        let every = self.config.memory_check_every;
        every > 0
            && items_seen % every == 0
            && self.memory.process_memory_mb() > self.config.memory_limit_mb
    }

    /// Hand the batch to the sink. Any failed record fails the unit,
    /// recorded at the last consistent checkpoint.
    async fn flush_buffer(&self, run: &mut UnitRun) -> Result<()> {
        if run.batch.is_empty() {
            return Ok(());
        }
        let records = run.batch.take();
        let outcome = self.sink.flush(&records).await;
        run.flushed += outcome;

        if outcome.has_failures() {
            let reason = format!("{} records could not be stored", outcome.failed);
            let record = ProgressRecord::new(
                &run.partition,
                &run.unit_id,
                WorkUnitStatus::Failed,
                run.checkpoint_records,
            )
            .with_cursor(run.checkpoint_cursor.clone())
            .with_error(&reason);
            self.ledger.append(&record)?;

            return Err(HarvestError::UnitFailed {
                unit_id: run.unit_id.clone(),
                reason,
                records_so_far: run.checkpoint_records,
            });
        }
        Ok(())
    }

    fn checkpoint(&self, run: &mut UnitRun) -> Result<()> {
        run.checkpoint_cursor = run.cursor.clone();
        run.checkpoint_records = run.records_so_far();
        self.ledger.append(&run.progress(WorkUnitStatus::InProgress))
    }

    fn record_failure(&self, run: &UnitRun, error: &str) -> Result<()> {
        self.ledger
            .append(&run.progress(WorkUnitStatus::Failed).with_error(error))
    }

    /// Flush, record where to resume, and report the unit as not completed
    async fn pause(&self, run: &mut UnitRun) -> Result<UnitOutcome> {
        self.flush_buffer(run).await?;
        self.ledger
            .append(&run.progress(WorkUnitStatus::InProgress).with_error("interrupted"))?;
        info!(
            unit_id = %run.unit_id,
            records_so_far = run.records_so_far(),
            "Unit paused"
        );
        Ok(run.outcome(false))
    }
}
