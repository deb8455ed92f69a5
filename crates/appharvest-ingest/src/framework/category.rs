//! Category worker: the body of one `appharvest worker` process
//!
//! Lists the category's apps and records their chart positions, skips the
//! ones the ledger already marks complete (or, with no ledger record, that
//! already have reviews in the store), and runs the rest through
//! [`ResumableWorker`] one after another with a single throttle shared
//! across the whole process.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ledger::ProgressLedger;
use super::throttle::{AdaptiveThrottle, ThrottleConfig};
use super::types::{AppRankPayload, FlushOutcome, RecordKind, ResultRecord, WorkUnit, WorkUnitStatus};
use super::worker::{fetch_with_retry, Fetch, ResumableWorker};
use crate::error::{HarvestError, Result};
use crate::upstream::{AppSummary, UpstreamSource};

/// Log throttle statistics every this many finished apps
pub const DEFAULT_STATS_EVERY: u64 = 10;

/// Chart the category listing is read from
pub const DEFAULT_RANK_COLLECTION: &str = "top_free";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategorySummary {
    pub category: String,
    pub apps_listed: usize,
    /// Already complete according to the ledger, or already in the store
    pub apps_skipped: usize,
    pub apps_completed: usize,
    pub apps_failed: Vec<String>,
    pub records: FlushOutcome,
    pub metadata: FlushOutcome,
    pub ranks: FlushOutcome,
    pub interrupted: bool,
}

impl CategorySummary {
    /// Exit status of the worker process
    pub fn success(&self) -> bool {
        self.apps_failed.is_empty() && !self.interrupted
    }
}

pub struct CategoryWorker {
    upstream: Arc<dyn UpstreamSource>,
    worker: ResumableWorker,
    ledger: Arc<ProgressLedger>,
    throttle_config: ThrottleConfig,
    collect_metadata: bool,
    rank_collection: Option<String>,
    skip_stored: bool,
    stats_every: u64,
}

impl CategoryWorker {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        worker: ResumableWorker,
        ledger: Arc<ProgressLedger>,
        throttle_config: ThrottleConfig,
    ) -> Self {
        Self {
            upstream,
            worker,
            ledger,
            throttle_config,
            collect_metadata: false,
            rank_collection: None,
            skip_stored: true,
            stats_every: DEFAULT_STATS_EVERY,
        }
    }

    pub fn with_metadata(mut self, collect: bool) -> Self {
        self.collect_metadata = collect;
        self
    }

    /// Store the listing order as chart positions under `collection`
    pub fn with_ranks(mut self, collection: Option<String>) -> Self {
        self.rank_collection = collection;
        self
    }

    /// Skip apps with no ledger record whose reviews are already stored
    pub fn with_store_check(mut self, enabled: bool) -> Self {
        self.skip_stored = enabled;
        self
    }

    async fn record_ranks(&self, category: &str, listing: &[AppSummary]) -> Option<FlushOutcome> {
        let collection = self.rank_collection.as_deref()?;
        let rank_date = Utc::now().date_naive();
        let records: Vec<ResultRecord> = listing
            .iter()
            .zip(1u32..)
            .map(|(app, position)| {
                ResultRecord::app_rank(
                    app.app_id.as_str(),
                    AppRankPayload {
                        category: category.to_string(),
                        position,
                        collection: collection.to_string(),
                        title: app.title.clone(),
                        rank_date,
                    },
                )
            })
            .collect();
        if records.is_empty() {
            return None;
        }

        let outcome = self.worker.sink().flush(&records).await;
        if outcome.has_failures() {
            warn!(category, failed = outcome.failed, "Some chart positions were not stored");
        }
        Some(outcome)
    }

    /// App ids that already have reviews stored. Empty when the check is
    /// off or the store can't be read.
    async fn stored_apps(&self, category: &str) -> HashSet<String> {
        if !self.skip_stored {
            return HashSet::new();
        }
        match self.worker.sink().stored_units(RecordKind::Review).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(category, error = %e, "Could not read stored apps, relying on the ledger only");
                HashSet::new()
            },
        }
    }

    pub async fn run(&self, category: &str, cancel: &CancellationToken) -> Result<CategorySummary> {
        let started = Instant::now();
        let mut throttle = AdaptiveThrottle::new(self.throttle_config.clone());
        let mut summary = CategorySummary {
            category: category.to_string(),
            ..Default::default()
        };

        let policy = self.worker.config().retry_policy();
        let listing = match fetch_with_retry(&mut throttle, cancel, &policy, "category listing", || {
            self.upstream.list(category)
        })
        .await
        {
            Fetch::Ok(apps) => apps,
            Fetch::Cancelled => {
                summary.interrupted = true;
                return Ok(summary);
            },
            Fetch::Aborted(err) | Fetch::Exhausted(err) => {
                return Err(HarvestError::UnitFailed {
                    unit_id: category.to_string(),
                    reason: format!("category listing failed: {err}"),
                    records_so_far: 0,
                });
            },
        };

        let mut seen = HashSet::new();
        let listing: Vec<AppSummary> = listing
            .into_iter()
            .map(|app| AppSummary {
                app_id: app.app_id.trim().to_string(),
                ..app
            })
            .filter(|app| !app.app_id.is_empty() && seen.insert(app.app_id.clone()))
            .collect();
        summary.apps_listed = listing.len();

        if let Some(outcome) = self.record_ranks(category, &listing).await {
            summary.ranks = outcome;
        }

        let app_ids: Vec<String> = listing.into_iter().map(|app| app.app_id).collect();
        let progress = self.ledger.load(category)?;
        let stored = self.stored_apps(category).await;
        let pending: Vec<&String> = app_ids
            .iter()
            .filter(|id| match progress.get(*id) {
                Some(record) => !self.ledger.is_complete(record),
                None => !stored.contains(*id),
            })
            .collect();
        summary.apps_skipped = app_ids.len() - pending.len();

        info!(
            category,
            listed = summary.apps_listed,
            already_done = summary.apps_skipped,
            to_scrape = pending.len(),
            ranks_stored = summary.ranks.accepted(),
            "Category listed"
        );

        let total = pending.len();
        let mut finished: u64 = 0;

        for app_id in pending {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            let resume = progress.get(app_id);
            let unit = WorkUnit::new(category, app_id.as_str()).with_status(
                resume.map_or(WorkUnitStatus::Pending, |_| WorkUnitStatus::InProgress),
            );

            if self.collect_metadata {
                if let Some(outcome) = self
                    .worker
                    .capture_metadata(category, app_id, &mut throttle, cancel)
                    .await
                {
                    summary.metadata += outcome;
                }
            }

            match self.worker.process_unit(&unit, resume, &mut throttle, cancel).await {
                Ok(outcome) if outcome.completed => {
                    summary.apps_completed += 1;
                    summary.records += outcome.flushed;
                },
                Ok(outcome) => {
                    summary.records += outcome.flushed;
                    summary.interrupted = true;
                    break;
                },
                Err(e) if e.is_unit_scoped() => {
                    warn!(category, app_id = %app_id, error = %e, "App failed, continuing");
                    summary.apps_failed.push(app_id.clone());
                },
                Err(e) => return Err(e),
            }

            finished += 1;
            let hours = started.elapsed().as_secs_f64() / 3600.0;
            let apps_per_hour = if hours > 0.0 { finished as f64 / hours } else { 0.0 };
            info!(
                category,
                app_id = %app_id,
                done = finished,
                total,
                percent = %format!("{:.2}", finished as f64 / total as f64 * 100.0),
                apps_per_hour = %format!("{:.2}", apps_per_hour),
                stored = summary.records.accepted(),
                "Progress"
            );

            if finished % self.stats_every == 0 {
                let stats = throttle.stats();
                info!(
                    category,
                    successes = stats.successes,
                    errors = stats.errors,
                    rate_limit_hits = stats.rate_limit_hits,
                    current_delay_ms = stats.current_delay_ms,
                    requests_per_minute = stats.requests_per_minute,
                    "Throttle stats"
                );
            }
        }

        info!(
            category,
            completed = summary.apps_completed,
            failed = summary.apps_failed.len(),
            skipped = summary.apps_skipped,
            inserted = summary.records.inserted,
            duplicates = summary.records.skipped,
            dropped = summary.records.dropped,
            interrupted = summary.interrupted,
            elapsed_secs = started.elapsed().as_secs(),
            "Category finished"
        );

        Ok(summary)
    }
}
