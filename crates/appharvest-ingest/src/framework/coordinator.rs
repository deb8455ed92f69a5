//! Orchestrator for category workers
//!
//! Runs a single scheduling loop:
//! 1. Plan: drop categories the ledger marks completed, order the rest
//!    smallest-first by known app count
//! 2. Tick: measure host pressure and launch workers up to the window the
//!    pressure allows, staggered
//! 3. Exit: record each worker's result in the ledger and free its slot
//!
//! Concurrency decisions are made only here. Workers share nothing with the
//! orchestrator except the ledger directory and their exit status.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::launcher::{WorkerExit, WorkerLauncher};
use super::ledger::ProgressLedger;
use super::resources::{Health, HealthPolicy, ResourceProbe, ResourceSnapshot};
use super::types::{ProgressRecord, WorkUnit, WorkUnitStatus};
use crate::error::{HarvestError, Result};

/// Ledger partition holding one record per category
pub const CATEGORY_PARTITION: &str = "_categories";

// ============================================================================
// Orchestrator Defaults
// ============================================================================

pub const DEFAULT_MIN_CONCURRENT: usize = 2;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_TICK_SECS: u64 = 15;
pub const DEFAULT_STAGGER_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub min_concurrent: usize,
    pub max_concurrent: usize,
    pub tick: Duration,
    /// Pause between launches within one tick
    pub stagger: Duration,
    pub health: HealthPolicy,
    /// Re-run categories the ledger records as failed
    pub retry_failed: bool,
    /// Stop launching after the first failure
    pub strict: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_concurrent: DEFAULT_MIN_CONCURRENT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            tick: Duration::from_secs(DEFAULT_TICK_SECS),
            stagger: Duration::from_secs(DEFAULT_STAGGER_SECS),
            health: HealthPolicy::default(),
            retry_failed: true,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    WindingDown,
    Done,
}

/// Final report of one orchestration run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Already completed in an earlier run
    pub skipped: Vec<String>,
    /// Stopped by shutdown; resumable
    pub interrupted: Vec<String>,
    /// Never launched because of shutdown or strict mode
    pub not_started: Vec<String>,
    pub launched: usize,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

pub struct Orchestrator {
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn ResourceProbe>,
    ledger: Arc<ProgressLedger>,
    config: OrchestratorConfig,
    state: OrchestratorState,
}

type WorkerResult = Result<WorkerExit>;

impl Orchestrator {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn ResourceProbe>,
        ledger: Arc<ProgressLedger>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            launcher,
            probe,
            ledger,
            config,
            state: OrchestratorState::Idle,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    fn transition(&mut self, next: OrchestratorState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "Orchestrator state changed");
            self.state = next;
        }
    }

    /// How many workers may be launched now with `running` already active
    pub fn launch_budget(&self, running: usize, snapshot: &ResourceSnapshot) -> usize {
        match self.config.health.assess(snapshot) {
            Health::Healthy => self.config.max_concurrent.saturating_sub(running),
            Health::Unhealthy => self.config.min_concurrent.saturating_sub(running),
            Health::Severe => 0,
        }
    }

    /// Categories to launch, smallest first, with skipped/failed ones noted in `summary`
    pub fn plan(&self, categories: &[String], summary: &mut RunSummary) -> Result<VecDeque<String>> {
        let previous = self.ledger.load(CATEGORY_PARTITION)?;
        let mut seen = HashSet::new();
        let mut pending: Vec<(usize, String)> = Vec::new();

        for category in categories {
            if !seen.insert(category.as_str()) {
                continue;
            }
            match previous.get(category).map(|r| r.status) {
                Some(WorkUnitStatus::Completed) => summary.skipped.push(category.clone()),
                Some(WorkUnitStatus::Failed) if !self.config.retry_failed => {
                    summary.failed.push(category.clone())
                },
                _ => {
                    let known_apps = self.ledger.load(category)?.len();
                    pending.push((known_apps, category.clone()));
                },
            }
        }

        pending.sort_by_key(|(known_apps, _)| *known_apps);

        info!(
            to_process = pending.len(),
            already_completed = summary.skipped.len(),
            previously_failed = summary.failed.len(),
            "Categories planned"
        );
        Ok(pending.into_iter().map(|(_, category)| category).collect())
    }

    /// Supervise workers for `categories` until all are done or `shutdown` fires
    pub async fn run(&mut self, categories: &[String], shutdown: CancellationToken) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut pending = self.plan(categories, &mut summary)?;
        let mut running: JoinSet<WorkerResult> = JoinSet::new();
        let mut names: HashMap<Id, String> = HashMap::new();

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.transition(OrchestratorState::Running);
        info!(
            min = self.config.min_concurrent,
            max = self.config.max_concurrent,
            "Starting orchestration"
        );

        loop {
            let launching = self.state == OrchestratorState::Running;
            if running.is_empty() && (pending.is_empty() || !launching) {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled(), if launching => {
                    warn!(running = running.len(), "Shutdown requested, stopping workers");
                    self.transition(OrchestratorState::WindingDown);
                }
                Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                    let (category, result) = match joined {
                        Ok((id, result)) => (names.remove(&id), result),
                        Err(join_err) => (names.remove(&join_err.id()), Err(join_error(join_err))),
                    };
                    let Some(category) = category else {
                        error!("Worker task finished without a known category");
                        continue;
                    };
                    self.handle_exit(&category, result, &shutdown, &mut summary)?;
                }
                _ = ticker.tick(), if launching => {
                    self.schedule_tick(&mut pending, &mut running, &mut names, &shutdown, &mut summary).await?;
                    self.log_status(&running_names(&names), pending.len(), &summary);
                }
            }
        }

        summary.not_started.extend(pending.drain(..));
        self.transition(OrchestratorState::Done);

        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            interrupted = summary.interrupted.len(),
            not_started = summary.not_started.len(),
            "Orchestration finished"
        );
        if !summary.failed.is_empty() {
            warn!(categories = %summary.failed.join(","), "Failed categories");
        }

        Ok(summary)
    }

    async fn schedule_tick(
        &mut self,
        pending: &mut VecDeque<String>,
        running: &mut JoinSet<WorkerResult>,
        names: &mut HashMap<Id, String>,
        shutdown: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let snapshot = self.probe.snapshot();
        let budget = self.launch_budget(running.len(), &snapshot).min(pending.len());
        if budget == 0 {
            if self.config.health.assess(&snapshot) != Health::Healthy {
                info!(
                    running = running.len(),
                    memory_pct = %format!("{:.1}", snapshot.memory_percent),
                    load_per_cpu = %format!("{:.2}", snapshot.load_per_cpu),
                    "Pausing new launches due to resource pressure"
                );
            }
            return Ok(());
        }

        info!(launching = budget, running = running.len(), "Launching workers");
        for i in 0..budget {
            if i > 0 && !self.config.stagger.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.stagger) => {},
                }
            }
            let Some(category) = pending.pop_front() else {
                break;
            };
            self.launch(category, running, names, shutdown)?;
            summary.launched += 1;
        }
        Ok(())
    }

    fn launch(
        &self,
        category: String,
        running: &mut JoinSet<WorkerResult>,
        names: &mut HashMap<Id, String>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        self.ledger.append(&ProgressRecord::new(
            CATEGORY_PARTITION,
            &category,
            WorkUnitStatus::InProgress,
            0,
        ))?;

        let unit = WorkUnit::new(CATEGORY_PARTITION, &category).with_status(WorkUnitStatus::InProgress);
        let launcher = Arc::clone(&self.launcher);
        let token = shutdown.child_token();

        let handle = running.spawn(async move { launcher.run(unit, token).await });
        names.insert(handle.id(), category);
        Ok(())
    }

    fn handle_exit(
        &mut self,
        category: &str,
        result: Result<WorkerExit>,
        shutdown: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let units = self.ledger.load(category).map(|m| m.len() as u64).unwrap_or(0);
        let record = |status| ProgressRecord::new(CATEGORY_PARTITION, category, status, units);

        match result {
            Ok(exit) if exit.success => {
                info!(category, units, "Category completed");
                self.ledger.append(&record(WorkUnitStatus::Completed))?;
                summary.completed.push(category.to_string());
            },
            Ok(exit) if exit.interrupted || shutdown.is_cancelled() => {
                info!(category, code = ?exit.code, "Category interrupted");
                self.ledger
                    .append(&record(WorkUnitStatus::Pending).with_error("interrupted"))?;
                summary.interrupted.push(category.to_string());
            },
            Ok(exit) => {
                let reason = match exit.code {
                    Some(code) => format!("worker exited with code {code}"),
                    None => "worker terminated by signal".to_string(),
                };
                error!(category, reason = %reason, "Category failed");
                self.ledger
                    .append(&record(WorkUnitStatus::Failed).with_error(&reason))?;
                self.note_failure(category, summary);
            },
            Err(e) => {
                error!(category, error = %e, "Worker could not be run");
                self.ledger
                    .append(&record(WorkUnitStatus::Failed).with_error(e.to_string()))?;
                self.note_failure(category, summary);
            },
        }
        Ok(())
    }

    fn note_failure(&mut self, category: &str, summary: &mut RunSummary) {
        summary.failed.push(category.to_string());
        if self.config.strict && self.state == OrchestratorState::Running {
            warn!(category, "Strict mode: no further categories will be launched");
            self.transition(OrchestratorState::WindingDown);
        }
    }

    fn log_status(&self, running: &[String], pending: usize, summary: &RunSummary) {
        let snapshot = self.probe.snapshot();
        info!(
            running = running.len(),
            workers = %running.join(","),
            pending,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            memory_pct = %format!("{:.1}", snapshot.memory_percent),
            load_per_cpu = %format!("{:.2}", snapshot.load_per_cpu),
            "Orchestrator status"
        );
        if running.len() < self.config.min_concurrent && pending > 0 {
            warn!(
                running = running.len(),
                min = self.config.min_concurrent,
                "Running below the concurrency floor"
            );
        }
    }
}

fn running_names(names: &HashMap<Id, String>) -> Vec<String> {
    let mut list: Vec<String> = names.values().cloned().collect();
    list.sort();
    list
}

fn join_error(err: JoinError) -> HarvestError {
    HarvestError::Launch(format!("worker task failed: {err}"))
}
