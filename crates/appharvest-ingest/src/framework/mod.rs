//! Harvest framework
//!
//! The pipeline core, bottom-up:
//!
//! - [`types`]: work units, result records, batches, ledger records
//! - [`validation`]: normalization of raw upstream items into records
//! - [`throttle`]: adaptive inter-request delay and abort decision
//! - [`sink`]: chunked, idempotent writes to the record store
//! - [`ledger`]: append-only per-partition progress records
//! - [`worker`]: one resumable unit (an app's review stream)
//! - [`category`]: one worker process (all apps of a category)
//! - [`launcher`] / [`resources`]: process spawning and host probes
//! - [`coordinator`]: the orchestrator scheduling category workers

pub mod category;
pub mod coordinator;
pub mod launcher;
pub mod ledger;
pub mod resources;
pub mod sink;
pub mod throttle;
pub mod types;
pub mod validation;
pub mod worker;

pub use category::{CategorySummary, CategoryWorker};
pub use coordinator::{Orchestrator, OrchestratorConfig, OrchestratorState, RunSummary, CATEGORY_PARTITION};
pub use launcher::{ProcessLauncher, WorkerExit, WorkerLauncher};
pub use ledger::ProgressLedger;
pub use resources::{Health, HealthPolicy, MemoryProbe, ResourceProbe, ResourceSnapshot, SystemProbe};
pub use sink::{RecordSink, SinkConfig};
pub use throttle::{AdaptiveThrottle, ErrorClass, ThrottleConfig, ThrottleStats};
pub use types::{
    AppRankPayload, Batch, FlushOutcome, ProgressRecord, RecordKind, ResultRecord, WorkUnit,
    WorkUnitStatus,
};
pub use validation::Normalizer;
pub use worker::{ResumableWorker, UnitOutcome, WorkerConfig};
