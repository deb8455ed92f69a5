//! AppHarvest Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable, rate-adaptive harvesting of app store reviews into a
//! Postgres-backed REST store.
//!
//! # Components
//!
//! - **Orchestrator**: schedules one worker process per category inside a
//!   concurrency window that shrinks under memory or load pressure
//! - **Category worker**: lists a category's apps and harvests each one
//! - **Resumable worker**: pages through an app's reviews, checkpointing
//!   progress so an interrupted run picks up where it left off
//! - **Record sink**: chunked inserts that treat duplicates as success
//! - **Progress ledger**: append-only JSON-lines record of unit progress
//!
//! # Example
//!
//! ```no_run
//! use appharvest_ingest::config::HarvestConfig;
//! use appharvest_ingest::framework::ProgressLedger;
//!
//! fn main() -> appharvest_ingest::Result<()> {
//!     let config = HarvestConfig::from_env(true)?;
//!     let ledger = ProgressLedger::open(&config.ledger_dir, config.worker.max_records_per_unit)?;
//!     for (partition, units) in ledger.load_all()? {
//!         println!("{partition}: {} units", units.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod framework;
pub mod store;
pub mod upstream;

pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
