//! AppHarvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared ambient concerns for the AppHarvest workspace members.
//!
//! - **Error Handling**: [`CommonError`] for configuration parsing failures
//! - **Environment**: typed lookups of `HARVEST_*` style variables
//! - **Logging**: tracing subscriber setup shared by the orchestrator and workers
//!
//! # Example
//!
//! ```no_run
//! use appharvest_common::env::env_parse;
//!
//! fn chunk_size() -> appharvest_common::Result<usize> {
//!     env_parse("HARVEST_CHUNK_SIZE", 100)
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
