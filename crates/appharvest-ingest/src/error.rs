//! Error taxonomy for the harvest pipeline
//!
//! Per-request failures are typed at the edges ([`UpstreamError`], [`StoreError`])
//! and handled locally by the throttle, worker and sink. Only exhausted retries
//! surface as [`HarvestError::UnitFailed`] / [`HarvestError::UnitAborted`].

use thiserror::Error;

use crate::store::StoreError;
use crate::upstream::UpstreamError;

/// Result type alias for harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The throttle's consecutive-error ceiling was exceeded
    #[error("Unit {unit_id} aborted after {consecutive_errors} consecutive errors ({records_so_far} records so far)")]
    UnitAborted {
        unit_id: String,
        consecutive_errors: u32,
        records_so_far: u64,
    },

    /// Local retries were exhausted
    #[error("Unit {unit_id} failed after {records_so_far} records: {reason}")]
    UnitFailed {
        unit_id: String,
        reason: String,
        records_so_far: u64,
    },

    /// Missing or invalid configuration; never retried
    #[error("Configuration error: {0}")]
    FatalConfig(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Worker launch error: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarvestError {
    /// Whether the failure is scoped to a single unit, leaving the rest of the run healthy
    pub fn is_unit_scoped(&self) -> bool {
        matches!(
            self,
            HarvestError::UnitAborted { .. } | HarvestError::UnitFailed { .. }
        )
    }

    /// Process exit code for this error when it ends a command
    pub fn exit_code(&self) -> i32 {
        match self {
            HarvestError::FatalConfig(_) => 2,
            _ => 1,
        }
    }
}

impl From<appharvest_common::CommonError> for HarvestError {
    fn from(err: appharvest_common::CommonError) -> Self {
        HarvestError::FatalConfig(err.to_string())
    }
}
