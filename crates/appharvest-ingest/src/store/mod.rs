//! Downstream record store
//!
//! [`RecordStore`] is the capability the sink writes through. Errors carry a
//! [`StoreErrorKind`] so that duplicate-key and constraint failures can be
//! told apart from transient ones. [`RecordStore::insert_new`] is the
//! conflict-ignoring write the sink falls back to when a chunk mixes stored
//! and new rows.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Page size used by [`RecordStore::select_all`]
pub const DEFAULT_SELECT_PAGE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Unique constraint hit; the rows are already stored
    DuplicateKey,
    /// Check / not-null / type constraint rejected the chunk
    ConstraintViolation,
    /// Network failure, timeout, throttling or server-side error
    Transient,
    /// Anything else; retrying will not help
    Fatal,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::DuplicateKey, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::ConstraintViolation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Fatal, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}

/// Table-oriented store capability
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert rows in one request. All-or-nothing: an error means none were written.
    async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), StoreError>;

    /// Insert only the rows whose `conflict_columns` key is not stored yet,
    /// returning how many were written.
    ///
    /// The provided version replays the batch row by row; stores with a
    /// native upsert should override it.
    async fn insert_new(
        &self,
        table: &str,
        rows: &[Value],
        conflict_columns: &str,
    ) -> Result<usize, StoreError> {
        match self.insert_many(table, rows).await {
            Ok(()) => return Ok(rows.len()),
            Err(e) if e.kind != StoreErrorKind::DuplicateKey => return Err(e),
            Err(_) => {},
        }

        let mut written = 0;
        for row in rows {
            match self.insert_many(table, std::slice::from_ref(row)).await {
                Ok(()) => written += 1,
                Err(e) if e.kind == StoreErrorKind::DuplicateKey => {
                    tracing::trace!(table, conflict_columns, "Row already stored");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// One page of rows, projected to `columns` (comma-separated, `*` for all)
    async fn select_page(
        &self,
        table: &str,
        columns: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError>;

    /// Every row of a table, paging until a short page comes back
    async fn select_all(&self, table: &str, columns: &str) -> Result<Vec<Value>, StoreError> {
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .select_page(table, columns, offset, DEFAULT_SELECT_PAGE)
                .await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < DEFAULT_SELECT_PAGE {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }
}
