//! Chunked, duplicate-tolerant record persistence
//!
//! [`RecordSink::flush`] splits its input into chunks of at most `chunk_size`
//! records per table and writes them sequentially, pausing briefly between
//! chunks. Each chunk is handled independently:
//!
//! - duplicate key: the chunk is rewritten with conflicts ignored, so rows
//!   already stored count as skipped and the rest as inserted
//! - constraint violation: records breaking a known domain constraint are
//!   dropped, the remainder is retried once
//! - transient error: retried with exponential backoff, then reported as failed
//!
//! The sink keeps no state between calls.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::{FlushOutcome, RecordKind, ResultRecord};
use crate::store::{RecordStore, StoreError, StoreErrorKind};

// ============================================================================
// Sink Defaults
// ============================================================================

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_SINK_MAX_RETRIES: u32 = 3;
pub const DEFAULT_SINK_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_INTER_CHUNK_DELAY_MS: u64 = 100;
pub const DEFAULT_REVIEWS_TABLE: &str = "reviews";
pub const DEFAULT_METADATA_TABLE: &str = "app_meta";
pub const DEFAULT_RANKS_TABLE: &str = "app_ranks";

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub inter_chunk_delay: Duration,
    pub reviews_table: String,
    pub metadata_table: String,
    pub ranks_table: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_SINK_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_SINK_BASE_DELAY_MS),
            inter_chunk_delay: Duration::from_millis(DEFAULT_INTER_CHUNK_DELAY_MS),
            reviews_table: DEFAULT_REVIEWS_TABLE.to_string(),
            metadata_table: DEFAULT_METADATA_TABLE.to_string(),
            ranks_table: DEFAULT_RANKS_TABLE.to_string(),
        }
    }
}

impl SinkConfig {
    pub fn table_for(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Review => &self.reviews_table,
            RecordKind::AppMeta => &self.metadata_table,
            RecordKind::AppRank => &self.ranks_table,
        }
    }
}

pub struct RecordSink {
    store: Arc<dyn RecordStore>,
    config: SinkConfig,
}

impl RecordSink {
    pub fn new(store: Arc<dyn RecordStore>, config: SinkConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Unit ids with at least one stored record of `kind`
    pub async fn stored_units(&self, kind: RecordKind) -> Result<HashSet<String>, StoreError> {
        let rows = self.store.select_all(self.config.table_for(kind), "app_id").await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("app_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Persist `records`, returning where each one ended up.
    ///
    /// Never errors: every record is accounted for in the outcome, and the
    /// caller decides what a non-zero `failed` means.
    pub async fn flush(&self, records: &[ResultRecord]) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let chunk_size = self.config.chunk_size.max(1);
        let mut first_chunk = true;

        for kind in RecordKind::ALL {
            let group: Vec<&ResultRecord> = records.iter().filter(|r| r.kind() == kind).collect();
            if group.is_empty() {
                continue;
            }

            for chunk in group.chunks(chunk_size) {
                if !first_chunk && !self.config.inter_chunk_delay.is_zero() {
                    tokio::time::sleep(self.config.inter_chunk_delay).await;
                }
                first_chunk = false;
                outcome += self.flush_chunk(kind, chunk).await;
            }
        }

        debug!(
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            dropped = outcome.dropped,
            failed = outcome.failed,
            "Flush complete"
        );
        outcome
    }

    async fn flush_chunk(&self, kind: RecordKind, chunk: &[&ResultRecord]) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let table = self.config.table_for(kind);
        let rows: Vec<Value> = chunk.iter().map(|r| r.to_row()).collect();
        let count = chunk.len() as u64;

        let err = match self.with_retry(table, || self.store.insert_many(table, &rows)).await {
            Ok(()) => {
                outcome.inserted = count;
                return outcome;
            },
            Err(err) => err,
        };

        match err.kind {
            StoreErrorKind::DuplicateKey if count == 1 => {
                debug!(table, key = %chunk[0].natural_key, "Record already stored, skipping");
                outcome.skipped = 1;
            },
            StoreErrorKind::DuplicateKey => {
                let conflict_columns = kind.conflict_columns();
                match self
                    .with_retry(table, || self.store.insert_new(table, &rows, conflict_columns))
                    .await
                {
                    Ok(written) => {
                        let written = (written as u64).min(count);
                        info!(table, inserted = written, skipped = count - written, "Chunk partly stored already");
                        outcome.inserted = written;
                        outcome.skipped = count - written;
                    },
                    Err(e) if e.kind == StoreErrorKind::ConstraintViolation => {
                        warn!(table, records = count, error = %e.message, "Chunk rejected by constraint, filtering");
                        outcome += self.retry_valid_subset(kind, chunk).await;
                    },
                    Err(e) => {
                        error!(table, records = count, kind = ?e.kind, error = %e.message, "Chunk insert failed");
                        outcome.failed = count;
                    },
                }
            },
            StoreErrorKind::ConstraintViolation => {
                warn!(table, records = count, error = %err.message, "Chunk rejected by constraint, filtering");
                outcome += self.retry_valid_subset(kind, chunk).await;
            },
            StoreErrorKind::Transient | StoreErrorKind::Fatal => {
                error!(table, records = count, kind = ?err.kind, error = %err.message, "Chunk insert failed");
                outcome.failed = count;
            },
        }

        outcome
    }

    /// Drop records breaking a domain constraint and retry the rest once,
    /// ignoring rows that are already stored
    async fn retry_valid_subset(&self, kind: RecordKind, chunk: &[&ResultRecord]) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let table = self.config.table_for(kind);
        let mut valid = Vec::with_capacity(chunk.len());

        for record in chunk {
            match record.constraint_violation() {
                Some(reason) => {
                    debug!(unit_id = %record.unit_id, key = %record.natural_key, reason, "Dropping record");
                    outcome.dropped += 1;
                },
                None => valid.push(record.to_row()),
            }
        }

        if valid.is_empty() {
            return outcome;
        }

        let remaining = valid.len() as u64;
        match self.store.insert_new(table, &valid, kind.conflict_columns()).await {
            Ok(written) => {
                let written = (written as u64).min(remaining);
                outcome.inserted += written;
                outcome.skipped += remaining - written;
            },
            Err(e) => {
                warn!(table, records = remaining, error = %e, "Filtered chunk still rejected, dropping");
                outcome.dropped += remaining;
            },
        }

        outcome
    }

    /// Run a store call, retrying transient failures with `base_delay * 2^attempt`
    async fn with_retry<T, F, Fut>(&self, table: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.base_delay.saturating_mul(1u32 << attempt.min(16));
                    warn!(
                        table,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::types::ReviewPayload;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn review(key: &str, rating: Option<u8>) -> ResultRecord {
        ResultRecord::review(
            "com.example",
            key,
            ReviewPayload {
                author_name: "A".to_string(),
                rating,
                content: "text".to_string(),
                helpful_votes: 1,
                app_version: None,
                posted_at: None,
                reply_content: None,
                replied_at: None,
                language: "en".to_string(),
                country: "us".to_string(),
            },
        )
    }

    fn sink(store: Arc<dyn RecordStore>, chunk_size: usize) -> RecordSink {
        RecordSink::new(
            store,
            SinkConfig {
                chunk_size,
                ..SinkConfig::default()
            },
        )
    }

    /// Fails the first `transient` inserts, then delegates
    struct Flaky {
        inner: MemoryStore,
        transient: Mutex<u32>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl RecordStore for Flaky {
        async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
            *self.calls.lock() += 1;
            {
                let mut left = self.transient.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::transient("connection reset"));
                }
            }
            self.inner.insert_many(table, rows).await
        }

        async fn select_page(
            &self,
            table: &str,
            columns: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Value>, StoreError> {
            self.inner.select_page(table, columns, offset, limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone(), 2);
        let batch: Vec<_> = (0..5).map(|i| review(&format!("r{i}"), Some(4))).collect();

        let first = sink.flush(&batch).await;
        assert_eq!(first.inserted, 5);

        let second = sink.flush(&batch).await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 5);
        assert_eq!(store.count("reviews"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_chunk_keeps_new_records() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone(), 10);
        sink.flush(&[review("old", Some(4))]).await;

        let outcome = sink
            .flush(&[review("old", Some(4)), review("new1", Some(5)), review("new2", Some(2))])
            .await;
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.total(), 3);
        assert_eq!(store.count("reviews"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_chunk_with_bad_record_filters_then_keeps_new() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone(), 10);
        sink.flush(&[review("old", Some(4))]).await;

        let outcome = sink
            .flush(&[review("old", Some(4)), review("bad", Some(9)), review("new", Some(1))])
            .await;
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(store.count("reviews"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_constraint_violation_filters_and_retries() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone(), 10);
        let batch = vec![review("a", Some(5)), review("b", Some(9)), review("c", None)];

        let outcome = sink.flush(&batch).await;
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.total(), 3);
        assert_eq!(store.count("reviews"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_then_succeeds() {
        let flaky = Arc::new(Flaky {
            inner: MemoryStore::new(),
            transient: Mutex::new(2),
            calls: Mutex::new(0),
        });
        let sink = sink(flaky.clone(), 10);

        let outcome = sink.flush(&[review("a", Some(3))]).await;
        assert_eq!(outcome.inserted, 1);
        assert_eq!(*flaky.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_reports_failed() {
        let flaky = Arc::new(Flaky {
            inner: MemoryStore::new(),
            transient: Mutex::new(100),
            calls: Mutex::new(0),
        });
        let sink = sink(flaky.clone(), 2);

        let start = tokio::time::Instant::now();
        let outcome = sink.flush(&[review("a", Some(3)), review("b", Some(3))]).await;
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.inserted, 0);
        // initial attempt + 3 retries
        assert_eq!(*flaky.calls.lock(), 4);
        // 1s + 2s + 4s of backoff
        assert!(start.elapsed() >= Duration::from_secs(7));
    }
}
