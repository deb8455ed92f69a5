//! Core types for the harvest framework

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Work unit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkUnitStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkUnitStatus::Pending => "pending",
            WorkUnitStatus::InProgress => "in_progress",
            WorkUnitStatus::Completed => "completed",
            WorkUnitStatus::Failed => "failed",
        }
    }
}

impl From<String> for WorkUnitStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "in_progress" => WorkUnitStatus::InProgress,
            "completed" => WorkUnitStatus::Completed,
            "failed" => WorkUnitStatus::Failed,
            _ => WorkUnitStatus::Pending,
        }
    }
}

impl std::fmt::Display for WorkUnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scrape target: an app id within a category, or a whole category
/// when the orchestrator is the one tracking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unique within its partition
    pub unit_id: String,
    /// Category / shard label
    pub partition: String,
    pub status: WorkUnitStatus,
}

impl WorkUnit {
    pub fn new(partition: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            partition: partition.into(),
            status: WorkUnitStatus::Pending,
        }
    }

    pub fn with_status(mut self, status: WorkUnitStatus) -> Self {
        self.status = status;
        self
    }
}

/// Which store table a record belongs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Review,
    AppMeta,
    AppRank,
}

impl RecordKind {
    /// Flush order within one sink call
    pub const ALL: [RecordKind; 3] = [RecordKind::Review, RecordKind::AppMeta, RecordKind::AppRank];

    /// Columns of the table's unique constraint, comma-separated
    pub fn conflict_columns(&self) -> &'static str {
        match self {
            RecordKind::Review => "app_id,review_id",
            RecordKind::AppMeta => "app_id",
            RecordKind::AppRank => "app_id,category,collection,rank_date",
        }
    }
}

/// One review, already normalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub author_name: String,
    /// Always within 1..=5 when present
    pub rating: Option<u8>,
    pub content: String,
    pub helpful_votes: u32,
    pub app_version: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub reply_content: Option<String>,
    pub replied_at: Option<DateTime<Utc>>,
    pub language: String,
    pub country: String,
}

/// App metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetaPayload {
    pub category: String,
    pub title: String,
    pub developer: Option<String>,
    pub genre: Option<String>,
    pub installs: Option<String>,
    /// Average score, within 0.0..=5.0 when present
    pub score: Option<f64>,
    pub ratings: Option<u64>,
    pub reviews: Option<u64>,
    pub price: Option<f64>,
    pub free: bool,
    pub version: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Position of an app in a category chart on a given day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRankPayload {
    pub category: String,
    /// 1-based
    pub position: u32,
    pub collection: String,
    pub title: Option<String>,
    pub rank_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Review(ReviewPayload),
    AppMeta(AppMetaPayload),
    AppRank(AppRankPayload),
}

/// Maximum stored length of free-text review fields, in characters
pub const MAX_TEXT_CHARS: usize = 4000;

/// One persisted output item produced for a work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Owning unit (the app id)
    pub unit_id: String,
    /// Source-assigned id used for duplicate detection
    pub natural_key: String,
    pub payload: RecordPayload,
}

impl ResultRecord {
    pub fn review(
        unit_id: impl Into<String>,
        natural_key: impl Into<String>,
        review: ReviewPayload,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            natural_key: natural_key.into(),
            payload: RecordPayload::Review(review),
        }
    }

    pub fn app_meta(unit_id: impl Into<String>, meta: AppMetaPayload) -> Self {
        let unit_id = unit_id.into();
        Self {
            natural_key: unit_id.clone(),
            unit_id,
            payload: RecordPayload::AppMeta(meta),
        }
    }

    pub fn app_rank(unit_id: impl Into<String>, rank: AppRankPayload) -> Self {
        let unit_id = unit_id.into();
        Self {
            natural_key: format!("{}/{}/{}/{}", unit_id, rank.category, rank.collection, rank.rank_date),
            unit_id,
            payload: RecordPayload::AppRank(rank),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self.payload {
            RecordPayload::Review(_) => RecordKind::Review,
            RecordPayload::AppMeta(_) => RecordKind::AppMeta,
            RecordPayload::AppRank(_) => RecordKind::AppRank,
        }
    }

    /// The domain constraint this record breaks, if any.
    ///
    /// Used by the sink to filter a chunk the store rejected as a whole.
    pub fn constraint_violation(&self) -> Option<&'static str> {
        if self.natural_key.trim().is_empty() || self.unit_id.trim().is_empty() {
            return Some("empty key");
        }
        match &self.payload {
            RecordPayload::Review(review) => {
                if let Some(rating) = review.rating {
                    if !(1..=5).contains(&rating) {
                        return Some("rating outside 1..=5");
                    }
                }
                if review.content.chars().count() > MAX_TEXT_CHARS {
                    return Some("review text too long");
                }
                None
            },
            RecordPayload::AppMeta(meta) => match meta.score {
                Some(score) if !(0.0..=5.0).contains(&score) => Some("score outside 0..=5"),
                _ => None,
            },
            RecordPayload::AppRank(rank) if rank.position == 0 => Some("rank position is 1-based"),
            RecordPayload::AppRank(_) => None,
        }
    }

    /// Row shape the store receives
    pub fn to_row(&self) -> serde_json::Value {
        match &self.payload {
            RecordPayload::Review(r) => serde_json::json!({
                "app_id": self.unit_id,
                "review_id": self.natural_key,
                "post_date": r.posted_at,
                "language": r.language,
                "country": r.country,
                "author_name": r.author_name,
                "rating": r.rating,
                "review_content": r.content,
                "helpful_voting": r.helpful_votes,
                "app_version": r.app_version,
                "reply_content": r.reply_content,
                "reply_date": r.replied_at,
            }),
            RecordPayload::AppMeta(m) => serde_json::json!({
                "app_id": self.unit_id,
                "category": m.category,
                "title": m.title,
                "developer": m.developer,
                "genre": m.genre,
                "installs": m.installs,
                "score": m.score,
                "ratings": m.ratings,
                "reviews": m.reviews,
                "price": m.price,
                "free": m.free,
                "version": m.version,
                "captured_at": m.captured_at,
            }),
            RecordPayload::AppRank(r) => serde_json::json!({
                "app_id": self.unit_id,
                "category": r.category,
                "position": r.position,
                "collection": r.collection,
                "title": r.title,
                "rank_date": r.rank_date,
            }),
        }
    }
}

/// Ordered, bounded buffer of records awaiting a flush.
///
/// The worker owns it exclusively; `take` hands the contents to the sink
/// and leaves an empty batch behind.
#[derive(Debug)]
pub struct Batch {
    records: Vec<ResultRecord>,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record; hands it back when the batch is already full.
    pub fn push(&mut self, record: ResultRecord) -> std::result::Result<(), ResultRecord> {
        if self.is_full() {
            return Err(record);
        }
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn take(&mut self) -> Vec<ResultRecord> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }
}

/// Accounting for one or more sink flushes.
///
/// Every record handed to the sink lands in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub inserted: u64,
    /// Already present in the store
    pub skipped: u64,
    /// Filtered out for violating a domain constraint, or rejected on retry
    pub dropped: u64,
    /// Transient retries exhausted or fatal store error
    pub failed: u64,
}

impl FlushOutcome {
    /// Records now known to be in the store
    pub fn accepted(&self) -> u64 {
        self.inserted + self.skipped
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.skipped + self.dropped + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl AddAssign for FlushOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.skipped += rhs.skipped;
        self.dropped += rhs.dropped;
        self.failed += rhs.failed;
    }
}

/// Durable progress tuple, one JSON line in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub partition: String,
    pub unit_id: String,
    /// Pagination token to resume from; `None` means start from the first page
    #[serde(default)]
    pub cursor_token: Option<String>,
    pub records_so_far: u64,
    pub status: WorkUnitStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(
        partition: impl Into<String>,
        unit_id: impl Into<String>,
        status: WorkUnitStatus,
        records_so_far: u64,
    ) -> Self {
        Self {
            partition: partition.into(),
            unit_id: unit_id.into(),
            cursor_token: None,
            records_so_far,
            status,
            last_error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor_token = cursor;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}
