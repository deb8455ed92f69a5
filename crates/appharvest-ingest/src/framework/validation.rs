//! Item-level validation and normalization
//!
//! Malformed scalars are clamped or defaulted so that a review with one bad
//! field is still stored. Only items without a natural key are rejected.
//!
//! | Field        | Rule                                                        |
//! |--------------|-------------------------------------------------------------|
//! | `id`         | required, trimmed; missing or blank drops the item          |
//! | `score`      | number or numeric string, rounded and clamped to 1..=5; otherwise `None` |
//! | `thumbsUp`   | negative clamps to 0; missing or malformed becomes 0        |
//! | `text`       | missing becomes `""`; truncated to [`MAX_TEXT_CHARS`]      |
//! | `userName`   | missing or blank becomes `"Anonymous"`                      |
//! | `date`       | RFC 3339; malformed becomes `None`                          |
//! | `version`    | blank becomes `None`                                        |
//! | `replyText`  | blank becomes `None`; truncated like `text`                 |

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{AppMetaPayload, ResultRecord, ReviewPayload, MAX_TEXT_CHARS};
use crate::upstream::{AppDetail, ReviewItem};

const ANONYMOUS: &str = "Anonymous";

/// Why an item was rejected outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingKey,
}

/// Per-unit counters of what normalization had to repair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub accepted: u64,
    pub missing_key: u64,
    pub clamped: u64,
    pub defaulted: u64,
}

/// Turns raw upstream items into [`ResultRecord`]s
#[derive(Debug, Clone)]
pub struct Normalizer {
    language: String,
    country: String,
    stats: ValidationStats,
}

impl Normalizer {
    pub fn new(language: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            country: country.into(),
            stats: ValidationStats::default(),
        }
    }

    pub fn stats(&self) -> ValidationStats {
        self.stats
    }

    pub fn review(&mut self, unit_id: &str, item: &ReviewItem) -> Result<ResultRecord, Rejection> {
        let Some(key) = item
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            self.stats.missing_key += 1;
            return Err(Rejection::MissingKey);
        };

        let rating = match item.score.as_ref().and_then(as_f64) {
            Some(raw) => {
                let clamped = clamp_rating(raw);
                if f64::from(clamped) != raw {
                    self.stats.clamped += 1;
                }
                Some(clamped)
            },
            None => {
                self.stats.defaulted += 1;
                None
            },
        };

        let helpful_votes = match item.thumbs_up.as_ref().and_then(as_f64) {
            Some(v) if v < 0.0 => {
                self.stats.clamped += 1;
                0
            },
            Some(v) => v.min(f64::from(u32::MAX)) as u32,
            None => 0,
        };

        let content = match item.text.as_deref() {
            Some(text) => truncate(text.trim(), MAX_TEXT_CHARS),
            None => {
                self.stats.defaulted += 1;
                String::new()
            },
        };

        let author_name = non_blank(item.user_name.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| ANONYMOUS.to_string());

        let review = ReviewPayload {
            author_name,
            rating,
            content,
            helpful_votes,
            app_version: non_blank(item.version.as_deref()).map(str::to_string),
            posted_at: item.date.as_deref().and_then(parse_date),
            reply_content: non_blank(item.reply_text.as_deref())
                .map(|t| truncate(t, MAX_TEXT_CHARS)),
            replied_at: item.reply_date.as_deref().and_then(parse_date),
            language: self.language.clone(),
            country: self.country.clone(),
        };

        self.stats.accepted += 1;
        Ok(ResultRecord::review(unit_id, key, review))
    }

    /// Metadata record for one app; the app id is the natural key.
    pub fn app_meta(&mut self, category: &str, detail: &AppDetail) -> Result<ResultRecord, Rejection> {
        let app_id = detail.app_id.trim();
        if app_id.is_empty() {
            self.stats.missing_key += 1;
            return Err(Rejection::MissingKey);
        }

        let score = detail
            .score
            .as_ref()
            .and_then(as_f64)
            .map(|s| s.clamp(0.0, 5.0));
        let price = detail.price.as_ref().and_then(as_f64).filter(|p| *p >= 0.0);

        let meta = AppMetaPayload {
            category: category.to_string(),
            title: non_blank(detail.title.as_deref())
                .unwrap_or(app_id)
                .to_string(),
            developer: non_blank(detail.developer.as_deref()).map(str::to_string),
            genre: non_blank(detail.genre.as_deref()).map(str::to_string),
            installs: non_blank(detail.installs.as_deref()).map(str::to_string),
            score,
            ratings: detail.ratings.as_ref().and_then(as_count),
            reviews: detail.reviews.as_ref().and_then(as_count),
            free: detail.free.unwrap_or_else(|| price.map_or(true, |p| p == 0.0)),
            price,
            version: non_blank(detail.version.as_deref()).map(str::to_string),
            captured_at: Utc::now(),
        };

        self.stats.accepted += 1;
        Ok(ResultRecord::app_meta(app_id, meta))
    }
}

/// Round to the nearest star and clamp into 1..=5
pub fn clamp_rating(raw: f64) -> u8 {
    raw.round().clamp(1.0, 5.0) as u8
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn as_count(value: &Value) -> Option<u64> {
    as_f64(value).filter(|v| *v >= 0.0).map(|v| v as u64)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
