//! Upstream scraping source
//!
//! The harvest core treats the app store scraper as an opaque, rate-limited,
//! paginated source. [`UpstreamSource`] is the capability; [`HttpUpstream`]
//! talks to a scraper sidecar service over JSON.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpUpstream;

/// Typed upstream failures, classified by the throttle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited (429): {0}")]
    RateLimited(String),

    #[error("upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One app as returned by a category listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub app_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Full app metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppDetail {
    pub app_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub installs: Option<String>,
    #[serde(default)]
    pub score: Option<serde_json::Value>,
    #[serde(default)]
    pub ratings: Option<serde_json::Value>,
    #[serde(default)]
    pub reviews: Option<serde_json::Value>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub free: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A raw review as the scraper reports it.
///
/// Scalars stay loosely typed; the worker's normalizer decides how to
/// clamp or default them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub score: Option<serde_json::Value>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub thumbs_up: Option<serde_json::Value>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default)]
    pub reply_date: Option<String>,
}

/// One page of reviews plus the token for the next page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPage {
    #[serde(default)]
    pub items: Vec<ReviewItem>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Capability over the external scraping library
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Apps currently listed in a category
    async fn list(&self, category: &str) -> Result<Vec<AppSummary>, UpstreamError>;

    /// Metadata for one app
    async fn details(&self, app_id: &str) -> Result<AppDetail, UpstreamError>;

    /// One page of reviews, starting at `cursor` (or the first page)
    async fn review_page(
        &self,
        app_id: &str,
        cursor: Option<&str>,
    ) -> Result<ReviewPage, UpstreamError>;
}
