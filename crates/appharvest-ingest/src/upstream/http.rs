//! HTTP client for the scraper sidecar
//!
//! The sidecar wraps the third-party store-scraping library and exposes it as
//! plain JSON:
//!
//! - `GET /categories/{category}/apps`
//! - `GET /apps/{app_id}`
//! - `GET /apps/{app_id}/reviews?cursor=..&num=..`
//!
//! Every request carries `lang` and `country`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{AppDetail, AppSummary, ReviewPage, UpstreamError, UpstreamSource};

// ============================================================================
// Upstream Client Constants
// ============================================================================

/// Default timeout for scraper requests in seconds
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Reviews requested per page
pub const DEFAULT_REVIEW_PAGE_SIZE: usize = 150;

pub struct HttpUpstream {
    client: Client,
    base_url: String,
    language: String,
    country: String,
    page_size: usize,
}

impl HttpUpstream {
    pub fn new(
        base_url: impl Into<String>,
        language: impl Into<String>,
        country: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            language: language.into(),
            country: country.into(),
            page_size: DEFAULT_REVIEW_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let mut query: Vec<(&str, String)> = vec![
            ("lang", self.language.clone()),
            ("country", self.country.clone()),
        ];
        query.extend(extra.iter().cloned());

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Malformed(format!("{url}: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(err.to_string())
    } else if err.is_decode() {
        UpstreamError::Malformed(err.to_string())
    } else {
        UpstreamError::Network(err.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> UpstreamError {
    let body = body.trim().chars().take(200).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => UpstreamError::Timeout(body),
        s if s.is_server_error() => UpstreamError::Server {
            status: s.as_u16(),
            message: body,
        },
        s => UpstreamError::Malformed(format!("unexpected status {}: {}", s.as_u16(), body)),
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn list(&self, category: &str) -> Result<Vec<AppSummary>, UpstreamError> {
        self.get_json(&format!("/categories/{category}/apps"), &[]).await
    }

    async fn details(&self, app_id: &str) -> Result<AppDetail, UpstreamError> {
        self.get_json(&format!("/apps/{app_id}"), &[]).await
    }

    async fn review_page(
        &self,
        app_id: &str,
        cursor: Option<&str>,
    ) -> Result<ReviewPage, UpstreamError> {
        let mut extra = vec![("num", self.page_size.to_string())];
        if let Some(cursor) = cursor {
            extra.push(("cursor", cursor.to_string()));
        }
        self.get_json(&format!("/apps/{app_id}/reviews"), &extra).await
    }
}
