//! PostgREST-compatible store client
//!
//! Talks to the hosted Postgres REST endpoint (`/rest/v1/{table}`) with the
//! project's service key. Error bodies carry the Postgres SQLSTATE in `code`,
//! which is what duplicate/constraint classification keys on.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{RecordStore, StoreError, StoreErrorKind};

// ============================================================================
// REST Store Constants
// ============================================================================

/// Default timeout for store requests in seconds
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 60;

/// unique_violation
const SQLSTATE_UNIQUE: &str = "23505";

/// check_violation, not_null_violation, invalid_text_representation,
/// numeric_value_out_of_range, foreign_key_violation
const SQLSTATE_CONSTRAINT: &[&str] = &["23514", "23502", "22P02", "22003", "23503"];

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Store client for the hosted Postgres REST API
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::fatal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn error_from_response(response: reqwest::Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify(status, &body)
    }
}

/// Map a failed REST response onto a [`StoreErrorKind`]
pub fn classify(status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<PostgrestError> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|e| {
            let msg = e.message.clone()?;
            Some(match &e.details {
                Some(details) => format!("{msg} ({details})"),
                None => msg,
            })
        })
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body.trim()));

    let code = parsed.and_then(|e| e.code).unwrap_or_default();

    let kind = if code == SQLSTATE_UNIQUE {
        StoreErrorKind::DuplicateKey
    } else if SQLSTATE_CONSTRAINT.contains(&code.as_str()) {
        StoreErrorKind::ConstraintViolation
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        StoreErrorKind::Transient
    } else {
        StoreErrorKind::Fatal
    };

    StoreError::new(kind, message)
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_builder() {
        StoreError::fatal(err.to_string())
    } else {
        StoreError::transient(err.to_string())
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            return Ok(());
        }

        let err = Self::error_from_response(response).await;
        tracing::debug!(table, kind = ?err.kind, error = %err.message, "Insert rejected");
        Err(err)
    }

    async fn insert_new(
        &self,
        table: &str,
        rows: &[Value],
        conflict_columns: &str,
    ) -> Result<usize, StoreError> {
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", conflict_columns), ("select", conflict_columns)])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(rows)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let err = Self::error_from_response(response).await;
            tracing::debug!(table, kind = ?err.kind, error = %err.message, "Conflict-ignoring insert rejected");
            return Err(err);
        }

        // only rows actually written come back
        let written = response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::transient(format!("Failed to decode inserted rows: {e}")))?;
        Ok(written.len())
    }

    async fn select_page(
        &self,
        table: &str,
        columns: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let offset = offset.to_string();
        let limit = limit.to_string();
        let response = self
            .authorized(self.client.get(self.table_url(table)))
            .query(&[("select", columns), ("offset", offset.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::transient(format!("Failed to decode rows: {e}")))
    }
}
