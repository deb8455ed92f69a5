//! In-process record store
//!
//! Enforces the same uniqueness and rating checks as the hosted schema:
//! `reviews` is unique on `(app_id, review_id)`, `app_ranks` on
//! `(app_id, category, collection, rank_date)`, every other table on
//! `app_id`. `insert_many` rejects a batch containing any duplicate (stored
//! or within itself) whole, like a single multi-row INSERT would be;
//! `insert_new` behaves like `ON CONFLICT DO NOTHING`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::{RecordStore, StoreError};

#[derive(Default)]
struct Table {
    rows: Vec<Value>,
    keys: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored in `table`
    pub fn count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.rows.len())
    }

    /// Snapshot of the rows stored in `table`
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

fn unique_key(row: &Value) -> Option<String> {
    let app_id = row.get("app_id")?.as_str()?;
    if let Some(review_id) = row.get("review_id") {
        return Some(format!("{}/{}", app_id, review_id.as_str()?));
    }
    if let Some(collection) = row.get("collection") {
        return Some(format!(
            "{}/{}/{}/{}",
            app_id,
            row.get("category")?.as_str()?,
            collection.as_str()?,
            row.get("rank_date")?.as_str()?
        ));
    }
    Some(app_id.to_string())
}

fn check_row(row: &Value) -> Result<String, StoreError> {
    if let Some(rating) = row.get("rating").and_then(Value::as_i64) {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::constraint(format!(
                "new row violates check constraint \"rating_range\" (rating = {rating})"
            )));
        }
    }
    unique_key(row)
        .filter(|k| !k.is_empty() && !k.ends_with('/'))
        .ok_or_else(|| StoreError::constraint("null value in key column violates not-null constraint"))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let target = tables.entry(table.to_string()).or_default();

        let mut batch_keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let key = check_row(row)?;
            if target.keys.contains(&key) || !batch_keys.insert(key.clone()) {
                return Err(StoreError::duplicate(format!(
                    "duplicate key value violates unique constraint ({key})"
                )));
            }
        }

        target.keys.extend(batch_keys);
        target.rows.extend(rows.iter().cloned());
        Ok(())
    }

    async fn insert_new(
        &self,
        table: &str,
        rows: &[Value],
        _conflict_columns: &str,
    ) -> Result<usize, StoreError> {
        let keys = rows.iter().map(check_row).collect::<Result<Vec<_>, _>>()?;

        let mut tables = self.tables.lock();
        let target = tables.entry(table.to_string()).or_default();
        let mut written = 0;
        for (key, row) in keys.into_iter().zip(rows) {
            if target.keys.insert(key) {
                target.rows.push(row.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn select_page(
        &self,
        table: &str,
        columns: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.lock();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let wanted: Vec<&str> = columns.split(',').map(str::trim).collect();
        let project = |row: &Value| -> Value {
            if wanted.iter().any(|c| *c == "*") {
                return row.clone();
            }
            let mut out = serde_json::Map::new();
            for column in &wanted {
                if let Some(v) = row.get(*column) {
                    out.insert((*column).to_string(), v.clone());
                }
            }
            Value::Object(out)
        };

        Ok(t.rows.iter().skip(offset).take(limit).map(project).collect())
    }
}
