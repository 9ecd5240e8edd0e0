//! Hosted backend access: table rows and object storage.
//!
//! [`RowStore`] and [`ObjectStorage`] are the only operations the billing and
//! chat code needs. [`SupabaseClient`] speaks the PostgREST / Storage REST
//! dialect; [`MemoryStore`] keeps everything in process for tests and demos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("backend is not configured (set url and anon_key)")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn any_of(column: &str, values: Vec<Value>) -> Self {
        Filter::In(column.to_string(), values)
    }

    fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(column, value) => row.get(column) == Some(value),
            Filter::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
        }
    }

    /// PostgREST query pair, e.g. `("status", "eq.open")`.
    fn to_param(&self) -> (String, String) {
        match self {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", plain(value))),
            Filter::In(column, values) => {
                let list: Vec<String> = values.iter().map(plain).collect();
                (column.clone(), format!("in.({})", list.join(",")))
            }
        }
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), true));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), false));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Inserts one or more rows and returns them as stored (ids and timestamps filled in).
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError>;
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, BackendError>;
    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>, BackendError>;
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `key`. With `upsert` an existing object is overwritten.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<(), BackendError>;

    fn public_url(&self, bucket: &str, key: &str) -> String;
}

#[async_trait]
impl<T: RowStore + ?Sized> RowStore for Arc<T> {
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        (**self).insert(table, rows).await
    }
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, BackendError> {
        (**self).select(table, query).await
    }
    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>, BackendError> {
        (**self).update(table, filters, patch).await
    }
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), BackendError> {
        (**self).delete(table, filters).await
    }
}

#[async_trait]
impl<T: ObjectStorage + ?Sized> ObjectStorage for Arc<T> {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<(), BackendError> {
        (**self).upload(bucket, key, bytes, content_type, upsert).await
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        (**self).public_url(bucket, key)
    }
}

// ==========================================
// Supabase REST client
// ==========================================

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, anon_key: &str, timeout: Duration) -> Result<Self, BackendError> {
        if base_url.trim().is_empty() || anon_key.trim().is_empty() {
            return Err(BackendError::NotConfigured);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.anon_key))
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, BackendError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status { status: status.as_u16(), message: error_message(&text) });
        }
        if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Array(vec![]));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// Supabase wraps errors as `{"message": ...}` (REST) or `{"error": ...}` (storage).
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => vec![],
        other => vec![other],
    }
}

#[async_trait]
impl RowStore for SupabaseClient {
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        debug!(table, count = rows.len(), "insert rows");
        let req = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Prefer", "return=representation")
            .json(&rows);
        let value = Self::handle_response(req.send().await?).await?;
        Ok(into_rows(value))
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, BackendError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(query.filters.iter().map(Filter::to_param));
        if let Some((column, desc)) = &query.order {
            let dir = if *desc { "desc" } else { "asc" };
            params.push(("order".to_string(), format!("{column}.{dir}")));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        let req = self.authed(self.client.get(self.rest_url(table))).query(&params);
        let value = Self::handle_response(req.send().await?).await?;
        Ok(into_rows(value))
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>, BackendError> {
        let params: Vec<(String, String)> = filters.iter().map(Filter::to_param).collect();
        let req = self
            .authed(self.client.patch(self.rest_url(table)))
            .header("Prefer", "return=representation")
            .query(&params)
            .json(&patch);
        let value = Self::handle_response(req.send().await?).await?;
        Ok(into_rows(value))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), BackendError> {
        let params: Vec<(String, String)> = filters.iter().map(Filter::to_param).collect();
        let req = self.authed(self.client.delete(self.rest_url(table))).query(&params);
        Self::handle_response(req.send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for SupabaseClient {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<(), BackendError> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, urlencoding::encode(key));
        debug!(bucket, key, size = bytes.len(), "upload object");
        let req = self
            .authed(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CACHE_CONTROL, "max-age=3600")
            .header("x-upsert", if upsert { "true" } else { "false" })
            .body(bytes);
        Self::handle_response(req.send().await?).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, urlencoding::encode(key))
    }
}

// ==========================================
// In-memory store
// ==========================================

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    objects: HashMap<(String, String), Vec<u8>>,
    failing_inserts: HashMap<String, String>,
    failing_deletes: HashMap<String, String>,
    failing_uploads: Option<String>,
}

/// Process-local stand-in for the hosted backend. Fills in `id`,
/// `created_at` and `updated_at` the way the database defaults do.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    base_url: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { state: Arc::default(), base_url: "memory://storage".to_string() }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every insert into `table` fail with `message`.
    pub fn fail_inserts(&self, table: &str, message: &str) {
        self.lock().failing_inserts.insert(table.to_string(), message.to_string());
    }

    pub fn fail_deletes(&self, table: &str, message: &str) {
        self.lock().failing_deletes.insert(table.to_string(), message.to_string());
    }

    pub fn fail_uploads(&self, message: Option<&str>) {
        self.lock().failing_uploads = message.map(str::to_string);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(&(bucket.to_string(), key.to_string())).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(message: &str) -> BackendError {
    BackendError::Status { status: 500, message: message.to_string() }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        let mut state = self.lock();
        if let Some(message) = state.failing_inserts.get(table) {
            return Err(injected(message));
        }
        let now = Value::String(Utc::now().to_rfc3339());
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = match row {
                Value::Object(map) => map,
                other => {
                    return Err(BackendError::Status {
                        status: 400,
                        message: format!("row must be an object, got {other}"),
                    });
                }
            };
            object.entry("id").or_insert_with(|| json!(Uuid::new_v4()));
            object.entry("created_at").or_insert_with(|| now.clone());
            object.entry("updated_at").or_insert_with(|| now.clone());
            stored.push(Value::Object(object));
        }
        state.tables.entry(table.to_string()).or_default().extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, BackendError> {
        let state = self.lock();
        let mut rows: Vec<Value> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some((column, desc)) = &query.order {
            // Stable sort keeps insertion order for equal timestamps.
            rows.sort_by(|a, b| {
                let ord = plain(&a[column.as_str()]).cmp(&plain(&b[column.as_str()]));
                if *desc { ord.reverse() } else { ord }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>, BackendError> {
        let mut state = self.lock();
        let patch: Map<String, Value> = match patch {
            Value::Object(map) => map,
            _ => return Ok(vec![]),
        };
        let now = Value::String(Utc::now().to_rfc3339());
        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| filters.iter().all(|f| f.matches(row))) {
                if let Value::Object(object) = row {
                    for (key, value) in &patch {
                        object.insert(key.clone(), value.clone());
                    }
                    object.insert("updated_at".to_string(), now.clone());
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), BackendError> {
        let mut state = self.lock();
        if let Some(message) = state.failing_deletes.get(table) {
            return Err(injected(message));
        }
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| !filters.iter().all(|f| f.matches(row)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStore {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        upsert: bool,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        if let Some(message) = &state.failing_uploads {
            return Err(injected(message));
        }
        let slot = (bucket.to_string(), key.to_string());
        if !upsert && state.objects.contains_key(&slot) {
            return Err(BackendError::Status { status: 409, message: "The resource already exists".into() });
        }
        state.objects.insert(slot, bytes);
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, key)
    }
}
