//! Schema-safe document indexing: sanitization, idempotent upsert,
//! bounded queries and bulk log-line writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cimet_core::{JobId, LogLine, ShapeField};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cimet-index";

/// Hard cap on query result pages; queries are best-effort for reporting.
pub const PAGE_SIZE: usize = 1000;
/// Log lines per bulk write.
pub const LOG_BATCH_SIZE: usize = 1000;

/// Field names the metadata service emits with inconsistent JSON types.
/// Always stored in the normalized object shape so the index mapping
/// never sees a type conflict for these paths.
pub const SHAPE_VARIABLE_FIELDS: &[&str] = &["targets", "overrides", "tasks", "sentry_event"];

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index backend unreachable: {0}")]
    Connectivity(String),
    #[error("document {collection}/{id} rejected: {reason}")]
    Rejected {
        collection: &'static str,
        id: String,
        reason: String,
    },
    #[error("setting up collection {collection}: {reason}")]
    Setup {
        collection: &'static str,
        reason: String,
    },
    #[error("searching {collection}: {reason}")]
    Search {
        collection: &'static str,
        reason: String,
    },
    #[error("bulk write to {collection} failed: {reason}")]
    Bulk {
        collection: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Runs,
    Jobs,
    Patterns,
    Logs,
}

impl Collection {
    pub const ALL: [Collection; 4] = [Self::Runs, Self::Jobs, Self::Patterns, Self::Logs];

    pub fn name(self) -> &'static str {
        match self {
            Self::Runs => "runs",
            Self::Jobs => "jobs",
            Self::Patterns => "patterns",
            Self::Logs => "logs",
        }
    }

    /// Tolerant mapping settings; job metadata is wide and messy.
    fn settings(self) -> Value {
        let field_limit = match self {
            Self::Patterns => 100,
            _ => 10_000,
        };
        json!({
            "settings": {
                "index.mapping.total_fields.limit": field_limit,
                "index.mapping.ignore_malformed": true,
            }
        })
    }
}

/// Date-ranged run lookup, one calendar day per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunQuery {
    pub branch: String,
    /// Matched as a prefix wildcard against the posted timestamp.
    pub posted_prefix: String,
    pub sha: Option<String>,
    pub user: Option<String>,
}

impl RunQuery {
    fn to_search_body(&self, limit: usize) -> Value {
        let mut must = vec![
            json!({"wildcard": {"posted.keyword": format!("{}*", self.posted_prefix)}}),
            json!({"term": {"branch.keyword": self.branch}}),
        ];
        if let Some(sha) = &self.sha {
            must.push(json!({"term": {"sha1.keyword": sha}}));
        }
        if let Some(user) = &self.user {
            must.push(json!({"term": {"user.keyword": user}}));
        }
        json!({"size": limit, "query": {"bool": {"must": must}}})
    }

    fn matches(&self, source: &Value) -> bool {
        let field = |key: &str| source.get(key).and_then(Value::as_str).unwrap_or("");
        field("posted").starts_with(&self.posted_prefix)
            && field("branch") == self.branch
            && self.sha.as_deref().map_or(true, |sha| field("sha1") == sha)
            && self
                .user
                .as_deref()
                .map_or(true, |user| field("user") == user)
    }
}

/// A matched run document: natural id plus stored source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: Value,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn ensure_collection(&self, collection: Collection) -> Result<(), IndexError>;
    async fn upsert(&self, collection: Collection, id: &str, doc: &Value) -> Result<(), IndexError>;
    async fn search_runs(&self, query: &RunQuery, limit: usize) -> Result<Vec<Hit>, IndexError>;
    async fn bulk_insert(&self, collection: Collection, docs: &[Value]) -> Result<(), IndexError>;
}

/// Normalize shape-variable fields and recurse everywhere else. Runs
/// before every write.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let value = if SHAPE_VARIABLE_FIELDS.contains(&key.as_str()) {
                        ShapeField::from_value(value).normalize()
                    } else {
                        value
                    };
                    (key, sanitize(value))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        other => other,
    }
}

#[derive(Clone)]
pub struct DocumentStore {
    backend: Arc<dyn IndexBackend>,
}

impl DocumentStore {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self { backend }
    }

    /// Idempotent startup setup; fails only on genuine creation errors.
    pub async fn ensure_collections(&self) -> Result<(), IndexError> {
        for collection in Collection::ALL {
            self.backend.ensure_collection(collection).await?;
        }
        Ok(())
    }

    /// Sanitize then write with read-after-write visibility. The caller
    /// logs a rejection and continues with sibling documents.
    pub async fn upsert(
        &self,
        collection: Collection,
        id: &str,
        doc: Value,
    ) -> Result<(), IndexError> {
        self.backend.upsert(collection, id, &sanitize(doc)).await
    }

    /// Best-effort bounded query; `None` on failure rather than an error
    /// since reporting tolerates missing data.
    pub async fn query_runs(&self, query: &RunQuery) -> Option<Vec<Hit>> {
        match self.backend.search_runs(query, PAGE_SIZE).await {
            Ok(hits) => Some(hits),
            Err(err) => {
                warn!(error = %err, branch = %query.branch, "run query failed");
                None
            }
        }
    }

    /// Split log text into non-empty lines and bulk-write fixed-size
    /// batches tagged with the owning job. A failed batch does not block
    /// the ones after it.
    pub async fn insert_log_lines(&self, job_id: &JobId, text: &str) {
        let lines: Vec<LogLine> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(seq, line)| LogLine {
                job_id: job_id.clone(),
                seq,
                text: line.to_string(),
            })
            .collect();

        for batch in lines.chunks(LOG_BATCH_SIZE) {
            let docs: Vec<Value> = batch
                .iter()
                .map(|line| serde_json::to_value(line).expect("log line serializes"))
                .collect();
            if let Err(err) = self.backend.bulk_insert(Collection::Logs, &docs).await {
                warn!(error = %err, job_id = %job_id, "log batch write failed, continuing");
            }
        }
    }
}

/// Search-engine wire backend: collection creation with tolerant
/// settings, upsert-by-id with immediate refresh, bool queries, bulk.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    180
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
}

impl HttpBackend {
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IndexError::Connectivity(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
    }
}

#[async_trait]
impl IndexBackend for HttpBackend {
    async fn ensure_collection(&self, collection: Collection) -> Result<(), IndexError> {
        let name = collection.name();
        let exists = self
            .request(reqwest::Method::HEAD, name)
            .send()
            .await
            .map_err(|e| IndexError::Connectivity(e.to_string()))?;
        if exists.status().is_success() {
            debug!(collection = name, "collection already present");
            return Ok(());
        }

        let response = self
            .request(reqwest::Method::PUT, name)
            .json(&collection.settings())
            .send()
            .await
            .map_err(|e| IndexError::Connectivity(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Lost a creation race; the collection exists either way.
            if body.contains("resource_already_exists_exception") {
                return Ok(());
            }
            return Err(IndexError::Setup {
                collection: name,
                reason: format!("status {status}: {body}"),
            });
        }
        debug!(collection = name, "created collection");
        Ok(())
    }

    async fn upsert(&self, collection: Collection, id: &str, doc: &Value) -> Result<(), IndexError> {
        let name = collection.name();
        let response = self
            .request(reqwest::Method::PUT, &format!("{name}/_doc/{id}?refresh=true"))
            .json(doc)
            .send()
            .await
            .map_err(|e| IndexError::Connectivity(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Rejected {
                collection: name,
                id: id.to_string(),
                reason: format!("status {status}: {body}"),
            });
        }
        Ok(())
    }

    async fn search_runs(&self, query: &RunQuery, limit: usize) -> Result<Vec<Hit>, IndexError> {
        let name = Collection::Runs.name();
        let response = self
            .request(reqwest::Method::POST, &format!("{name}/_search"))
            .json(&query.to_search_body(limit))
            .send()
            .await
            .map_err(|e| IndexError::Connectivity(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Search {
                collection: name,
                reason: format!("status {status}: {body}"),
            });
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Search {
                collection: name,
                reason: e.to_string(),
            })?;
        Ok(parsed.hits.hits)
    }

    async fn bulk_insert(&self, collection: Collection, docs: &[Value]) -> Result<(), IndexError> {
        let name = collection.name();
        let mut body = String::new();
        for doc in docs {
            body.push_str(&json!({"index": {"_index": name}}).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| IndexError::Connectivity(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Bulk {
                collection: name,
                reason: format!("status {status}"),
            });
        }
        let parsed: BulkResponse = response.json().await.map_err(|e| IndexError::Bulk {
            collection: name,
            reason: e.to_string(),
        })?;
        if parsed.errors {
            return Err(IndexError::Bulk {
                collection: name,
                reason: "partial bulk rejection".to_string(),
            });
        }
        Ok(())
    }
}

/// In-process backend with the same visibility semantics, used by the
/// pipeline and report tests.
#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<Collection, BTreeMap<String, Value>>>,
    bulk_batches: Mutex<Vec<(Collection, Vec<Value>)>>,
    search_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: Collection, id: &str) -> Option<Value> {
        self.collections
            .lock()
            .await
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .lock()
            .await
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    pub async fn bulk_batches(&self) -> Vec<(Collection, Vec<Value>)> {
        self.bulk_batches.lock().await.clone()
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexBackend for MemoryBackend {
    async fn ensure_collection(&self, collection: Collection) -> Result<(), IndexError> {
        self.collections
            .lock()
            .await
            .entry(collection)
            .or_default();
        Ok(())
    }

    async fn upsert(&self, collection: Collection, id: &str, doc: &Value) -> Result<(), IndexError> {
        self.collections
            .lock()
            .await
            .entry(collection)
            .or_default()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    async fn search_runs(&self, query: &RunQuery, limit: usize) -> Result<Vec<Hit>, IndexError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let collections = self.collections.lock().await;
        let Some(runs) = collections.get(&Collection::Runs) else {
            return Ok(Vec::new());
        };
        Ok(runs
            .iter()
            .filter(|(_, source)| query.matches(source))
            .take(limit)
            .map(|(id, source)| Hit {
                id: id.clone(),
                source: source.clone(),
            })
            .collect())
    }

    async fn bulk_insert(&self, collection: Collection, docs: &[Value]) -> Result<(), IndexError> {
        self.bulk_batches
            .lock()
            .await
            .push((collection, docs.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend;

    #[async_trait]
    impl IndexBackend for FailingBackend {
        async fn ensure_collection(&self, _collection: Collection) -> Result<(), IndexError> {
            Err(IndexError::Connectivity("down".into()))
        }
        async fn upsert(
            &self,
            collection: Collection,
            id: &str,
            _doc: &Value,
        ) -> Result<(), IndexError> {
            Err(IndexError::Rejected {
                collection: collection.name(),
                id: id.to_string(),
                reason: "mapper_parsing_exception".into(),
            })
        }
        async fn search_runs(&self, _query: &RunQuery, _limit: usize) -> Result<Vec<Hit>, IndexError> {
            Err(IndexError::Search {
                collection: "runs",
                reason: "timeout".into(),
            })
        }
        async fn bulk_insert(&self, collection: Collection, _docs: &[Value]) -> Result<(), IndexError> {
            Err(IndexError::Bulk {
                collection: collection.name(),
                reason: "down".into(),
            })
        }
    }

    #[test]
    fn sanitize_normalizes_shape_variable_fields() {
        let doc = json!({
            "job_id": "123",
            "targets": "host-a",
            "overrides": [1, 2],
            "tasks": null,
            "sentry_event": {"url": "https://sentry.example.com/1"},
            "failure_reason": "untouched",
        });
        let sanitized = sanitize(doc);
        assert_eq!(sanitized["targets"], json!({"value": "host-a"}));
        assert_eq!(sanitized["overrides"], json!({"items": [1, 2]}));
        assert_eq!(sanitized["tasks"], json!({}));
        assert_eq!(
            sanitized["sentry_event"],
            json!({"url": "https://sentry.example.com/1"})
        );
        assert_eq!(sanitized["failure_reason"], json!("untouched"));
    }

    #[test]
    fn sanitize_recurses_into_nested_documents() {
        let doc = json!({"config": {"targets": ["a", "b"], "depth": {"tasks": "t"}}});
        let sanitized = sanitize(doc);
        assert_eq!(sanitized["config"]["targets"], json!({"items": ["a", "b"]}));
        assert_eq!(sanitized["config"]["depth"]["tasks"], json!({"value": "t"}));
    }

    #[tokio::test]
    async fn upsert_by_id_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend.clone());

        let doc = json!({"name": "run-a", "branch": "main"});
        store
            .upsert(Collection::Runs, "run-a", doc.clone())
            .await
            .unwrap();
        store.upsert(Collection::Runs, "run-a", doc).await.unwrap();

        assert_eq!(backend.len(Collection::Runs).await, 1);
    }

    #[tokio::test]
    async fn reingestion_overwrites_by_natural_id() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend.clone());

        store
            .upsert(Collection::Runs, "run-a", json!({"status": "running"}))
            .await
            .unwrap();
        store
            .upsert(Collection::Runs, "run-a", json!({"status": "finished"}))
            .await
            .unwrap();

        let doc = backend.document(Collection::Runs, "run-a").await.unwrap();
        assert_eq!(doc["status"], json!("finished"));
    }

    #[tokio::test]
    async fn log_lines_are_batched_and_skip_empty_lines() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend.clone());

        let mut text = String::new();
        for i in 0..2500 {
            text.push_str(&format!("line {i}\n"));
            if i % 10 == 0 {
                text.push_str("\n   \n");
            }
        }

        store.insert_log_lines(&JobId::from("42"), &text).await;

        let batches = backend.bulk_batches().await;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].1.len(), LOG_BATCH_SIZE);
        assert_eq!(batches[1].1.len(), LOG_BATCH_SIZE);
        assert_eq!(batches[2].1.len(), 500);
        assert_eq!(batches[0].0, Collection::Logs);
        assert_eq!(batches[0].1[0]["job_id"], json!("42"));
        assert_eq!(batches[0].1[0]["seq"], json!(0));
    }

    #[tokio::test]
    async fn failed_query_yields_none_not_an_error() {
        let store = DocumentStore::new(Arc::new(FailingBackend));
        let query = RunQuery {
            branch: "main".into(),
            posted_prefix: "2024-01-01".into(),
            sha: None,
            user: None,
        };
        assert!(store.query_runs(&query).await.is_none());
    }

    #[tokio::test]
    async fn memory_search_filters_on_branch_prefix_and_sha() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend.clone());

        store
            .upsert(
                Collection::Runs,
                "a",
                json!({"branch": "main", "posted": "2024-01-01T10:00:00", "sha1": "abc"}),
            )
            .await
            .unwrap();
        store
            .upsert(
                Collection::Runs,
                "b",
                json!({"branch": "main", "posted": "2024-01-02T10:00:00", "sha1": "abc"}),
            )
            .await
            .unwrap();
        store
            .upsert(
                Collection::Runs,
                "c",
                json!({"branch": "release", "posted": "2024-01-01T10:00:00", "sha1": "abc"}),
            )
            .await
            .unwrap();

        let hits = store
            .query_runs(&RunQuery {
                branch: "main".into(),
                posted_prefix: "2024-01-01".into(),
                sha: Some("abc".into()),
                user: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn search_body_includes_optional_terms_only_when_supplied() {
        let bare = RunQuery {
            branch: "main".into(),
            posted_prefix: "2024-01-01".into(),
            sha: None,
            user: None,
        }
        .to_search_body(PAGE_SIZE);
        assert_eq!(bare["query"]["bool"]["must"].as_array().unwrap().len(), 2);
        assert_eq!(bare["size"], json!(PAGE_SIZE));

        let full = RunQuery {
            branch: "main".into(),
            posted_prefix: "2024-01-01".into(),
            sha: Some("abc".into()),
            user: Some("ci".into()),
        }
        .to_search_body(PAGE_SIZE);
        assert_eq!(full["query"]["bool"]["must"].as_array().unwrap().len(), 4);
    }
}
