//! HTTP client for the upstream run/job metadata service.

use std::time::Duration;

use async_trait::async_trait;
use cimet_core::{JobRecord, RunRecord};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cimet-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("metadata service unreachable: {0}")]
    Connectivity(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("unrecognized content type {content_type:?} for {url}")]
    ContentType { content_type: String, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url: {0}")]
    Url(String),
}

impl SourceError {
    /// Connectivity failures abort the whole job execution; everything
    /// else aborts only the run or job in progress.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

fn classify_request_error(err: reqwest::Error, url: &str) -> SourceError {
    if err.is_connect() || err.is_timeout() {
        SourceError::Connectivity(err)
    } else {
        SourceError::Request {
            url: url.to_string(),
            source: err,
        }
    }
}

/// Upstream run listing filters, rendered as path segments in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    User(String),
    Branch(String),
    MachineType(String),
    Suite(String),
    Date(String),
    Status(String),
}

impl Filter {
    fn segments(&self) -> (&'static str, &str) {
        match self {
            Self::User(v) => ("user", v),
            Self::Branch(v) => ("branch", v),
            Self::MachineType(v) => ("machine_type", v),
            Self::Suite(v) => ("suite", v),
            Self::Date(v) => ("date", v),
            Self::Status(v) => ("status", v),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Seam between the pipeline and the metadata service, so ingestion can
/// run against a fixture source in tests.
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn list_runs(&self, filters: &[Filter]) -> Result<Vec<RunRecord>, SourceError>;
    async fn list_jobs(&self, run: &RunRecord) -> Result<Vec<JobRecord>, SourceError>;
    async fn fetch_log(&self, href: &str) -> Result<String, SourceError>;
}

enum Body {
    Json(Value),
    Text(String),
}

pub struct SourceClient {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct JobsEnvelope {
    #[serde(default)]
    jobs: Vec<JobRecord>,
}

impl SourceClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|_| SourceError::Url(config.base_url.clone()))?;
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(SourceError::Connectivity)?;
        Ok(Self { http, base_url })
    }

    /// Startup probe. A failure here is fatal to the process; a failure
    /// mid-cycle only aborts that cycle.
    pub async fn connect(&self) -> Result<(), SourceError> {
        let url = self.base_url.clone();
        self.http
            .head(url.clone())
            .send()
            .await
            .map_err(|e| classify_request_error(e, url.as_str()))?;
        debug!(url = %url, "metadata service reachable");
        Ok(())
    }

    fn runs_url(&self, filters: &[Filter]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SourceError::Url(self.base_url.to_string()))?;
            path.pop_if_empty().push("runs");
            for filter in filters {
                let (key, value) = filter.segments();
                path.push(key).push(value);
            }
            // Trailing slash, the way the service routes collection GETs.
            path.push("");
        }
        Ok(url)
    }

    /// Single attempt, no internal retry. The schedule interval is the
    /// retry mechanism.
    async fn get(&self, url: Url) -> Result<Body, SourceError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_request_error(e, url.as_str()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let text = response.text().await.map_err(|e| SourceError::Request {
            url: url.to_string(),
            source: e,
        })?;

        if content_type.starts_with("application/json") {
            let value = serde_json::from_str(&text).map_err(|e| SourceError::Decode {
                url: url.to_string(),
                source: e,
            })?;
            Ok(Body::Json(value))
        } else if content_type.starts_with("text/plain") {
            Ok(Body::Text(text))
        } else {
            Err(SourceError::ContentType {
                content_type,
                url: url.to_string(),
            })
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        let url_text = url.to_string();
        match self.get(url).await? {
            Body::Json(value) => {
                serde_json::from_value(value).map_err(|e| SourceError::Decode {
                    url: url_text,
                    source: e,
                })
            }
            Body::Text(_) => Err(SourceError::ContentType {
                content_type: "text/plain".to_string(),
                url: url_text,
            }),
        }
    }
}

#[async_trait]
impl RunSource for SourceClient {
    async fn list_runs(&self, filters: &[Filter]) -> Result<Vec<RunRecord>, SourceError> {
        let url = self.runs_url(filters)?;
        debug!(url = %url, "listing runs");
        self.get_json(url).await
    }

    async fn list_jobs(&self, run: &RunRecord) -> Result<Vec<JobRecord>, SourceError> {
        let Some(href) = run.href.first() else {
            warn!(run = %run.name, "run carries no job href, treating as empty");
            return Ok(Vec::new());
        };
        let url = Url::parse(href).map_err(|_| SourceError::Url(href.clone()))?;
        debug!(run = %run.name, url = %url, "listing jobs");
        let envelope: JobsEnvelope = self.get_json(url).await?;
        Ok(envelope.jobs)
    }

    async fn fetch_log(&self, href: &str) -> Result<String, SourceError> {
        let url = Url::parse(href).map_err(|_| SourceError::Url(href.to_string()))?;
        match self.get(url).await? {
            Body::Text(text) => Ok(text),
            // Some log endpoints answer JSON wrappers; keep the raw text.
            Body::Json(value) => Ok(value.to_string()),
        }
    }
}
