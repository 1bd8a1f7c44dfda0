//! Per-branch digest reports: date-ranged collection, per-suite
//! reduction and notification hand-off.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;
use cimet_core::ResultCounts;
use cimet_index::{DocumentStore, Hit, RunQuery};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cimet-report";

pub const SUBJECT_FORMAT: &str = "CI Test Summary";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("writing report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no recipients configured")]
    NoRecipients,
}

/// One line of the digest: the most recent run for a suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub suite: String,
    pub link: String,
    pub counts: ResultCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// No hits anywhere in the range; callers skip notification.
    NoData,
    Rows {
        sha: Option<String>,
        rows: Vec<ReportRow>,
    },
}

pub struct ReportAggregator {
    store: DocumentStore,
    results_server: String,
}

impl ReportAggregator {
    pub fn new(store: DocumentStore, results_server: &str) -> Self {
        Self {
            store,
            results_server: results_server.trim_end_matches('/').to_string(),
        }
    }

    /// One query per calendar day, inclusive on both ends. A failed day
    /// contributes nothing; reporting is best-effort.
    pub async fn collect(
        &self,
        branch: &str,
        start: NaiveDate,
        end: NaiveDate,
        sha: Option<&str>,
        user: Option<&str>,
    ) -> Vec<Hit> {
        let mut hits = Vec::new();
        let mut day = start;
        while day <= end {
            let query = RunQuery {
                branch: branch.to_string(),
                posted_prefix: day.format("%Y-%m-%d").to_string(),
                sha: sha.map(str::to_string),
                user: user.map(str::to_string),
            };
            if let Some(day_hits) = self.store.query_runs(&query).await {
                hits.extend(day_hits);
            }
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }
        debug!(branch, hits = hits.len(), "collected report hits");
        hits
    }

    /// Group by suite and keep the lexicographically greatest posted
    /// timestamp per group (ISO-8601 sorts lexicographically). With no
    /// supplied sha, the overall latest hit donates a representative one.
    pub fn reduce(&self, hits: &[Hit], sha: Option<&str>) -> ReportOutcome {
        if hits.is_empty() {
            return ReportOutcome::NoData;
        }

        let posted_of = |hit: &Hit| {
            hit.source
                .get("posted")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string()
        };

        let mut latest_per_suite: BTreeMap<String, &Hit> = BTreeMap::new();
        for hit in hits {
            let suite = hit
                .source
                .get("suite")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("N/A")
                .to_string();
            match latest_per_suite.get(&suite) {
                Some(kept) if posted_of(kept) >= posted_of(hit) => {}
                _ => {
                    latest_per_suite.insert(suite, hit);
                }
            }
        }

        let sha = match sha {
            Some(sha) => Some(sha.to_string()),
            None => hits
                .iter()
                .max_by_key(|hit| posted_of(hit))
                .and_then(|hit| hit.source.get("sha1"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        };

        let rows = latest_per_suite
            .into_iter()
            .map(|(suite, hit)| ReportRow {
                suite,
                link: format!("{}/{}", self.results_server, hit.id),
                counts: hit
                    .source
                    .get("results")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default(),
            })
            .collect();

        ReportOutcome::Rows { sha, rows }
    }

    pub async fn build(
        &self,
        branch: &str,
        start: NaiveDate,
        end: NaiveDate,
        sha: Option<&str>,
        user: Option<&str>,
    ) -> ReportOutcome {
        let hits = self.collect(branch, start, end, sha, user).await;
        self.reduce(&hits, sha)
    }
}

pub fn subject(branch: &str, end: NaiveDate) -> String {
    format!("{SUBJECT_FORMAT} - {} - {branch}", end.format("%Y-%m-%d"))
}

/// Render the digest as a self-contained HTML fragment.
pub fn render_html(branch: &str, sha: Option<&str>, rows: &[ReportRow]) -> String {
    let mut html = String::new();
    let _ = writeln!(html, "<h2>Test summary for branch {branch}</h2>");
    if let Some(sha) = sha {
        let _ = writeln!(html, "<p>Build: <code>{sha}</code></p>");
    }
    html.push_str(
        "<table border=\"1\" cellpadding=\"4\">\n<tr>\
         <th>Suite</th><th>Total</th><th>Pass</th><th>Fail</th>\
         <th>Dead</th><th>Waiting</th><th>Queued</th><th>Running</th></tr>\n",
    );
    for row in rows {
        let c = &row.counts;
        let _ = writeln!(
            html,
            "<tr><td><a href=\"{}\">{}</a></td>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td><td>{}</td></tr>",
            row.link, row.suite, c.total, c.pass, c.fail, c.dead, c.waiting, c.queued, c.running
        );
    }
    html.push_str("</table>\n");
    html
}

/// What an external transport consumes. Recipients come pre-split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub html_body: String,
    pub recipients: Vec<String>,
}

/// Split a possibly comma-separated address string, dropping empties.
pub fn split_recipients(addresses: &str) -> Vec<String> {
    addresses
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Drops rendered reports into a directory; the SMTP hand-off is an
/// external collaborator behind the same trait.
pub struct FileNotifier {
    dir: PathBuf,
}

impl FileNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Notifier for FileNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if notification.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        fs::create_dir_all(&self.dir).map_err(|source| NotifyError::Write {
            path: self.dir.clone(),
            source,
        })?;
        let name: String = notification
            .subject
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let path = self.dir.join(format!("{name}.html"));
        fs::write(&path, &notification.html_body).map_err(|source| NotifyError::Write {
            path: path.clone(),
            source,
        })?;
        warn!(
            path = %path.display(),
            recipients = notification.recipients.join(",").as_str(),
            "report written to disk; mail transport not wired"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cimet_index::{Collection, MemoryBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn seeded_store() -> (Arc<MemoryBackend>, DocumentStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend.clone());
        for (id, suite, posted, sha) in [
            ("run-rados-1", "rados", "2024-01-01T10:00:00", "abc"),
            ("run-rados-2", "rados", "2024-01-01T12:00:00", "abc"),
            ("run-smoke-1", "smoke", "2024-01-02T09:00:00", "def"),
        ] {
            store
                .upsert(
                    Collection::Runs,
                    id,
                    json!({
                        "branch": "main",
                        "suite": suite,
                        "posted": posted,
                        "sha1": sha,
                        "results": {"total": 10, "pass": 9, "fail": 1},
                    }),
                )
                .await
                .unwrap();
        }
        (backend, store)
    }

    #[tokio::test]
    async fn reduction_keeps_only_the_latest_hit_per_suite() {
        let (_, store) = seeded_store().await;
        let aggregator = ReportAggregator::new(store, "https://results.example.com");

        let outcome = aggregator
            .build("main", date("2024-01-01"), date("2024-01-02"), None, None)
            .await;
        let ReportOutcome::Rows { rows, .. } = outcome else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
        let rados = rows.iter().find(|r| r.suite == "rados").unwrap();
        assert_eq!(rados.link, "https://results.example.com/run-rados-2");
    }

    #[tokio::test]
    async fn range_scan_issues_one_query_per_day() {
        let (backend, store) = seeded_store().await;
        let aggregator = ReportAggregator::new(store, "https://results.example.com");

        aggregator
            .collect("main", date("2024-01-01"), date("2024-01-03"), None, None)
            .await;
        assert_eq!(backend.search_calls(), 3);
    }

    #[tokio::test]
    async fn empty_range_yields_no_data_not_an_empty_report() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend);
        let aggregator = ReportAggregator::new(store, "https://results.example.com");

        let outcome = aggregator
            .build("main", date("2024-01-01"), date("2024-01-03"), None, None)
            .await;
        assert_eq!(outcome, ReportOutcome::NoData);
    }

    #[tokio::test]
    async fn representative_sha_comes_from_the_latest_hit_when_unsupplied() {
        let (_, store) = seeded_store().await;
        let aggregator = ReportAggregator::new(store, "https://results.example.com");

        let outcome = aggregator
            .build("main", date("2024-01-01"), date("2024-01-02"), None, None)
            .await;
        let ReportOutcome::Rows { sha, .. } = outcome else {
            panic!("expected rows");
        };
        assert_eq!(sha.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn supplied_sha_filters_instead_of_being_derived() {
        let (_, store) = seeded_store().await;
        let aggregator = ReportAggregator::new(store, "https://results.example.com");

        let outcome = aggregator
            .build(
                "main",
                date("2024-01-01"),
                date("2024-01-02"),
                Some("abc"),
                None,
            )
            .await;
        let ReportOutcome::Rows { sha, rows } = outcome else {
            panic!("expected rows");
        };
        assert_eq!(sha.as_deref(), Some("abc"));
        assert!(rows.iter().all(|r| r.suite == "rados"));
    }

    #[test]
    fn missing_counters_default_to_zero() {
        let aggregator = ReportAggregator::new(
            DocumentStore::new(Arc::new(MemoryBackend::new())),
            "https://results.example.com",
        );
        let hits = vec![Hit {
            id: "run-x".into(),
            source: json!({"suite": "orch", "posted": "2024-01-01T10:00:00"}),
        }];
        let ReportOutcome::Rows { rows, .. } = aggregator.reduce(&hits, None) else {
            panic!("expected rows");
        };
        assert_eq!(rows[0].counts, ResultCounts::default());
    }

    #[test]
    fn recipients_split_on_commas_and_trim() {
        assert_eq!(
            split_recipients("a@example.com, b@example.com ,,"),
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
        assert!(split_recipients("").is_empty());
    }

    #[test]
    fn html_report_lists_one_row_per_suite() {
        let rows = vec![ReportRow {
            suite: "rados".into(),
            link: "https://results.example.com/run-rados-2".into(),
            counts: ResultCounts {
                total: 10,
                pass: 9,
                fail: 1,
                ..Default::default()
            },
        }];
        let html = render_html("main", Some("abc"), &rows);
        assert!(html.contains("run-rados-2"));
        assert!(html.contains("<code>abc</code>"));
        assert!(html.contains("<td>10</td><td>9</td><td>1</td>"));
    }

    #[test]
    fn file_notifier_writes_the_report_body() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = FileNotifier::new(dir.path());
        let note = Notification {
            subject: subject("main", date("2024-01-07")),
            html_body: "<p>ok</p>".into(),
            recipients: split_recipients("team@example.com"),
        };
        notifier.send(&note).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn file_notifier_rejects_an_empty_recipient_list() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = FileNotifier::new(dir.path());
        let note = Notification {
            subject: "s".into(),
            html_body: String::new(),
            recipients: Vec::new(),
        };
        assert!(matches!(
            notifier.send(&note),
            Err(NotifyError::NoRecipients)
        ));
    }
}
