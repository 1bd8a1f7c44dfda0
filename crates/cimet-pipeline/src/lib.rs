//! Job wiring and the cron orchestrator: configuration loading, the
//! ingestion pipeline (source -> miner -> store), the per-branch report
//! cycle, and schedule/overlap/shutdown control.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use cimet_index::{Collection, DocumentStore, HttpBackend, IndexConfig};
use cimet_miner::TemplateMiner;
use cimet_report::{
    render_html, split_recipients, subject, FileNotifier, Notification, Notifier, ReportAggregator,
    ReportOutcome,
};
use cimet_source::{Filter, RunSource, SourceClient, SourceConfig, SourceError};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cimet-pipeline";

/// Triggers firing more than this long after their scheduled tick are
/// misfires and are skipped, not executed.
pub const MISFIRE_GRACE_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("required config value missing or empty: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerSettings {
    pub snapshot_path: PathBuf,
    /// Bypass template mining entirely; jobs and runs still index.
    #[serde(default)]
    pub skip_templates: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSettings {
    pub results_server: String,
    /// Possibly comma-separated address list.
    pub recipients: String,
    pub reports_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_ingest_cron")]
    pub ingest_cron: String,
    #[serde(default = "default_report_cron")]
    pub report_cron: String,
    pub suites: Vec<String>,
    pub branches: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_report_window_days")]
    pub report_window_days: u32,
    /// Fetch and index console logs for failed jobs.
    #[serde(default)]
    pub fetch_logs: bool,
}

fn default_ingest_cron() -> String {
    // Every four hours, on the hour.
    "0 0 */4 * * *".to_string()
}

fn default_report_cron() -> String {
    // Monday 06:00 UTC.
    "0 0 6 * * Mon".to_string()
}

fn default_report_window_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub index: IndexConfig,
    pub miner: MinerSettings,
    pub report: ReportSettings,
    pub schedule: ScheduleSettings,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (!self.source.base_url.is_empty(), "source.base_url"),
            (!self.index.base_url.is_empty(), "index.base_url"),
            (!self.report.results_server.is_empty(), "report.results_server"),
            (!self.report.recipients.is_empty(), "report.recipients"),
            (!self.schedule.suites.is_empty(), "schedule.suites"),
            (!self.schedule.branches.is_empty(), "schedule.branches"),
        ];
        for (present, key) in required {
            if !present {
                return Err(ConfigError::Missing(key));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ingestion pipeline

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub runs: usize,
    pub jobs: usize,
    pub failures_clustered: usize,
    pub skipped_runs: usize,
}

pub struct IngestPipeline {
    source: Arc<dyn RunSource>,
    store: DocumentStore,
    miner: Option<Mutex<TemplateMiner>>,
    fetch_logs: bool,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn RunSource>,
        store: DocumentStore,
        miner: Option<TemplateMiner>,
        fetch_logs: bool,
    ) -> Self {
        Self {
            source,
            store,
            miner: miner.map(Mutex::new),
            fetch_logs,
        }
    }

    /// One ingestion cycle: list runs for the filters, process each run
    /// inside its own failure boundary. Only connectivity loss aborts
    /// the cycle; the next scheduled firing is the retry.
    pub async fn ingest(&self, filters: &[Filter]) -> Result<IngestSummary, SourceError> {
        let runs = self.source.list_runs(filters).await?;
        let mut summary = IngestSummary::default();
        for run in runs {
            let name = run.name.clone();
            match self.process_run(run).await {
                Ok((jobs, clustered)) => {
                    summary.runs += 1;
                    summary.jobs += jobs;
                    summary.failures_clustered += clustered;
                }
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    warn!(run = %name, error = %err, "run skipped, continuing with siblings");
                    summary.skipped_runs += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn process_run(
        &self,
        mut run: cimet_core::RunRecord,
    ) -> Result<(usize, usize), SourceError> {
        let jobs = self.source.list_jobs(&run).await?;
        let mut clustered = 0;

        // The job-id list reflects exactly what this ingestion fetched.
        run.job_ids.clear();
        for job in &jobs {
            match self.process_job(job).await {
                Ok(true) => clustered += 1,
                Ok(false) => {}
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "job skipped, continuing with siblings");
                }
            }
            run.job_ids.push(job.job_id.clone());
        }

        let name = run.name.clone();
        let doc = serde_json::to_value(&run).expect("run record serializes");
        if let Err(err) = self.store.upsert(Collection::Runs, &name, doc).await {
            warn!(run = %name, error = %err, "run document rejected");
        }
        Ok((jobs.len(), clustered))
    }

    async fn process_job(&self, job: &cimet_core::JobRecord) -> Result<bool, SourceError> {
        let mut doc = serde_json::to_value(job).expect("job record serializes");
        let mut clustered = false;

        if let (Some(miner), Some(reason)) = (&self.miner, &job.failure_reason) {
            let cluster = miner.lock().await.add_message(reason);
            let pattern = json!({
                "cluster_id": cluster.cluster_id,
                "template": cluster.template_text(),
                "match_count": cluster.match_count,
            });
            let id = cluster.cluster_id.to_string();
            if let Err(err) = self.store.upsert(Collection::Patterns, &id, pattern.clone()).await {
                warn!(cluster_id = %id, error = %err, "failure template rejected");
            }
            doc["failure_template"] = pattern;
            clustered = true;
        }

        let id = job.job_id.to_string();
        if let Err(err) = self.store.upsert(Collection::Jobs, &id, doc).await {
            warn!(job_id = %id, error = %err, "job document rejected");
        }

        if self.fetch_logs && job.failed() {
            if let Some(href) = &job.log_href {
                match self.source.fetch_log(href).await {
                    Ok(text) => self.store.insert_log_lines(&job.job_id, &text).await,
                    Err(err) if err.is_connectivity() => return Err(err),
                    Err(err) => {
                        warn!(job_id = %id, error = %err, "log fetch failed, job kept");
                    }
                }
            }
        }

        Ok(clustered)
    }
}

// ---------------------------------------------------------------------------
// Report cycle

pub struct ReportRunner {
    aggregator: ReportAggregator,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl ReportRunner {
    pub fn new(
        aggregator: ReportAggregator,
        notifier: Arc<dyn Notifier>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            aggregator,
            notifier,
            recipients,
        }
    }

    /// Returns whether a notification went out; no data means no mail.
    pub async fn report_branch(
        &self,
        branch: &str,
        start: NaiveDate,
        end: NaiveDate,
        sha: Option<&str>,
        user: Option<&str>,
    ) -> anyhow::Result<bool> {
        match self.aggregator.build(branch, start, end, sha, user).await {
            ReportOutcome::NoData => {
                warn!(branch, "no data for branch, skipping notification");
                Ok(false)
            }
            ReportOutcome::Rows { sha, rows } => {
                let notification = Notification {
                    subject: subject(branch, end),
                    html_body: render_html(branch, sha.as_deref(), &rows),
                    recipients: self.recipients.clone(),
                };
                self.notifier
                    .send(&notification)
                    .with_context(|| format!("sending report for branch {branch}"))?;
                info!(branch, suites = rows.len(), "report sent");
                Ok(true)
            }
        }
    }

    /// Per-branch failure boundary: one bad branch never blocks the rest.
    pub async fn report_all(&self, branches: &[String], start: NaiveDate, end: NaiveDate) {
        for branch in branches {
            if let Err(err) = self.report_branch(branch, start, end, None, None).await {
                warn!(branch, error = %err, "report failed for branch, continuing");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Overlap and misfire control

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A prior instance of the same job class is still running.
    Overlap,
    /// The trigger fired past its grace window.
    Misfire,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap => f.write_str("overlap"),
            Self::Misfire => f.write_str("misfire"),
        }
    }
}

/// Per-job-class execution gate: at most one running instance, and
/// late triggers are skipped instead of executed.
#[derive(Debug)]
pub struct JobGate {
    name: &'static str,
    running: AtomicBool,
    expected_tick: StdMutex<Option<DateTime<Utc>>>,
    grace: chrono::Duration,
}

#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<JobGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::SeqCst);
    }
}

impl JobGate {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::with_grace(name, MISFIRE_GRACE_SECS)
    }

    pub fn with_grace(name: &'static str, grace_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            name,
            running: AtomicBool::new(false),
            expected_tick: StdMutex::new(None),
            grace: chrono::Duration::seconds(grace_secs),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Recorded after every trigger so the next firing can detect how
    /// late it is.
    pub fn record_next_tick(&self, tick: Option<DateTime<Utc>>) {
        *self.expected_tick.lock().expect("gate lock poisoned") = tick;
    }

    pub fn try_start(self: &Arc<Self>, now: DateTime<Utc>) -> Result<GateGuard, SkipReason> {
        let expected = *self.expected_tick.lock().expect("gate lock poisoned");
        if let Some(expected) = expected {
            if now - expected > self.grace {
                return Err(SkipReason::Misfire);
            }
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SkipReason::Overlap);
        }
        Ok(GateGuard {
            gate: Arc::clone(self),
        })
    }

    pub fn is_idle(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator

async fn run_ingest_trigger(
    gate: &Arc<JobGate>,
    pipeline: &Arc<IngestPipeline>,
    suites: &[String],
    user: Option<&str>,
) {
    let guard = match gate.try_start(Utc::now()) {
        Ok(guard) => guard,
        Err(reason) => {
            warn!(job = gate.name(), %reason, "trigger skipped");
            return;
        }
    };

    let invocation = Uuid::new_v4();
    let span = info_span!("ingest_job", %invocation);
    async {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        for suite in suites {
            let mut filters = vec![Filter::Suite(suite.clone())];
            if let Some(user) = user {
                filters.push(Filter::User(user.to_string()));
            }
            filters.push(Filter::Date(today.clone()));

            match pipeline.ingest(&filters).await {
                Ok(summary) => info!(
                    suite,
                    runs = summary.runs,
                    jobs = summary.jobs,
                    clustered = summary.failures_clustered,
                    skipped = summary.skipped_runs,
                    "suite ingested"
                ),
                Err(err) if err.is_connectivity() => {
                    error!(error = %err, "metadata service unreachable, aborting cycle");
                    break;
                }
                Err(err) => warn!(suite, error = %err, "suite ingestion failed, continuing"),
            }
        }
    }
    .instrument(span)
    .await;

    drop(guard);
}

async fn run_report_trigger(
    gate: &Arc<JobGate>,
    reporter: &Arc<ReportRunner>,
    branches: &[String],
    window_days: u32,
) {
    let guard = match gate.try_start(Utc::now()) {
        Ok(guard) => guard,
        Err(reason) => {
            warn!(job = gate.name(), %reason, "trigger skipped");
            return;
        }
    };

    let invocation = Uuid::new_v4();
    let span = info_span!("report_job", %invocation);
    async {
        let end = Utc::now().date_naive();
        let start = end - chrono::Duration::days(i64::from(window_days.max(1)) - 1);
        reporter.report_all(branches, start, end).await;
    }
    .instrument(span)
    .await;

    drop(guard);
}

pub struct Orchestrator {
    scheduler: JobScheduler,
    ingest_gate: Arc<JobGate>,
    report_gate: Arc<JobGate>,
}

impl Orchestrator {
    /// Build every component, verify external dependencies, and start
    /// both cron jobs. Config, connectivity and snapshot-lock failures
    /// here are fatal to the process.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let source = Arc::new(SourceClient::new(&config.source)?);
        source
            .connect()
            .await
            .context("metadata service connectivity probe")?;

        let store = DocumentStore::new(Arc::new(HttpBackend::new(&config.index)?));
        store
            .ensure_collections()
            .await
            .context("creating index collections")?;

        let miner = if config.miner.skip_templates {
            None
        } else {
            Some(TemplateMiner::open(&config.miner.snapshot_path)?)
        };
        let pipeline = Arc::new(IngestPipeline::new(
            source,
            store.clone(),
            miner,
            config.schedule.fetch_logs,
        ));

        let aggregator = ReportAggregator::new(store, &config.report.results_server);
        let notifier: Arc<dyn Notifier> = Arc::new(FileNotifier::new(&config.report.reports_dir));
        let reporter = Arc::new(ReportRunner::new(
            aggregator,
            notifier,
            split_recipients(&config.report.recipients),
        ));

        let ingest_gate = JobGate::new("ingest");
        let report_gate = JobGate::new("report");
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;

        {
            let gate = ingest_gate.clone();
            let suites = config.schedule.suites.clone();
            let user = config.schedule.user.clone();
            let job = Job::new_async(config.schedule.ingest_cron.as_str(), move |uuid, mut handle| {
                let gate = gate.clone();
                let pipeline = pipeline.clone();
                let suites = suites.clone();
                let user = user.clone();
                Box::pin(async move {
                    run_ingest_trigger(&gate, &pipeline, &suites, user.as_deref()).await;
                    if let Ok(next) = handle.next_tick_for_job(uuid).await {
                        gate.record_next_tick(next);
                    }
                })
            })
            .with_context(|| {
                format!("creating ingest job for cron {}", config.schedule.ingest_cron)
            })?;
            scheduler.add(job).await.context("adding ingest job")?;
        }

        {
            let gate = report_gate.clone();
            let branches = config.schedule.branches.clone();
            let window_days = config.schedule.report_window_days;
            let job = Job::new_async(config.schedule.report_cron.as_str(), move |uuid, mut handle| {
                let gate = gate.clone();
                let reporter = reporter.clone();
                let branches = branches.clone();
                Box::pin(async move {
                    run_report_trigger(&gate, &reporter, &branches, window_days).await;
                    if let Ok(next) = handle.next_tick_for_job(uuid).await {
                        gate.record_next_tick(next);
                    }
                })
            })
            .with_context(|| {
                format!("creating report job for cron {}", config.schedule.report_cron)
            })?;
            scheduler.add(job).await.context("adding report job")?;
        }

        scheduler.start().await.context("starting scheduler")?;
        info!(
            ingest_cron = %config.schedule.ingest_cron,
            report_cron = %config.schedule.report_cron,
            "scheduler started"
        );

        Ok(Self {
            scheduler,
            ingest_gate,
            report_gate,
        })
    }

    /// Block until a termination signal, then stop accepting triggers
    /// and wait for in-flight jobs to reach idle. A second signal exits
    /// without finishing the drain.
    pub async fn run_until_shutdown(mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, draining"),
            _ = sigint.recv() => info!("received SIGINT, draining"),
        }

        if let Err(err) = self.scheduler.shutdown().await {
            error!(error = %err, "scheduler shutdown failed, draining anyway");
        }

        while !(self.ingest_gate.is_idle() && self.report_gate.is_idle()) {
            tokio::select! {
                _ = sigterm.recv() => {
                    warn!("second signal, exiting without drain");
                    return Ok(());
                }
                _ = sigint.recv() => {
                    warn!("second signal, exiting without drain");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }

        info!("in-flight jobs drained, exiting");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// One-shot entry points for the CLI

pub async fn ingest_once(config: &Config, filters: &[Filter]) -> anyhow::Result<IngestSummary> {
    let source = Arc::new(SourceClient::new(&config.source)?);
    source
        .connect()
        .await
        .context("metadata service connectivity probe")?;

    let store = DocumentStore::new(Arc::new(HttpBackend::new(&config.index)?));
    store
        .ensure_collections()
        .await
        .context("creating index collections")?;

    let miner = if config.miner.skip_templates {
        None
    } else {
        Some(TemplateMiner::open(&config.miner.snapshot_path)?)
    };
    let pipeline = IngestPipeline::new(source, store, miner, config.schedule.fetch_logs);
    Ok(pipeline.ingest(filters).await?)
}

pub async fn report_once(
    config: &Config,
    branch: &str,
    start: NaiveDate,
    end: NaiveDate,
    sha: Option<&str>,
) -> anyhow::Result<bool> {
    let store = DocumentStore::new(Arc::new(HttpBackend::new(&config.index)?));
    let aggregator = ReportAggregator::new(store, &config.report.results_server);
    let notifier: Arc<dyn Notifier> = Arc::new(FileNotifier::new(&config.report.reports_dir));
    let runner = ReportRunner::new(
        aggregator,
        notifier,
        split_recipients(&config.report.recipients),
    );
    runner.report_branch(branch, start, end, sha, None).await
}

pub async fn run_scheduler(config: Config) -> anyhow::Result<()> {
    Orchestrator::start(config).await?.run_until_shutdown().await
}
