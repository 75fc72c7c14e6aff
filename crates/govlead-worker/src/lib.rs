//! Bounded worker pool that drives queued lead-search jobs through the
//! search, aggregate, enrich, analyze and save pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use govlead_adapters::{
    synthetic_enrichment, CachedSearchProvider, EnrichmentAdapter, FixtureSearchProvider,
    HttpSearchConfig, HttpSearchProvider, NoEnrichment, NoopPersistence, PersistenceAdapter,
    ReportPersistence, SearchProvider, StaticEnrichment, DEFAULT_SEARCH_URL,
};
use govlead_core::{EnrichedCompany, Error, JobOutput, PipelineStep, Result};
use govlead_engine::{aggregate_awards, assemble_lead};
use govlead_storage::{
    AttemptOutcome, BackoffPolicy, ClaimedJob, HttpClientConfig, JobStore, JobStoreConfig,
    MemoryCache, ReportStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "govlead-worker";

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub search_timeout: Duration,
    pub enrich_timeout: Duration,
    pub top_companies: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        AppConfig::default().worker_config()
    }
}

impl WorkerConfig {
    /// Reads the `GOVLEAD_*` worker variables; see [`AppConfig`] for the list.
    pub fn from_env() -> Self {
        AppConfig::default().with_env().worker_config()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_search_timeout(mut self, limit: Duration) -> Self {
        self.search_timeout = limit;
        self
    }

    pub fn with_enrich_timeout(mut self, limit: Duration) -> Self {
        self.enrich_timeout = limit;
        self
    }

    pub fn with_top_companies(mut self, top: usize) -> Self {
        self.top_companies = top.max(1);
        self
    }

    /// Store settings matching this worker's retry policy.
    pub fn job_store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            ..JobStoreConfig::default()
        }
    }
}

/// Process-wide settings, loadable from YAML and overridable from the
/// environment.
///
/// | Variable | Default |
/// |----------|---------|
/// | `GOVLEAD_WORKER_CONCURRENCY` | `5` |
/// | `GOVLEAD_POLL_INTERVAL_MS` | `250` |
/// | `GOVLEAD_MAX_ATTEMPTS` | `3` |
/// | `GOVLEAD_BACKOFF_BASE_MS` | `2000` |
/// | `GOVLEAD_BACKOFF_MAX_MS` | `30000` |
/// | `GOVLEAD_SEARCH_TIMEOUT_SECS` | `30` |
/// | `GOVLEAD_ENRICH_TIMEOUT_SECS` | `90` |
/// | `GOVLEAD_TOP_COMPANIES` | `20` |
/// | `GOVLEAD_WEB_PORT` | `8080` |
/// | `GOVLEAD_SEARCH_URL` | USAspending `spending_by_award` |
/// | `GOVLEAD_FIXTURE_PATH` | unset |
/// | `GOVLEAD_ENRICHMENT_PATH` | unset |
/// | `GOVLEAD_REPORTS_DIR` | unset |
/// | `GOVLEAD_CACHE_TTL_SECS` | `3600` (0 disables) |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub search_timeout_secs: u64,
    pub enrich_timeout_secs: u64,
    pub top_companies: usize,
    pub web_port: u16,
    pub search_url: String,
    pub fixture_path: Option<PathBuf>,
    pub enrichment_path: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub cache_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 5,
            poll_interval_ms: 250,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
            search_timeout_secs: 30,
            enrich_timeout_secs: 90,
            top_companies: 20,
            web_port: 8080,
            search_url: DEFAULT_SEARCH_URL.to_string(),
            fixture_path: None,
            enrichment_path: None,
            reports_dir: None,
            cache_ttl_secs: 3_600,
        }
    }
}

impl AppConfig {
    /// File values first (when a path is given), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let base = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_yaml_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(base.with_env())
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw).context("decoding yaml config")
    }

    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        override_parsed(&lookup, "GOVLEAD_WORKER_CONCURRENCY", &mut self.worker_concurrency);
        override_parsed(&lookup, "GOVLEAD_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_parsed(&lookup, "GOVLEAD_MAX_ATTEMPTS", &mut self.max_attempts);
        override_parsed(&lookup, "GOVLEAD_BACKOFF_BASE_MS", &mut self.backoff_base_ms);
        override_parsed(&lookup, "GOVLEAD_BACKOFF_MAX_MS", &mut self.backoff_max_ms);
        override_parsed(&lookup, "GOVLEAD_SEARCH_TIMEOUT_SECS", &mut self.search_timeout_secs);
        override_parsed(&lookup, "GOVLEAD_ENRICH_TIMEOUT_SECS", &mut self.enrich_timeout_secs);
        override_parsed(&lookup, "GOVLEAD_TOP_COMPANIES", &mut self.top_companies);
        override_parsed(&lookup, "GOVLEAD_WEB_PORT", &mut self.web_port);
        override_parsed(&lookup, "GOVLEAD_CACHE_TTL_SECS", &mut self.cache_ttl_secs);

        if let Some(url) = lookup("GOVLEAD_SEARCH_URL") {
            self.search_url = url;
        }
        if let Some(path) = lookup("GOVLEAD_FIXTURE_PATH") {
            self.fixture_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("GOVLEAD_ENRICHMENT_PATH") {
            self.enrichment_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("GOVLEAD_REPORTS_DIR") {
            self.reports_dir = Some(PathBuf::from(path));
        }
        self
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_attempts: self.max_attempts.max(1),
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(self.backoff_base_ms),
                multiplier: 2,
                max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            },
            search_timeout: Duration::from_secs(self.search_timeout_secs.max(1)),
            enrich_timeout: Duration::from_secs(self.enrich_timeout_secs.max(1)),
            top_companies: self.top_companies.max(1),
        }
    }

    /// Wires the configured search, enrichment and persistence collaborators.
    pub fn collaborators(&self) -> anyhow::Result<Collaborators> {
        let search: Arc<dyn SearchProvider> = match &self.fixture_path {
            Some(path) => Arc::new(
                FixtureSearchProvider::from_path(path)
                    .with_context(|| format!("loading award fixture {}", path.display()))?,
            ),
            None => {
                let provider = HttpSearchProvider::new(HttpSearchConfig {
                    endpoint: self.search_url.clone(),
                    http: HttpClientConfig {
                        timeout: Duration::from_secs(self.search_timeout_secs.max(1)),
                        ..HttpClientConfig::default()
                    },
                    ..HttpSearchConfig::default()
                })?;
                Arc::new(provider)
            }
        };
        let search: Arc<dyn SearchProvider> = if self.cache_ttl_secs > 0 {
            Arc::new(CachedSearchProvider::new(
                search,
                Arc::new(MemoryCache::new()),
                Duration::from_secs(self.cache_ttl_secs),
            ))
        } else {
            search
        };

        let enrichment: Arc<dyn EnrichmentAdapter> = match &self.enrichment_path {
            Some(path) => Arc::new(
                StaticEnrichment::from_path(path)
                    .with_context(|| format!("loading enrichment table {}", path.display()))?,
            ),
            None => Arc::new(NoEnrichment),
        };

        let persistence: Arc<dyn PersistenceAdapter> = match &self.reports_dir {
            Some(dir) => Arc::new(ReportPersistence::new(ReportStore::new(dir))),
            None => Arc::new(NoopPersistence),
        };

        Ok(Collaborators {
            search,
            enrichment,
            persistence,
        })
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable config override"),
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub enrichment: Arc<dyn EnrichmentAdapter>,
    pub persistence: Arc<dyn PersistenceAdapter>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    WorkerStarted,
    WorkerStopped,
    JobStarted {
        job_id: String,
        attempt: u32,
    },
    JobProgress {
        job_id: String,
        step: PipelineStep,
        percentage: u8,
    },
    JobCompleted {
        job_id: String,
        leads: usize,
        duration_ms: u64,
    },
    RetryScheduled {
        job_id: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    JobFailed {
        job_id: String,
        attempts: u32,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },
}

pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Stops claiming new jobs and waits for in-flight jobs to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        // The loop also exits when the sender is dropped, so a closed channel is fine.
        let _ = self.shutdown_tx.send(()).await;
        self.task.await.context("worker loop panicked")
    }
}

struct JobContext<'a> {
    store: &'a JobStore,
    claimed: &'a ClaimedJob,
    events: &'a broadcast::Sender<WorkerEvent>,
}

impl JobContext<'_> {
    fn job_id(&self) -> &str {
        &self.claimed.job.id
    }

    fn is_cancelled(&self) -> bool {
        self.claimed.cancel.is_cancelled()
    }

    /// Records the step; `Ok(false)` means the job was cancelled meanwhile.
    async fn checkpoint(&self, step: PipelineStep, message: impl Into<String>) -> Result<bool> {
        if self.is_cancelled() {
            return Ok(false);
        }
        match self
            .store
            .report_progress(self.job_id(), step.progress(message))
            .await
        {
            Ok(snapshot) => {
                debug!(step = step.name(), percentage = snapshot.progress.percentage, "step");
                let _ = self.events.send(WorkerEvent::JobProgress {
                    job_id: self.job_id().to_string(),
                    step,
                    percentage: snapshot.progress.percentage,
                });
                Ok(true)
            }
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

enum Attempt {
    Finished(JobOutput),
    Cancelled,
}

struct LeadPipeline {
    collaborators: Collaborators,
    config: WorkerConfig,
}

impl LeadPipeline {
    async fn run(&self, ctx: &JobContext<'_>) -> Result<Attempt> {
        let filters = &ctx.claimed.job.payload;

        if !ctx
            .checkpoint(PipelineStep::Searching, "Searching federal contract awards")
            .await?
        {
            return Ok(Attempt::Cancelled);
        }
        let search = self.collaborators.search.search(filters);
        let awards = match timeout(self.config.search_timeout, search).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Transient(format!(
                    "search provider timed out after {}s",
                    self.config.search_timeout.as_secs()
                )))
            }
        };
        info!(
            provider = self.collaborators.search.name(),
            records = awards.len(),
            "search finished"
        );
        if awards.is_empty() {
            return Ok(Attempt::Finished(JobOutput::empty()));
        }

        let today = Utc::now().date_naive();
        let mut companies = aggregate_awards(&awards, today);
        let total_companies = companies.len();
        if !ctx
            .checkpoint(
                PipelineStep::Aggregating,
                format!("Aggregated {} contracts into {total_companies} companies", awards.len()),
            )
            .await?
        {
            return Ok(Attempt::Cancelled);
        }

        companies.truncate(self.config.top_companies);
        if !ctx
            .checkpoint(
                PipelineStep::Enriching,
                format!("Finding contacts for {} companies", companies.len()),
            )
            .await?
        {
            return Ok(Attempt::Cancelled);
        }
        let names = companies.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        let found = self.enrich(&names).await;

        if !ctx
            .checkpoint(PipelineStep::Analyzing, "Scoring sales opportunities")
            .await?
        {
            return Ok(Attempt::Cancelled);
        }
        let leads = companies
            .into_iter()
            .map(|company| {
                let enriched = enrichment_or_synthetic(&found, &company.name);
                assemble_lead(company, enriched, today)
            })
            .collect::<Vec<_>>();

        if !ctx.checkpoint(PipelineStep::Saving, "Saving leads").await? {
            return Ok(Attempt::Cancelled);
        }
        let persistence = &self.collaborators.persistence;
        if let Err(err) = persistence.save_leads(&leads).await {
            warn!(error = %err, "lead persistence failed; keeping in-memory result");
        }
        if let Err(err) = persistence
            .record_search(filters, awards.len(), total_companies)
            .await
        {
            warn!(error = %err, "search history persistence failed");
        }

        Ok(Attempt::Finished(JobOutput {
            leads,
            total_contracts: awards.len(),
            total_companies,
        }))
    }

    /// Errors and timeouts degrade to "no data"; callers fall back to
    /// synthetic contacts.
    async fn enrich(&self, names: &[String]) -> HashMap<String, EnrichedCompany> {
        match timeout(
            self.config.enrich_timeout,
            self.collaborators.enrichment.enrich(names),
        )
        .await
        {
            Ok(Ok(found)) => {
                if found.is_empty() {
                    warn!(
                        companies = names.len(),
                        "enrichment returned no data; using synthetic contacts"
                    );
                }
                found
            }
            Ok(Err(err)) => {
                warn!(error = %err, "enrichment failed; using synthetic contacts");
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.enrich_timeout.as_secs(),
                    "enrichment timed out; using synthetic contacts"
                );
                HashMap::new()
            }
        }
    }
}

fn enrichment_or_synthetic(
    found: &HashMap<String, EnrichedCompany>,
    name: &str,
) -> EnrichedCompany {
    match found.get(name) {
        Some(enriched) if !enriched.contacts.is_empty() => enriched.clone(),
        Some(enriched) => {
            let mut synthetic = synthetic_enrichment(name);
            if enriched.company_info.is_some() {
                synthetic.company_info = enriched.company_info.clone();
            }
            synthetic
        }
        None => synthetic_enrichment(name),
    }
}

/// Pulls jobs from a shared [`JobStore`] and runs at most
/// `config.concurrency` of them at once.
pub struct LeadWorker {
    store: Arc<JobStore>,
    pipeline: LeadPipeline,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl LeadWorker {
    /// Retries are scheduled by `store`, so its retry policy wins over the
    /// one in `config` when they differ.
    pub fn new(
        store: Arc<JobStore>,
        collaborators: Collaborators,
        mut config: WorkerConfig,
    ) -> Self {
        let store_config = store.config();
        if store_config.max_attempts != config.max_attempts
            || store_config.backoff != config.backoff
        {
            warn!(
                worker_max_attempts = config.max_attempts,
                store_max_attempts = store_config.max_attempts,
                "job store retry policy differs from worker config; using the store's"
            );
            config.max_attempts = store_config.max_attempts;
            config.backoff = store_config.backoff;
        }
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            pipeline: LeadPipeline {
                collaborators,
                config,
            },
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.pipeline.config
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let worker = Arc::new(self);
        let task = tokio::spawn(worker.run(shutdown_rx));
        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let concurrency = self.pipeline.config.concurrency;
        let poll_interval = self.pipeline.config.poll_interval;
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        info!(
            concurrency,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "lead worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(err) = joined {
                    error!(error = ?err, "job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.store.claim_next(Utc::now()).await {
                Some(claimed) => {
                    let worker = Arc::clone(&self);
                    tasks.spawn(async move {
                        let job_id = claimed.job.id.clone();
                        let attempt = tokio::spawn({
                            let worker = Arc::clone(&worker);
                            async move { worker.execute(claimed).await }
                        });
                        if let Err(err) = attempt.await {
                            worker.attempt_aborted(&job_id, err).await;
                        }
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    let reaped = self.store.reap(Utc::now()).await;
                    if reaped > 0 {
                        debug!(reaped, "reaped expired jobs");
                    }
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = self.store.notified() => {}
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "lead worker draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = ?err, "job task panicked");
            }
        }
        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("lead worker stopped");
    }

    async fn execute(&self, claimed: ClaimedJob) {
        let job_id = claimed.job.id.clone();
        let attempt = claimed.job.attempts;
        let span = info_span!("job", job_id = %job_id, attempt);

        async {
            let started = Instant::now();
            info!("job attempt started");
            let _ = self.event_tx.send(WorkerEvent::JobStarted {
                job_id: job_id.clone(),
                attempt,
            });

            let ctx = JobContext {
                store: &self.store,
                claimed: &claimed,
                events: &self.event_tx,
            };
            let outcome = self.pipeline.run(&ctx).await;
            if claimed.cancel.is_cancelled() {
                self.cancelled(&job_id);
                return;
            }

            match outcome {
                Ok(Attempt::Finished(output)) => {
                    let leads = output.leads.len();
                    match self.store.complete(&job_id, output, Utc::now()).await {
                        Ok(_) => {
                            let duration_ms = started.elapsed().as_millis() as u64;
                            info!(leads, duration_ms, "job completed");
                            let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                                job_id: job_id.clone(),
                                leads,
                                duration_ms,
                            });
                        }
                        Err(Error::NotFound(_)) => self.cancelled(&job_id),
                        Err(err) => error!(error = %err, "could not record job completion"),
                    }
                }
                Ok(Attempt::Cancelled) => self.cancelled(&job_id),
                Err(err) => self.attempt_failed(&job_id, err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt_failed(&self, job_id: &str, err: Error) {
        match self.store.fail_attempt(job_id, &err, Utc::now()).await {
            Ok(AttemptOutcome::RetryScheduled { attempt, delay }) => {
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed; retry scheduled"
                );
                let _ = self.event_tx.send(WorkerEvent::RetryScheduled {
                    job_id: job_id.to_string(),
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            }
            Ok(AttemptOutcome::Failed { attempts }) => {
                error!(error = %err, attempts, "job failed");
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id: job_id.to_string(),
                    attempts,
                    error: err.to_string(),
                });
            }
            Err(Error::NotFound(_)) => self.cancelled(job_id),
            Err(store_err) => {
                error!(error = %err, store_error = %store_err, "could not record job failure")
            }
        }
    }

    /// A panicked attempt counts as a transient failure so the job still
    /// reaches a terminal state.
    async fn attempt_aborted(&self, job_id: &str, err: JoinError) {
        let reason = if err.is_panic() { "panicked" } else { "was aborted" };
        error!(job_id, error = %err, "job attempt {reason}");
        let failure = Error::Transient(format!("job attempt {reason}"));
        self.attempt_failed(job_id, failure).await;
    }

    fn cancelled(&self, job_id: &str) {
        info!("job cancelled; attempt abandoned");
        let _ = self.event_tx.send(WorkerEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
    }
}
