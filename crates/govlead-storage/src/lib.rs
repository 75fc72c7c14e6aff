//! Job store, retry bookkeeping, caching and report persistence for govlead.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govlead_core::{
    Error, Job, JobFailure, JobOutput, JobProgress, JobState, PipelineStep, Result, SearchFilters,
};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "govlead-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(attempt_index as u32)
            .unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionWindow {
    pub max_age: Duration,
    pub max_count: usize,
}

/// How long terminal jobs stay readable before the store drops them.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: RetentionWindow,
    pub failed: RetentionWindow,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: RetentionWindow {
                max_age: Duration::from_secs(60 * 60),
                max_count: 100,
            },
            failed: RetentionWindow {
                max_age: Duration::from_secs(2 * 60 * 60),
                max_count: 500,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobStoreConfig {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Tripped when a job is cancelled; the worker checks it between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn trip(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Arc<Job>,
    pub cancel: CancelSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    RetryScheduled { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct JobEntry {
    snapshot: Arc<Job>,
    cancel: CancelSignal,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<String, JobEntry>,
    queue: VecDeque<String>,
}

/// In-process job store and FIFO queue.
///
/// Every mutation clones the current snapshot, edits the copy and swaps the
/// `Arc` under the write lock, so `get` always returns a fully written state.
pub struct JobStore {
    state: RwLock<StoreState>,
    notify: Notify,
    config: JobStoreConfig,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(JobStoreConfig::default())
    }
}

impl JobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    /// Resolves when new work may be claimable.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub async fn enqueue(&self, payload: SearchFilters) -> Result<String> {
        payload.validate()?;
        let now = Utc::now();
        let mut state = self.state.write().await;
        let id = loop {
            let candidate = generate_job_id(now);
            if !state.jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        let job = Job::new_queued(id.clone(), payload, self.config.max_attempts, now);
        state.jobs.insert(
            id.clone(),
            JobEntry {
                snapshot: Arc::new(job),
                cancel: CancelSignal::default(),
            },
        );
        state.queue.push_back(id.clone());
        drop(state);

        self.notify.notify_one();
        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    pub async fn get(&self, job_id: &str) -> Result<Arc<Job>> {
        let state = self.state.read().await;
        state
            .jobs
            .get(job_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    /// Removes the job record. In-flight work observes the tripped signal at
    /// its next step boundary.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.jobs.remove(job_id) {
            Some(entry) => {
                entry.cancel.trip();
                state.queue.retain(|id| id != job_id);
                debug!(job_id, previous_state = entry.snapshot.state.as_str(), "job cancelled");
                true
            }
            None => false,
        }
    }

    /// Claims the oldest queued job whose retry delay has elapsed.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Option<ClaimedJob> {
        let mut state = self.state.write().await;
        let StoreState { jobs, queue } = &mut *state;

        let position = queue.iter().position(|id| {
            jobs.get(id).is_some_and(|entry| {
                entry.snapshot.state == JobState::Queued
                    && entry.snapshot.not_before.map_or(true, |at| at <= now)
            })
        })?;
        let id = queue.remove(position)?;
        let entry = jobs.get_mut(&id)?;

        let mut next = (*entry.snapshot).clone();
        next.state = JobState::Active;
        next.attempts += 1;
        next.not_before = None;
        next.started_at.get_or_insert(now);
        entry.snapshot = Arc::new(next);

        Some(ClaimedJob {
            job: entry.snapshot.clone(),
            cancel: entry.cancel.clone(),
        })
    }

    /// Records step progress. Updates that would move the percentage
    /// backwards (a retried attempt replaying early steps) are dropped.
    pub async fn report_progress(&self, job_id: &str, progress: JobProgress) -> Result<Arc<Job>> {
        if progress.percentage >= 100 {
            return Err(Error::Validation(
                "progress reaches 100 only through completion".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        replace_snapshot(&mut state, job_id, |job| {
            require_active(job)?;
            if progress.percentage >= job.progress.percentage {
                job.progress = progress;
            }
            Ok(())
        })
    }

    pub async fn complete(
        &self,
        job_id: &str,
        output: JobOutput,
        now: DateTime<Utc>,
    ) -> Result<Arc<Job>> {
        let mut state = self.state.write().await;
        let snapshot = replace_snapshot(&mut state, job_id, |job| {
            require_active(job)?;
            job.state = JobState::Completed;
            job.progress = PipelineStep::Complete.progress(format!(
                "Found {} companies from {} contracts",
                output.total_companies, output.total_contracts
            ));
            job.result = Some(output);
            job.failure = None;
            job.finished_at = Some(now);
            Ok(())
        })?;
        reap_locked(&mut state, &self.config.retention, now);
        Ok(snapshot)
    }

    /// Applies the retry policy to a failed attempt.
    pub async fn fail_attempt(
        &self,
        job_id: &str,
        err: &Error,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let backoff = self.config.backoff;
        let mut outcome = AttemptOutcome::Failed { attempts: 0 };
        let mut state = self.state.write().await;

        replace_snapshot(&mut state, job_id, |job| {
            require_active(job)?;
            if err.is_retryable() && job.attempts < job.max_attempts {
                let delay = backoff.delay_for_attempt(job.attempts.saturating_sub(1) as usize);
                let delay_chrono =
                    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                job.state = JobState::Queued;
                job.not_before = Some(now + delay_chrono);
                outcome = AttemptOutcome::RetryScheduled {
                    attempt: job.attempts,
                    delay,
                };
            } else {
                job.state = JobState::Failed;
                job.failure = Some(JobFailure::from_error(err));
                job.finished_at = Some(now);
                outcome = AttemptOutcome::Failed {
                    attempts: job.attempts,
                };
            }
            Ok(())
        })?;

        match outcome {
            AttemptOutcome::RetryScheduled { .. } => {
                state.queue.push_back(job_id.to_string());
                drop(state);
                self.notify.notify_one();
            }
            AttemptOutcome::Failed { .. } => {
                reap_locked(&mut state, &self.config.retention, now);
            }
        }
        Ok(outcome)
    }

    /// Drops terminal jobs that fall outside the retention policy.
    pub async fn reap(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write().await;
        reap_locked(&mut state, &self.config.retention, now)
    }

    pub async fn counts(&self) -> StoreCounts {
        let state = self.state.read().await;
        let mut counts = StoreCounts::default();
        for entry in state.jobs.values() {
            match entry.snapshot.state {
                JobState::Queued => counts.queued += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

fn generate_job_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("job_{}_{}", now.timestamp_millis(), &suffix[..12])
}

fn require_active(job: &Job) -> Result<()> {
    if job.state == JobState::Active {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "job {} is {}, not active",
            job.id,
            job.state.as_str()
        )))
    }
}

fn replace_snapshot<F>(state: &mut StoreState, job_id: &str, apply: F) -> Result<Arc<Job>>
where
    F: FnOnce(&mut Job) -> Result<()>,
{
    let entry = state
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
    let mut next = (*entry.snapshot).clone();
    apply(&mut next)?;
    entry.snapshot = Arc::new(next);
    Ok(entry.snapshot.clone())
}

fn reap_locked(state: &mut StoreState, policy: &RetentionPolicy, now: DateTime<Utc>) -> usize {
    let mut removed = 0;
    for (terminal, window) in [
        (JobState::Completed, policy.completed),
        (JobState::Failed, policy.failed),
    ] {
        let max_age = chrono::Duration::from_std(window.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut finished: Vec<(DateTime<Utc>, String)> = state
            .jobs
            .values()
            .filter(|entry| entry.snapshot.state == terminal)
            .map(|entry| {
                let job = &entry.snapshot;
                (job.finished_at.unwrap_or(job.created_at), job.id.clone())
            })
            .collect();
        // newest first, so the count cap keeps the most recent jobs
        finished.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        for (index, (finished_at, id)) in finished.into_iter().enumerate() {
            if index >= window.max_count || now - finished_at > max_age {
                state.jobs.remove(&id);
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!(removed, "reaped expired jobs");
    }
    removed
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<JsonValue>;
    async fn set(&self, key: &str, value: JsonValue, ttl: Duration);
}

/// Deterministic cache key: SHA-256 over the canonical JSON of `value`.
pub fn cache_key<T: Serialize>(namespace: &str, value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{namespace}:{}", sha256_hex(&bytes)))
}

#[derive(Debug)]
struct CacheEntry {
    value: JsonValue,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<JsonValue> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once report files.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn report_relative_path(
        &self,
        written_at: DateTime<Utc>,
        kind: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = written_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(kind)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_json<T: Serialize>(
        &self,
        written_at: DateTime<Utc>,
        kind: &str,
        value: &T,
    ) -> anyhow::Result<StoredReport> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {kind} report"))?;
        self.store_bytes(written_at, kind, "json", &bytes).await
    }

    /// Writes through a temp file and an atomic rename; identical content
    /// lands on the same path and is reported as deduplicated.
    pub async fn store_bytes(
        &self,
        written_at: DateTime<Utc>,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.report_relative_path(written_at, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .ok_or_else(|| anyhow!("report path {} has no parent", absolute_path.display()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating report directory {}", parent.display()))?;

        let stored = |deduplicated| StoredReport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking report path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp report {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("govlead/{}", env!("CARGO_PKG_VERSION"))),
            max_in_flight: 8,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("http client is shut down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode(_) | FetchError::Closed => RetryDisposition::Retryable,
        }
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => Error::Transient(err.to_string()),
            RetryDisposition::NonRetryable => Error::Validation(err.to_string()),
        }
    }
}

/// JSON-over-HTTP client shared by the remote collaborators.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
    ) -> std::result::Result<JsonValue, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        async {
            let resp = self.client.post(url).json(body).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body: text.chars().take(512).collect(),
                });
            }
            resp.json::<JsonValue>()
                .await
                .map_err(|err| FetchError::Decode(err.to_string()))
        }
        .instrument(info_span!("http_post", url))
        .await
    }
}
