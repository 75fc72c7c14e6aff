//! Core domain model, error taxonomy and job snapshots for govlead.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "govlead-core";

/// Upper bound on records a single search may request.
pub const MAX_RECORD_LIMIT: usize = 10_000;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    Persistence,
    NotFound,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Network, timeout or upstream availability problem. Safe to retry.
    #[error("transient error: {0}")]
    Transient(String),
    /// Malformed input. Retrying will not help.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) => ErrorKind::Transient,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Serialization(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.city.is_none() && self.state.is_none() && self.zip.is_none() && self.country.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgencyRef {
    pub name: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassificationCode {
    pub code: Option<String>,
    pub description: Option<String>,
}

/// One funding-award record exactly as the search provider returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAward {
    pub award_id: Option<String>,
    pub recipient_name: String,
    pub recipient_uei: Option<String>,
    pub recipient_duns: Option<String>,
    pub recipient_location: Location,
    pub award_amount: f64,
    pub total_obligation: f64,
    pub total_outlays: f64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub awarding_agency: AgencyRef,
    pub funding_agency: AgencyRef,
    pub naics: ClassificationCode,
    pub psc: ClassificationCode,
    pub contract_type: Option<String>,
    pub set_aside_type: Option<String>,
    pub competition_extent: Option<String>,
    pub performance_state: Option<String>,
    pub covid_obligations: f64,
    pub infrastructure_obligations: f64,
    pub disaster_emergency_fund_codes: Vec<String>,
}

/// Parses the date formats award feeds use (`2024-05-01`, RFC 3339, or a
/// date with a trailing time). Anything else is treated as missing.
pub fn parse_award_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencySpend {
    pub name: String,
    pub code: Option<String>,
    pub total_spend: f64,
    pub contract_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeCount {
    pub code: String,
    pub description: Option<String>,
    pub contract_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitionCounts {
    pub full_and_open: usize,
    pub sole_source: usize,
    pub limited: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialPrograms {
    pub emergency_funding: bool,
    pub infrastructure_funding: bool,
}

/// Company-level rollup of every award sharing one recipient identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCompany {
    pub group_key: String,
    pub name: String,
    pub uei: Option<String>,
    pub secondary_id: Option<String>,
    pub location: Location,
    pub total_awards: f64,
    pub total_obligations: f64,
    pub total_outlays: f64,
    pub contract_count: usize,
    pub average_contract_value: f64,
    pub largest_award: f64,
    pub first_contract_date: Option<NaiveDate>,
    pub last_contract_date: Option<NaiveDate>,
    pub active_contracts: usize,
    pub years_in_business: i32,
    pub top_agencies: Vec<AgencySpend>,
    pub agency_count: usize,
    pub top_naics: Vec<CodeCount>,
    pub top_psc: Vec<CodeCount>,
    pub contract_types: BTreeSet<String>,
    pub set_aside_programs: BTreeSet<String>,
    pub competition: CompetitionCounts,
    pub special_programs: SpecialPrograms,
    pub performance_states: BTreeSet<String>,
    pub multi_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelationshipStrength {
    New,
    Emerging,
    Established,
    Strategic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpendingTrend {
    Growing,
    Stable,
    Declining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactSource {
    Enriched,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub title: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linkedin_url: Option<String>,
    pub source: ContactSource,
    #[serde(default)]
    pub is_decision_maker: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanyInfo {
    pub website: Option<String>,
    pub domain: Option<String>,
    pub industry: Option<String>,
    pub employee_count: Option<u32>,
    pub description: Option<String>,
}

/// What the enrichment collaborator knows about one company.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrichedCompany {
    pub contacts: Vec<Contact>,
    pub company_info: Option<CompanyInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesIntelligence {
    pub opportunity_score: u8,
    pub relationship_strength: RelationshipStrength,
    pub spending_trend: SpendingTrend,
    pub insights: Vec<String>,
    pub recommended_approach: String,
    pub decision_makers: Vec<Contact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub company: AggregatedCompany,
    pub intelligence: SalesIntelligence,
    pub contacts: Vec<Contact>,
    pub company_info: Option<CompanyInfo>,
}

/// Search criteria forwarded to the contract-award search provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilters {
    pub keywords: Vec<String>,
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub agencies: Vec<String>,
    pub states: Vec<String>,
    pub set_aside_types: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub limit: Option<usize>,
}

impl SearchFilters {
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(Error::Validation(format!(
                    "start_date {start} is after end_date {end}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err(Error::Validation(format!(
                    "min_amount {min} exceeds max_amount {max}"
                )));
            }
        }
        for amount in [self.min_amount, self.max_amount].into_iter().flatten() {
            if !amount.is_finite() || amount < 0.0 {
                return Err(Error::Validation(format!("invalid amount bound {amount}")));
            }
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_RECORD_LIMIT {
                return Err(Error::Validation(format!(
                    "limit must be between 1 and {MAX_RECORD_LIMIT}, got {limit}"
                )));
            }
        }
        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(Error::Validation("keywords must not be blank".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Ordered pipeline stages and the progress each one reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStep {
    Searching,
    Aggregating,
    Enriching,
    Analyzing,
    Saving,
    Complete,
}

impl PipelineStep {
    pub const TOTAL: u32 = 6;

    pub fn name(self) -> &'static str {
        match self {
            PipelineStep::Searching => "searching",
            PipelineStep::Aggregating => "aggregating",
            PipelineStep::Enriching => "enriching",
            PipelineStep::Analyzing => "analyzing",
            PipelineStep::Saving => "saving",
            PipelineStep::Complete => "complete",
        }
    }

    pub fn index(self) -> u32 {
        self as u32 + 1
    }

    pub fn percentage(self) -> u8 {
        match self {
            PipelineStep::Searching => 20,
            PipelineStep::Aggregating => 40,
            PipelineStep::Enriching => 60,
            PipelineStep::Analyzing => 80,
            PipelineStep::Saving => 90,
            PipelineStep::Complete => 100,
        }
    }

    pub fn progress(self, message: impl Into<String>) -> JobProgress {
        JobProgress {
            step: self.name().to_string(),
            current: self.index(),
            total: Self::TOTAL,
            percentage: self.percentage(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub step: String,
    pub current: u32,
    pub total: u32,
    pub percentage: u8,
    pub message: String,
}

impl JobProgress {
    pub fn queued() -> Self {
        Self {
            step: "queued".to_string(),
            current: 0,
            total: PipelineStep::TOTAL,
            percentage: 0,
            message: "Waiting for an available worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub leads: Vec<Lead>,
    pub total_contracts: usize,
    pub total_companies: usize,
}

impl JobOutput {
    pub fn empty() -> Self {
        Self {
            leads: Vec::new(),
            total_contracts: 0,
            total_companies: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub message: String,
    pub kind: ErrorKind,
}

impl JobFailure {
    pub fn from_error(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind(),
        }
    }

    /// Whether resubmitting the same filters could plausibly succeed.
    pub fn resubmit_is_safe(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Immutable snapshot of a job. The store replaces snapshots wholesale on
/// every transition, so readers never observe a half-applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub payload: SearchFilters,
    pub progress: JobProgress,
    pub result: Option<JobOutput>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_queued(
        id: String,
        payload: SearchFilters,
        max_attempts: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            state: JobState::Queued,
            payload,
            progress: JobProgress::queued(),
            result: None,
            failure: None,
            created_at,
            started_at: None,
            finished_at: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            not_before: None,
        }
    }
}

/// Poll-able status document served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobState,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub attempts: u32,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        let duration = match (job.started_at, job.finished_at) {
            (Some(started), Some(finished)) => Some((finished - started).num_milliseconds()),
            _ => None,
        };
        Self {
            job_id: job.id.clone(),
            status: job.state,
            progress: job.progress.clone(),
            result: job.result.clone(),
            error: job.failure.as_ref().map(|f| f.message.clone()),
            retryable: job.failure.as_ref().map(JobFailure::resubmit_is_safe),
            next_attempt_at: match job.state {
                JobState::Queued => job.not_before,
                _ => None,
            },
            created_at: job.created_at,
            completed_at: job.finished_at,
            duration,
            attempts: job.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::Persistence("disk".into()).is_retryable());
        assert!(!Error::NotFound("job".into()).is_retryable());
    }

    #[test]
    fn filters_reject_inverted_ranges_and_bad_limits() {
        let mut filters = SearchFilters {
            start_date: NaiveDate::from_ymd_opt(2025, 6, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            ..Default::default()
        };
        assert!(matches!(filters.validate(), Err(Error::Validation(_))));

        filters.end_date = NaiveDate::from_ymd_opt(2026, 1, 1);
        assert!(filters.validate().is_ok());

        filters.limit = Some(0);
        assert!(filters.validate().is_err());
        filters.limit = Some(MAX_RECORD_LIMIT + 1);
        assert!(filters.validate().is_err());
        filters.limit = Some(500);
        filters.min_amount = Some(10.0);
        filters.max_amount = Some(5.0);
        assert!(filters.validate().is_err());
        filters.max_amount = None;
        filters.keywords = vec!["  ".into()];
        assert!(filters.validate().is_err());
    }

    #[test]
    fn pipeline_steps_report_increasing_progress() {
        let steps = [
            PipelineStep::Searching,
            PipelineStep::Aggregating,
            PipelineStep::Enriching,
            PipelineStep::Analyzing,
            PipelineStep::Saving,
            PipelineStep::Complete,
        ];
        let percents: Vec<u8> = steps.iter().map(|s| s.percentage()).collect();
        assert_eq!(percents, vec![20, 40, 60, 80, 90, 100]);
        assert_eq!(PipelineStep::Searching.index(), 1);
        assert_eq!(PipelineStep::Complete.index(), PipelineStep::TOTAL);
        assert_eq!(PipelineStep::Enriching.progress("x").step, "enriching");
    }

    #[test]
    fn relationship_strength_is_ordered() {
        assert!(RelationshipStrength::New < RelationshipStrength::Emerging);
        assert!(RelationshipStrength::Emerging < RelationshipStrength::Established);
        assert!(RelationshipStrength::Established < RelationshipStrength::Strategic);
    }

    #[test]
    fn status_view_exposes_retry_safety_for_failed_jobs() {
        let mut job = Job::new_queued("job_1".into(), SearchFilters::default(), 3, ts());
        job.state = JobState::Failed;
        job.attempts = 3;
        job.started_at = Some(ts());
        job.finished_at = Some(ts() + chrono::Duration::seconds(2));
        job.failure = Some(JobFailure::from_error(&Error::Transient("upstream 503".into())));

        let view = JobStatusView::from(&job);
        assert_eq!(view.retryable, Some(true));
        assert_eq!(view.duration, Some(2000));
        assert_eq!(view.error.as_deref(), Some("transient error: upstream 503"));

        job.failure = Some(JobFailure::from_error(&Error::Validation("bad filters".into())));
        assert_eq!(JobStatusView::from(&job).retryable, Some(false));
    }

    #[test]
    fn status_view_serializes_camel_case_and_skips_absent_fields() {
        let job = Job::new_queued("job_2".into(), SearchFilters::default(), 3, ts());
        let value = serde_json::to_value(JobStatusView::from(&job)).unwrap();
        assert_eq!(value["jobId"], "job_2");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["progress"]["percentage"], 0);
        assert!(value.get("result").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn award_dates_parse_common_feed_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 1);
        assert_eq!(parse_award_date("2024-05-01"), expected);
        assert_eq!(parse_award_date("2024-05-01T00:00:00Z"), expected);
        assert_eq!(parse_award_date("2024-05-01 13:45:00"), expected);
        assert_eq!(parse_award_date("05/01/2024"), None);
        assert_eq!(parse_award_date(""), None);
        assert_eq!(parse_award_date("2024-13-45"), None);
    }

    #[test]
    fn raw_award_deserializes_with_missing_fields() {
        let award: RawAward = serde_json::from_str(
            r#"{"recipientName":"Acme Corp","awardAmount":1500.5,"naics":{"code":"541512"}}"#,
        )
        .unwrap();
        assert_eq!(award.recipient_name, "Acme Corp");
        assert_eq!(award.naics.code.as_deref(), Some("541512"));
        assert!(award.recipient_uei.is_none());
        assert_eq!(award.total_outlays, 0.0);
    }
}
