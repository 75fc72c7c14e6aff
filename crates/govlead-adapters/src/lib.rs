//! Collaborator contracts (search, enrichment, persistence) and their
//! fixture-first and HTTP implementations.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govlead_core::{
    parse_award_date, ClassificationCode, CompanyInfo, Contact, ContactSource, EnrichedCompany,
    Error, Lead, Location, RawAward, Result, SearchFilters,
};
use govlead_storage::{cache_key, Cache, HttpClient, HttpClientConfig, ReportStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "govlead-adapters";

pub const DEFAULT_SEARCH_URL: &str = "https://api.usaspending.gov/api/v2/search/spending_by_award/";

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns every award matching `filters`. Errors must be classified:
    /// `Error::Transient` is retried by the job store, anything else is not.
    async fn search(&self, filters: &SearchFilters) -> Result<Vec<RawAward>>;
}

#[async_trait]
pub trait EnrichmentAdapter: Send + Sync {
    /// An empty map means "no data", not failure.
    async fn enrich(&self, company_names: &[String]) -> Result<HashMap<String, EnrichedCompany>>;
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn save_leads(&self, leads: &[Lead]) -> Result<()>;

    async fn record_search(
        &self,
        filters: &SearchFilters,
        raw_count: usize,
        company_count: usize,
    ) -> Result<()>;
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves awards from a JSON file, applying the filters locally.
#[derive(Debug, Clone)]
pub struct FixtureSearchProvider {
    awards: Vec<RawAward>,
}

impl FixtureSearchProvider {
    pub fn new(awards: Vec<RawAward>) -> Self {
        Self { awards }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }

    pub fn awards(&self) -> &[RawAward] {
        &self.awards
    }
}

#[async_trait]
impl SearchProvider for FixtureSearchProvider {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, filters: &SearchFilters) -> Result<Vec<RawAward>> {
        filters.validate()?;
        let limit = filters.limit.unwrap_or(usize::MAX);
        Ok(self
            .awards
            .iter()
            .filter(|award| matches_filters(award, filters))
            .take(limit)
            .cloned()
            .collect())
    }
}

pub fn matches_filters(award: &RawAward, filters: &SearchFilters) -> bool {
    if !filters.keywords.is_empty() {
        let haystack = [
            Some(award.recipient_name.as_str()),
            award.naics.description.as_deref(),
            award.psc.description.as_deref(),
            award.awarding_agency.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
        if !filters
            .keywords
            .iter()
            .any(|k| haystack.contains(&k.trim().to_ascii_lowercase()))
        {
            return false;
        }
    }

    if !filters.naics_codes.is_empty() && !code_matches(award.naics.code.as_deref(), &filters.naics_codes) {
        return false;
    }
    if !filters.psc_codes.is_empty() && !code_matches(award.psc.code.as_deref(), &filters.psc_codes) {
        return false;
    }

    if !filters.agencies.is_empty() {
        let name = award.awarding_agency.name.as_deref().unwrap_or_default();
        let code = award.awarding_agency.code.as_deref().unwrap_or_default();
        if !filters
            .agencies
            .iter()
            .any(|a| a.eq_ignore_ascii_case(name) || (!code.is_empty() && a == code))
        {
            return false;
        }
    }

    if !filters.states.is_empty() {
        let states = [
            award.performance_state.as_deref(),
            award.recipient_location.state.as_deref(),
        ];
        if !filters
            .states
            .iter()
            .any(|s| states.iter().flatten().any(|state| state.eq_ignore_ascii_case(s)))
        {
            return false;
        }
    }

    if !filters.set_aside_types.is_empty() {
        let set_aside = award
            .set_aside_type
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !filters
            .set_aside_types
            .iter()
            .any(|s| !set_aside.is_empty() && set_aside.contains(&s.to_ascii_lowercase()))
        {
            return false;
        }
    }

    if filters.start_date.is_some() || filters.end_date.is_some() {
        let Some(started) = award.start_date.as_deref().and_then(parse_award_date) else {
            return false;
        };
        if filters.start_date.is_some_and(|from| started < from)
            || filters.end_date.is_some_and(|to| started > to)
        {
            return false;
        }
    }

    if filters.min_amount.is_some_and(|min| award.award_amount < min)
        || filters.max_amount.is_some_and(|max| award.award_amount > max)
    {
        return false;
    }

    true
}

fn code_matches(code: Option<&str>, wanted: &[String]) -> bool {
    code.is_some_and(|code| wanted.iter().any(|w| code.starts_with(w.trim())))
}

const CONTRACT_AWARD_TYPES: [&str; 4] = ["A", "B", "C", "D"];

const AWARD_FIELDS: [&str; 22] = [
    "Award ID",
    "Recipient Name",
    "Recipient UEI",
    "recipient_id",
    "Recipient Location",
    "Award Amount",
    "Total Outlays",
    "Start Date",
    "End Date",
    "Awarding Agency",
    "Awarding Agency Code",
    "Funding Agency",
    "Funding Agency Code",
    "NAICS",
    "PSC",
    "Contract Award Type",
    "Type of Set Aside",
    "Extent Competed",
    "Place of Performance State Code",
    "def_codes",
    "COVID-19 Obligations",
    "Infrastructure Obligations",
];

/// Builds one page of a USAspending-style `spending_by_award` request.
pub fn build_search_body(filters: &SearchFilters, page: usize, limit: usize) -> JsonValue {
    let mut inner = serde_json::Map::new();
    inner.insert("award_type_codes".into(), json!(CONTRACT_AWARD_TYPES));
    if !filters.keywords.is_empty() {
        inner.insert("keywords".into(), json!(filters.keywords));
    }
    if filters.start_date.is_some() || filters.end_date.is_some() {
        let start = filters
            .start_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "2007-10-01".to_string());
        let end = filters
            .end_date
            .unwrap_or_else(|| Utc::now().date_naive())
            .to_string();
        inner.insert(
            "time_period".into(),
            json!([{ "start_date": start, "end_date": end }]),
        );
    }
    if !filters.naics_codes.is_empty() {
        inner.insert("naics_codes".into(), json!({ "require": filters.naics_codes }));
    }
    if !filters.psc_codes.is_empty() {
        inner.insert("psc_codes".into(), json!({ "require": filters.psc_codes }));
    }
    if !filters.agencies.is_empty() {
        let agencies = filters
            .agencies
            .iter()
            .map(|name| json!({ "type": "awarding", "tier": "toptier", "name": name }))
            .collect::<Vec<_>>();
        inner.insert("agencies".into(), JsonValue::Array(agencies));
    }
    if !filters.states.is_empty() {
        let locations = filters
            .states
            .iter()
            .map(|state| json!({ "country": "USA", "state": state.to_ascii_uppercase() }))
            .collect::<Vec<_>>();
        inner.insert(
            "place_of_performance_locations".into(),
            JsonValue::Array(locations),
        );
    }
    if !filters.set_aside_types.is_empty() {
        inner.insert("set_aside_type_codes".into(), json!(filters.set_aside_types));
    }
    if filters.min_amount.is_some() || filters.max_amount.is_some() {
        let mut bounds = serde_json::Map::new();
        if let Some(min) = filters.min_amount {
            bounds.insert("lower_bound".into(), json!(min));
        }
        if let Some(max) = filters.max_amount {
            bounds.insert("upper_bound".into(), json!(max));
        }
        inner.insert("award_amounts".into(), json!([bounds]));
    }

    json!({
        "filters": inner,
        "fields": AWARD_FIELDS,
        "page": page,
        "limit": limit,
        "sort": "Award Amount",
        "order": "desc",
        "subawards": false,
    })
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_at(value, path)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn classification(row: &JsonValue, key: &str) -> ClassificationCode {
    match row.get(key) {
        Some(JsonValue::Object(_)) => ClassificationCode {
            code: json_string(row, &[key, "code"]),
            description: json_string(row, &[key, "description"]),
        },
        Some(JsonValue::String(code)) if !code.trim().is_empty() => ClassificationCode {
            code: Some(code.trim().to_string()),
            description: None,
        },
        _ => ClassificationCode::default(),
    }
}

/// Maps one `spending_by_award` result row onto a [`RawAward`].
pub fn award_from_row(row: &JsonValue) -> RawAward {
    let amount = json_f64(row, &["Award Amount"]).unwrap_or(0.0);
    RawAward {
        award_id: json_string(row, &["Award ID"]),
        recipient_name: json_string(row, &["Recipient Name"]).unwrap_or_default(),
        recipient_uei: json_string(row, &["Recipient UEI"]),
        recipient_duns: json_string(row, &["recipient_id"]),
        recipient_location: Location {
            city: json_string(row, &["Recipient Location", "city_name"]),
            state: json_string(row, &["Recipient Location", "state_code"]),
            zip: json_string(row, &["Recipient Location", "zip5"]),
            country: json_string(row, &["Recipient Location", "location_country_code"]),
        },
        award_amount: amount,
        total_obligation: amount,
        total_outlays: json_f64(row, &["Total Outlays"]).unwrap_or(0.0),
        start_date: json_string(row, &["Start Date"]),
        end_date: json_string(row, &["End Date"]),
        awarding_agency: govlead_core::AgencyRef {
            name: json_string(row, &["Awarding Agency"]),
            code: json_string(row, &["Awarding Agency Code"]),
        },
        funding_agency: govlead_core::AgencyRef {
            name: json_string(row, &["Funding Agency"]),
            code: json_string(row, &["Funding Agency Code"]),
        },
        naics: classification(row, "NAICS"),
        psc: classification(row, "PSC"),
        contract_type: json_string(row, &["Contract Award Type"]),
        set_aside_type: json_string(row, &["Type of Set Aside"]),
        competition_extent: json_string(row, &["Extent Competed"]),
        performance_state: json_string(row, &["Place of Performance State Code"]),
        covid_obligations: json_f64(row, &["COVID-19 Obligations"]).unwrap_or(0.0),
        infrastructure_obligations: json_f64(row, &["Infrastructure Obligations"]).unwrap_or(0.0),
        disaster_emergency_fund_codes: json_string_vec(row, &["def_codes"]),
    }
}

#[derive(Debug, Clone)]
pub struct HttpSearchConfig {
    pub endpoint: String,
    pub page_size: usize,
    pub default_limit: usize,
    pub http: HttpClientConfig,
}

impl Default for HttpSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SEARCH_URL.to_string(),
            page_size: 100,
            default_limit: 1_000,
            http: HttpClientConfig::default(),
        }
    }
}

/// Pages through a remote award search endpoint.
#[derive(Debug)]
pub struct HttpSearchProvider {
    http: HttpClient,
    config: HttpSearchConfig,
}

impl HttpSearchProvider {
    pub fn new(config: HttpSearchConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(config.http.clone())?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    fn name(&self) -> &'static str {
        "usaspending"
    }

    async fn search(&self, filters: &SearchFilters) -> Result<Vec<RawAward>> {
        filters.validate()?;
        let limit = filters.limit.unwrap_or(self.config.default_limit);
        // Constant page size keeps the server-side page offsets aligned.
        let page_size = self.config.page_size.clamp(1, limit.max(1));
        let mut awards = Vec::new();
        let mut page = 1;

        async {
            loop {
                let body = build_search_body(filters, page, page_size);
                let resp = self.http.post_json(&self.config.endpoint, &body).await?;
                let rows = resp
                    .get("results")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| Error::Transient("search response has no results array".into()))?;
                awards.extend(rows.iter().map(award_from_row));

                let has_next = json_at(&resp, &["page_metadata", "hasNext"])
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                debug!(page, rows = rows.len(), has_next, "fetched search page");
                if !has_next || rows.is_empty() || awards.len() >= limit {
                    break;
                }
                page += 1;
            }
            Ok::<(), Error>(())
        }
        .instrument(info_span!("award_search", provider = self.name(), limit))
        .await?;

        awards.truncate(limit);
        Ok(awards)
    }
}

/// Memoises another provider's results keyed by the filter payload hash.
pub struct CachedSearchProvider {
    inner: Arc<dyn SearchProvider>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl CachedSearchProvider {
    pub fn new(inner: Arc<dyn SearchProvider>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait]
impl SearchProvider for CachedSearchProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn search(&self, filters: &SearchFilters) -> Result<Vec<RawAward>> {
        let key = cache_key(&format!("search:{}", self.inner.name()), filters)?;
        if let Some(hit) = self.cache.get(&key).await {
            match serde_json::from_value::<Vec<RawAward>>(hit) {
                Ok(awards) => {
                    debug!(%key, records = awards.len(), "search cache hit");
                    return Ok(awards);
                }
                Err(err) => warn!(%key, error = %err, "discarding undecodable cache entry"),
            }
        }

        let awards = self.inner.search(filters).await?;
        match serde_json::to_value(&awards) {
            Ok(value) => self.cache.set(&key, value, self.ttl).await,
            Err(err) => warn!(%key, error = %err, "search results not cacheable"),
        }
        Ok(awards)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

#[async_trait]
impl EnrichmentAdapter for NoEnrichment {
    async fn enrich(&self, _company_names: &[String]) -> Result<HashMap<String, EnrichedCompany>> {
        Ok(HashMap::new())
    }
}

/// Table-driven enrichment keyed by case-insensitive company name.
#[derive(Debug, Default, Clone)]
pub struct StaticEnrichment {
    companies: HashMap<String, EnrichedCompany>,
}

impl StaticEnrichment {
    pub fn new(companies: HashMap<String, EnrichedCompany>) -> Self {
        Self {
            companies: companies
                .into_iter()
                .map(|(name, company)| (name.to_lowercase(), company))
                .collect(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }
}

#[async_trait]
impl EnrichmentAdapter for StaticEnrichment {
    async fn enrich(&self, company_names: &[String]) -> Result<HashMap<String, EnrichedCompany>> {
        Ok(company_names
            .iter()
            .filter_map(|name| {
                self.companies
                    .get(&name.to_lowercase())
                    .map(|company| (name.clone(), company.clone()))
            })
            .collect())
    }
}

const FIRST_NAMES: [&str; 10] = [
    "Avery", "Jordan", "Morgan", "Taylor", "Casey", "Riley", "Quinn", "Reese", "Parker", "Emerson",
];

const LAST_NAMES: [&str; 10] = [
    "Whitaker", "Delgado", "Okafor", "Lindqvist", "Brennan", "Nakamura", "Castillo", "Hargrove",
    "Patel", "Sullivan",
];

const SYNTHETIC_TITLES: [&str; 3] = [
    "Chief Executive Officer",
    "VP of Business Development",
    "Contracts Manager",
];

const LEGAL_SUFFIXES: [&str; 8] = ["inc", "llc", "corp", "corporation", "co", "ltd", "company", "lp"];

/// Email domain guess: the name's alphanumeric words minus legal suffixes.
pub fn company_domain(company_name: &str) -> String {
    let lowered = company_name.to_ascii_lowercase();
    let slug = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty() && !LEGAL_SUFFIXES.contains(word))
        .collect::<String>();
    if slug.is_empty() {
        "example.com".to_string()
    } else {
        format!("{slug}.com")
    }
}

/// Deterministic placeholder contacts for a company without enrichment data.
pub fn synthetic_enrichment(company_name: &str) -> EnrichedCompany {
    let seed = Uuid::new_v5(&Uuid::NAMESPACE_OID, company_name.as_bytes());
    let bytes = seed.as_bytes();
    let domain = company_domain(company_name);

    let contacts = SYNTHETIC_TITLES
        .iter()
        .enumerate()
        .map(|(i, title)| {
            let first = FIRST_NAMES[bytes[i * 2] as usize % FIRST_NAMES.len()];
            let last = LAST_NAMES[bytes[i * 2 + 1] as usize % LAST_NAMES.len()];
            let line = u16::from_be_bytes([bytes[8 + i], bytes[11 + i]]) % 10_000;
            Contact {
                name: format!("{first} {last}"),
                title: (*title).to_string(),
                email: Some(format!(
                    "{}.{}@{domain}",
                    first.to_ascii_lowercase(),
                    last.to_ascii_lowercase()
                )),
                phone: Some(format!("(555) 01{i}-{line:04}")),
                linkedin_url: None,
                source: ContactSource::Synthetic,
                is_decision_maker: false,
            }
        })
        .collect();

    EnrichedCompany {
        contacts,
        company_info: Some(CompanyInfo {
            website: Some(format!("https://www.{domain}")),
            domain: Some(domain),
            industry: None,
            employee_count: None,
            description: Some(format!(
                "{company_name} profile assembled from federal award history"
            )),
        }),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceAdapter for NoopPersistence {
    async fn save_leads(&self, _leads: &[Lead]) -> Result<()> {
        Ok(())
    }

    async fn record_search(
        &self,
        _filters: &SearchFilters,
        _raw_count: usize,
        _company_count: usize,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub recorded_at: DateTime<Utc>,
    pub filters: SearchFilters,
    pub raw_count: usize,
    pub company_count: usize,
}

/// Writes leads and search history as immutable JSON reports.
#[derive(Debug, Clone)]
pub struct ReportPersistence {
    store: ReportStore,
}

impl ReportPersistence {
    pub fn new(store: ReportStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PersistenceAdapter for ReportPersistence {
    async fn save_leads(&self, leads: &[Lead]) -> Result<()> {
        let stored = self
            .store
            .store_json(Utc::now(), "leads", &leads)
            .await
            .map_err(|err| Error::Persistence(format!("{err:#}")))?;
        debug!(path = %stored.relative_path.display(), leads = leads.len(), "leads report written");
        Ok(())
    }

    async fn record_search(
        &self,
        filters: &SearchFilters,
        raw_count: usize,
        company_count: usize,
    ) -> Result<()> {
        let record = SearchRecord {
            recorded_at: Utc::now(),
            filters: filters.clone(),
            raw_count,
            company_count,
        };
        self.store
            .store_json(record.recorded_at, "searches", &record)
            .await
            .map_err(|err| Error::Persistence(format!("{err:#}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use govlead_storage::MemoryCache;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_provider() -> FixtureSearchProvider {
        FixtureSearchProvider::from_path(workspace_root().join("fixtures/awards/sample.json"))
            .expect("sample fixture")
    }

    async fn count_matching(filters: SearchFilters) -> usize {
        sample_provider().search(&filters).await.unwrap().len()
    }

    #[tokio::test]
    async fn fixture_provider_applies_filters_locally() {
        assert_eq!(count_matching(SearchFilters::default()).await, 9);
        assert_eq!(
            count_matching(SearchFilters {
                states: vec!["md".into()],
                ..Default::default()
            })
            .await,
            3
        );
        assert_eq!(
            count_matching(SearchFilters {
                naics_codes: vec!["5415".into()],
                ..Default::default()
            })
            .await,
            4
        );
        assert_eq!(
            count_matching(SearchFilters {
                min_amount: Some(5_000_000.0),
                ..Default::default()
            })
            .await,
            3
        );
        assert_eq!(
            count_matching(SearchFilters {
                keywords: vec!["Logistics".into()],
                ..Default::default()
            })
            .await,
            2
        );
        assert_eq!(
            count_matching(SearchFilters {
                start_date: NaiveDate::from_ymd_opt(2022, 1, 1),
                end_date: NaiveDate::from_ymd_opt(2023, 12, 31),
                ..Default::default()
            })
            .await,
            3
        );
        assert_eq!(
            count_matching(SearchFilters {
                limit: Some(2),
                ..Default::default()
            })
            .await,
            2
        );
    }

    #[tokio::test]
    async fn fixture_provider_rejects_invalid_filters() {
        let err = sample_provider()
            .search(&SearchFilters {
                min_amount: Some(10.0),
                max_amount: Some(1.0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn search_body_carries_filters() {
        let filters = SearchFilters {
            keywords: vec!["cyber".into()],
            naics_codes: vec!["541512".into()],
            states: vec!["va".into()],
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31),
            min_amount: Some(1_000.0),
            ..Default::default()
        };
        let body = build_search_body(&filters, 2, 50);
        assert_eq!(body["page"], 2);
        assert_eq!(body["limit"], 50);
        assert_eq!(body["filters"]["keywords"][0], "cyber");
        assert_eq!(body["filters"]["naics_codes"]["require"][0], "541512");
        assert_eq!(body["filters"]["place_of_performance_locations"][0]["state"], "VA");
        assert_eq!(body["filters"]["time_period"][0]["start_date"], "2020-01-01");
        assert_eq!(body["filters"]["award_amounts"][0]["lower_bound"], 1_000.0);
        assert!(body["filters"]["award_amounts"][0].get("upper_bound").is_none());
        assert!(body["filters"].get("psc_codes").is_none());

        let fields = body["fields"].as_array().unwrap();
        for wanted in ["COVID-19 Obligations", "Infrastructure Obligations", "def_codes"] {
            assert!(fields.iter().any(|f| f == wanted), "missing field {wanted}");
        }
    }

    #[test]
    fn result_rows_map_to_raw_awards() {
        let row = json!({
            "Award ID": "W91-1",
            "Recipient Name": "Acme Federal Solutions, LLC",
            "Recipient UEI": "ACME11111111",
            "Recipient Location": {"city_name": "Reston", "state_code": "VA"},
            "Award Amount": 1250000.5,
            "Total Outlays": "1000",
            "Start Date": "2021-01-04",
            "Awarding Agency": "Department of Defense",
            "NAICS": {"code": "541512", "description": "COMPUTER SYSTEMS DESIGN SERVICES"},
            "PSC": "D399",
            "Place of Performance State Code": "VA",
            "def_codes": ["L", "M"]
        });
        let award = award_from_row(&row);
        assert_eq!(award.recipient_uei.as_deref(), Some("ACME11111111"));
        assert_eq!(award.recipient_location.state.as_deref(), Some("VA"));
        assert_eq!(award.award_amount, 1_250_000.5);
        assert_eq!(award.total_outlays, 1_000.0);
        assert_eq!(award.naics.code.as_deref(), Some("541512"));
        assert_eq!(award.psc.code.as_deref(), Some("D399"));
        assert!(award.psc.description.is_none());
        assert_eq!(award.disaster_emergency_fund_codes, vec!["L", "M"]);
        assert!(award.end_date.is_none());
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn search(&self, _filters: &SearchFilters) -> Result<Vec<RawAward>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawAward {
                recipient_name: "Acme".into(),
                award_amount: 10.0,
                ..Default::default()
            }])
        }
    }

    #[tokio::test]
    async fn cached_provider_memoises_by_filter_payload() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedSearchProvider::new(
            inner.clone(),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
        );
        let filters = SearchFilters {
            keywords: vec!["cyber".into()],
            ..Default::default()
        };

        let first = cached.search(&filters).await.unwrap();
        let second = cached.search(&filters.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.search(&SearchFilters::default()).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn synthetic_contacts_are_deterministic_and_structured() {
        let a = synthetic_enrichment("Acme Federal Solutions, LLC");
        let b = synthetic_enrichment("Acme Federal Solutions, LLC");
        let c = synthetic_enrichment("Beacon Health Analytics Inc.");
        assert_eq!(a, b);
        assert_ne!(a.contacts, c.contacts);
        assert_eq!(a.contacts.len(), SYNTHETIC_TITLES.len());
        for contact in &a.contacts {
            assert_eq!(contact.source, ContactSource::Synthetic);
            assert!(contact
                .email
                .as_deref()
                .unwrap()
                .ends_with("@acmefederalsolutions.com"));
        }
        let info = a.company_info.unwrap();
        assert_eq!(info.domain.as_deref(), Some("acmefederalsolutions.com"));
    }

    #[test]
    fn company_domain_strips_legal_suffixes() {
        assert_eq!(company_domain("Cobalt Logistics LLC"), "cobaltlogistics.com");
        assert_eq!(company_domain("Beacon Health Analytics Inc."), "beaconhealthanalytics.com");
        assert_eq!(company_domain("  , Inc."), "example.com");
    }

    #[tokio::test]
    async fn static_enrichment_matches_names_case_insensitively() {
        let mut table = HashMap::new();
        table.insert(
            "ACME FEDERAL SOLUTIONS, LLC".to_string(),
            EnrichedCompany {
                contacts: vec![],
                company_info: Some(CompanyInfo {
                    employee_count: Some(120),
                    ..Default::default()
                }),
            },
        );
        let enrichment = StaticEnrichment::new(table);
        let names = vec![
            "Acme Federal Solutions, LLC".to_string(),
            "Unknown Co".to_string(),
        ];
        let found = enrichment.enrich(&names).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("Acme Federal Solutions, LLC"));
        assert!(NoEnrichment.enrich(&names).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_persistence_writes_leads_and_searches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = ReportPersistence::new(ReportStore::new(dir.path()));
        persistence.save_leads(&[]).await.unwrap();
        persistence
            .record_search(&SearchFilters::default(), 9, 4)
            .await
            .unwrap();

        let stamp = Utc::now().format("%Y%m%d").to_string();
        let searches = dir.path().join(&stamp).join("searches");
        let entries = fs::read_dir(&searches).unwrap().count();
        assert_eq!(entries, 1);
        assert!(dir.path().join(&stamp).join("leads").exists());
    }
}
