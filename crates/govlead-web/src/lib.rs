//! Axum HTTP surface for submitting, polling and cancelling lead-search jobs.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use govlead_core::{Error, JobState, JobStatusView, SearchFilters};
use govlead_storage::{JobStore, StoreCounts};
use govlead_worker::{AppConfig, LeadWorker};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "govlead-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
}

impl AppState {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub time: DateTime<Utc>,
    pub jobs: StoreCounts,
}

/// Error body returned for every non-2xx response.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Persistence(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job_handler))
        .route("/jobs/{id}", get(job_status_handler))
        .route("/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Runs the worker pool and the HTTP listener until ctrl-c, then drains.
pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let worker_config = config.worker_config();
    let store = Arc::new(JobStore::new(worker_config.job_store_config()));
    let collaborators = config.collaborators()?;
    let worker = LeadWorker::new(store.clone(), collaborators, worker_config).start();

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "govlead http listening");

    axum::serve(listener, app(AppState::new(store)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    worker.shutdown().await
}

async fn submit_job_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SearchFilters>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(filters) =
        payload.map_err(|rejection| Error::Validation(rejection.body_text()))?;
    let job_id = state.store.enqueue(filters).await?;
    debug!(%job_id, "job submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobState::Queued,
        }),
    ))
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    let job = state.store.get(&id).await?;
    Ok(Json(JobStatusView::from(job.as_ref())))
}

async fn cancel_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    let success = state.store.cancel(&id).await;
    Json(CancelResponse { success })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        time: Utc::now(),
        jobs: state.store.counts().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use govlead_adapters::{FixtureSearchProvider, NoEnrichment, NoopPersistence, SearchProvider};
    use govlead_core::RawAward;
    use govlead_worker::{Collaborators, WorkerConfig};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<JobStore>) {
        let store = Arc::new(JobStore::default());
        (app(AppState::new(store.clone())), store)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, JsonValue) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null))
    }

    #[tokio::test]
    async fn submit_returns_queued_job_id() {
        let (app, store) = test_app();
        let (status, body) = send(&app, "POST", "/jobs", Some(r#"{"states":["VA"]}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        let job_id = body["jobId"].as_str().unwrap();
        assert!(job_id.starts_with("job_"));
        assert_eq!(store.get(job_id).await.unwrap().payload.states, vec!["VA"]);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_filters() {
        let (app, _) = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/jobs",
            Some(r#"{"minAmount":100,"maxAmount":1}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let (status, _) = send(&app, "POST", "/jobs", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_progress_and_unknown_ids() {
        let (app, store) = test_app();
        let id = store.enqueue(SearchFilters::default()).await.unwrap();

        let (status, body) = send(&app, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobId"], id.as_str());
        assert_eq!(body["status"], "queued");
        assert_eq!(body["progress"]["percentage"], 0);
        assert_eq!(body["progress"]["total"], 6);
        assert_eq!(body["attempts"], 0);
        assert!(body.get("result").is_none());

        let (status, body) = send(&app, "GET", "/jobs/job_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn cancel_removes_queued_job() {
        let (app, store) = test_app();
        let id = store.enqueue(SearchFilters::default()).await.unwrap();

        let (status, body) = send(&app, "POST", &format!("/jobs/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = send(&app, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&app, "POST", &format!("/jobs/{id}/cancel"), None).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn health_reports_job_counts() {
        let (app, store) = test_app();
        store.enqueue(SearchFilters::default()).await.unwrap();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["jobs"]["queued"], 1);
    }

    #[tokio::test]
    async fn submitted_job_completes_through_the_worker() {
        let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
        let store = Arc::new(JobStore::new(config.job_store_config()));
        let awards = vec![RawAward {
            recipient_name: "Acme".into(),
            recipient_uei: Some("A1".into()),
            award_amount: 12_000_000.0,
            ..Default::default()
        }];
        let search: Arc<dyn SearchProvider> = Arc::new(FixtureSearchProvider::new(awards));
        let worker = LeadWorker::new(
            store.clone(),
            Collaborators {
                search,
                enrichment: Arc::new(NoEnrichment),
                persistence: Arc::new(NoopPersistence),
            },
            config,
        )
        .start();
        let app = app(AppState::new(store));

        let (_, body) = send(&app, "POST", "/jobs", Some("{}")).await;
        let uri = format!("/jobs/{}", body["jobId"].as_str().unwrap());

        let mut last_percentage = 0;
        let body = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let (_, body) = send(&app, "GET", &uri, None).await;
                let percentage = body["progress"]["percentage"].as_u64().unwrap();
                assert!(percentage >= last_percentage);
                last_percentage = percentage;
                if body["status"] == "completed" {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job completed");

        assert_eq!(body["progress"]["percentage"], 100);
        assert_eq!(body["result"]["totalContracts"], 1);
        assert_eq!(body["result"]["leads"][0]["company"]["name"], "Acme");
        assert!(body["duration"].is_number());
        assert!(body.get("error").is_none());

        worker.shutdown().await.unwrap();
    }
}
