use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SharedState;
use crate::error::{Error, FieldError};
use crate::model::{BuildJob, JobId, ProjectDependencies, ProjectFile};
use crate::orchestrator::BuildRequest;
use crate::queue::{JobRecord, QueueStats};

/// Default dead-letter page: entries `0..=49`.
const DEFAULT_PAGE_END: u64 = 49;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String, Vec<FieldError>),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    GatewayTimeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, fields) = match self {
            ApiError::BadRequest(msg, fields) => (StatusCode::BAD_REQUEST, msg, fields),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, Vec::new()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, Vec::new()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, Vec::new()),
            ApiError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg, Vec::new()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, Vec::new()),
        };
        let body = if fields.is_empty() {
            serde_json::json!({"error": message})
        } else {
            serde_json::json!({"error": message, "fields": fields})
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(fields) => ApiError::BadRequest("invalid request".to_string(), fields),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            e @ Error::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            e @ Error::ResourceUnavailable(_) => ApiError::Unavailable(e.to_string()),
            e @ Error::Timeout(_) => ApiError::GatewayTimeout(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text(), Vec::new())
    }
}

// ── Payload types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EstimateRequest {
    pub files: Vec<ProjectFile>,
    #[serde(default)]
    pub dependencies: Option<ProjectDependencies>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub build_id: JobId,
    pub cancelled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsResponse {
    pub builds: QueueStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhooks: Option<QueueStats>,
}

/// Operator view of a dead-lettered build, without its file payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for DeadLetterEntry {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            project_id: record.decode::<BuildJob>().ok().map(|job| job.project_id),
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            error: record.last_error,
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub old_id: JobId,
    pub new_id: JobId,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/builds", post(create_build))
        .route("/v1/builds/estimate", post(estimate_build))
        .route("/v1/builds/{id}", get(get_build))
        .route("/v1/builds/{id}/cancel", post(cancel_build))
        .route("/v1/queue/stats", get(queue_stats))
        .route(
            "/v1/queue/dead-letter",
            get(list_dead_letters).delete(clear_dead_letters),
        )
        .route("/v1/queue/dead-letter/{id}/retry", post(retry_dead_letter))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    state
        .orchestrator
        .queue()
        .stats()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

async fn create_build(
    State(state): State<SharedState>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let created = state.orchestrator.create_build(request).await?;
    Ok((StatusCode::ACCEPTED, Json(created)))
}

async fn estimate_build(
    State(state): State<SharedState>,
    payload: Result<Json<EstimateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let analysis = state
        .orchestrator
        .estimate(request.files, request.dependencies.as_ref());
    Ok(Json(analysis))
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: JobId = id.parse()?;
    let status = state.orchestrator.get_status(id).await?;
    Ok(Json(status))
}

async fn cancel_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: JobId = id.parse()?;
    if state.orchestrator.cancel(id).await? {
        Ok(Json(CancelResponse {
            build_id: id,
            cancelled: true,
        }))
    } else {
        Err(ApiError::Conflict(format!(
            "build {id} has already started or finished"
        )))
    }
}

async fn queue_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let builds = state.orchestrator.queue().stats().await?;
    let webhooks = match &state.notifier {
        Some(notifier) => Some(notifier.stats().await?),
        None => None,
    };
    Ok(Json(QueueStatsResponse { builds, webhooks }))
}

async fn list_dead_letters(
    State(state): State<SharedState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let start = page.start.unwrap_or(0);
    let end = page.end.unwrap_or(start + DEFAULT_PAGE_END);
    let entries: Vec<DeadLetterEntry> = state
        .orchestrator
        .queue()
        .dead_letters(start, end)
        .await?
        .into_iter()
        .map(DeadLetterEntry::from)
        .collect();
    Ok(Json(entries))
}

async fn retry_dead_letter(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let old_id: JobId = id.parse()?;
    let new_id = state.orchestrator.queue().requeue_dead(old_id).await?;
    Ok((StatusCode::ACCEPTED, Json(RequeueResponse { old_id, new_id })))
}

async fn clear_dead_letters(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let purged = state.orchestrator.queue().clear_dead().await?;
    Ok(Json(serde_json::json!({"purged": purged})))
}
