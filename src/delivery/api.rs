//! REST control surface for the research engine.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::ws::ws_handler;
use crate::engine::ResearchEngine;
use crate::error::{DatabaseError, Error, JobError};
use crate::jobs::model::{JobOptions, JobType};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ResearchEngine>,
}

/// Build the router with the REST and WebSocket routes.
pub fn api_routes(engine: Arc<ResearchEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(start_job))
        .route("/api/jobs/active", get(active_jobs))
        .route("/api/jobs/stuck", get(stuck_jobs))
        .route("/api/jobs/recover", post(recover_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/kill", post(kill_job))
        .route("/api/jobs/{id}/logs", get(job_logs))
        .route("/api/entities/{entity_id}/jobs", get(entity_jobs))
        .route("/ws/jobs/{id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Maps engine errors onto HTTP responses.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        Self(err.into())
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Job(JobError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Error::Job(JobError::ProcessNotFound { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "leadqual",
        "instance_id": state.engine.instance_id(),
        "active_jobs": state.engine.active_count().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub job_type: JobType,
    pub entity_id: String,
    #[serde(flatten)]
    pub options: JobOptions,
}

#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
}

async fn start_job(
    State(state): State<AppState>,
    Json(body): Json<StartJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.entity_id.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "entity_id must not be empty" })),
        )
            .into_response());
    }
    let job_id = state
        .engine
        .start_job(body.job_type, body.entity_id, body.options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })).into_response())
}

async fn kill_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.kill_job(id).await?;
    info!(job_id = %id, "Job killed via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn active_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.active_jobs().await)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .engine
        .get_job(id)
        .await?
        .ok_or(JobError::NotFound { id })?;
    Ok(Json(job))
}

/// `?after=N` on log and stream endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct AfterQuery {
    pub after: Option<i64>,
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AfterQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if state.engine.get_job(id).await?.is_none() {
        return Err(JobError::NotFound { id }.into());
    }
    Ok(Json(state.engine.job_logs(id, query.after).await?))
}

async fn entity_jobs(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.jobs_for_entity(&entity_id).await?))
}

async fn stuck_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.stuck_jobs().await?))
}

async fn recover_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let recovered = state.engine.recover_stuck_jobs().await?;
    Ok(Json(serde_json::json!({ "recovered": recovered })))
}
