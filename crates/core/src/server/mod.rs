//! HTTP admin surface over the scheduler: submit, inspect and delete missions, and tune
//! the scheduler's concurrency and batching at runtime.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

mod jobs;

pub use jobs::{CreateJobRequest, CreateJobResponse, JobDetail, JobSummary, ListJobsQuery};

use crate::preset::PresetCatalog;
use crate::progress::ProgressStore;
use crate::scheduler::{Scheduler, SchedulerStatus};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: Scheduler,
    store: Arc<ProgressStore>,
    presets: PresetCatalog,
    missions_dir: PathBuf,
}

impl AppState {
    /// Missions submitted over HTTP live under `missions_dir/<owner>/<mission>`.
    pub fn new(scheduler: Scheduler, missions_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store: Arc::clone(scheduler.store()),
                presets: scheduler.settings().presets.clone(),
                scheduler,
                missions_dir: missions_dir.into(),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub thread_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ConcurrencyResponse {
    pub thread_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/scheduler", get(scheduler_status))
        .route("/api/scheduler/concurrency", put(set_concurrency))
        .route("/api/scheduler/batch-mode", put(set_batch_mode))
        .route("/api/scheduler/force-batch-mode", put(set_force_batch_mode))
        .route("/api/presets", get(list_presets))
        .route("/api/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route(
            "/api/jobs/{owner}/{mission}",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.inner.scheduler.status())
}

async fn set_concurrency(
    State(state): State<AppState>,
    Json(payload): Json<ConcurrencyRequest>,
) -> Result<Json<ConcurrencyResponse>, AppError> {
    let thread_count = state.inner.scheduler.set_concurrency(payload.thread_count)?;
    Ok(Json(ConcurrencyResponse { thread_count }))
}

async fn set_batch_mode(
    State(state): State<AppState>,
    Json(payload): Json<ToggleRequest>,
) -> Json<SchedulerStatus> {
    state.inner.scheduler.set_batch_mode(payload.enabled);
    Json(state.inner.scheduler.status())
}

async fn set_force_batch_mode(
    State(state): State<AppState>,
    Json(payload): Json<ToggleRequest>,
) -> Json<SchedulerStatus> {
    state.inner.scheduler.set_force_batch_mode(payload.enabled);
    Json(state.inner.scheduler.status())
}

async fn list_presets(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.inner.presets.list()?))
}
