//! Ingestion control API handlers
//!
//! POST /ingest/sync, /ingest/enqueue, /ingest/cancel, /ingest/pause,
//! /ingest/resume; GET /ingest/progress

use crate::error::ApiResult;
use crate::ingest::{Priority, ProgressReport, SyncReport};
use crate::AppState;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// POST /ingest/enqueue request
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Explicit items; omitted = everything that needs analysis
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub priority: Priority,
}

/// POST /ingest/enqueue response
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub enqueued: usize,
}

/// POST /ingest/cancel request
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub ids: Vec<Uuid>,
}

/// POST /ingest/cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: usize,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub paused: bool,
}

pub fn ingest_routes() -> Router<AppState> {
    Router::new()
        .route("/ingest/sync", post(sync))
        .route("/ingest/enqueue", post(enqueue))
        .route("/ingest/cancel", post(cancel))
        .route("/ingest/pause", post(pause))
        .route("/ingest/resume", post(resume))
        .route("/ingest/progress", get(progress))
}

/// POST /ingest/sync - reconcile the index against the asset source
pub async fn sync(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    let report = state.coordinator.sync().await?;
    Ok(Json(report))
}

/// POST /ingest/enqueue - push eligible items into the analysis queue
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<Json<EnqueueResponse>> {
    let enqueued = state.coordinator.enqueue(request.ids, request.priority);
    Ok(Json(EnqueueResponse { enqueued }))
}

/// POST /ingest/cancel - cancel pending and in-flight analysis
pub async fn cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.coordinator.cancel(&request.ids);
    Ok(Json(CancelResponse { cancelled }))
}

/// POST /ingest/pause - stop handing out work
pub async fn pause(State(state): State<AppState>) -> Json<PauseResponse> {
    state.coordinator.pause();
    Json(PauseResponse { paused: true })
}

/// POST /ingest/resume
pub async fn resume(State(state): State<AppState>) -> Json<PauseResponse> {
    state.coordinator.resume();
    Json(PauseResponse { paused: false })
}

/// GET /ingest/progress - processed/total for the current batch
pub async fn progress(State(state): State<AppState>) -> Json<ProgressReport> {
    Json(state.scheduler.progress_report())
}
