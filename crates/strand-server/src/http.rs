//! Route table and handlers over the orchestrator facade.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use strand_contract::storage::{HistoryPage, HistoryQuery, ThreadListPage, ThreadListQuery};
use strand_contract::{Decision, StateSummary, ThreadStatus};

use crate::service::{ApiError, AppState};

/// Health endpoint path.
pub const HEALTH_PATH: &str = "/health";
/// Thread list endpoint path.
pub const THREADS_PATH: &str = "/v1/threads";
/// Event submission endpoint path.
pub const THREAD_EVENTS_PATH: &str = "/v1/threads/{id}/events";
/// Status endpoint path.
pub const THREAD_STATUS_PATH: &str = "/v1/threads/{id}/status";
/// History endpoint path.
pub const THREAD_HISTORY_PATH: &str = "/v1/threads/{id}/history";
/// Resume endpoint path.
pub const THREAD_RESUME_PATH: &str = "/v1/threads/{id}/resume";
/// Decision endpoint path.
pub const THREAD_DECISION_PATH: &str = "/v1/threads/{id}/checkpoints/{checkpoint_id}/decision";
/// Time-travel fork endpoint path.
pub const THREAD_TRAVEL_PATH: &str = "/v1/threads/{id}/travel";

/// Assemble the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(THREADS_PATH, get(list_threads))
        .route(THREAD_EVENTS_PATH, post(submit_event))
        .route(THREAD_STATUS_PATH, get(get_status))
        .route(THREAD_HISTORY_PATH, get(get_history))
        .route(THREAD_RESUME_PATH, post(resume))
        .route(THREAD_DECISION_PATH, post(decide))
        .route(THREAD_TRAVEL_PATH, post(travel))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct ThreadListParams {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    parent_thread_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn list_threads(
    State(st): State<AppState>,
    Query(params): Query<ThreadListParams>,
) -> Result<Json<ThreadListPage>, ApiError> {
    let query = ThreadListQuery {
        offset: params.offset,
        limit: params.limit.clamp(1, 200),
        parent_thread_id: params.parent_thread_id,
    };
    Ok(Json(st.orchestrator.list_threads(&query).await?))
}

async fn submit_event(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<Value>,
) -> Result<Json<StateSummary>, ApiError> {
    Ok(Json(st.orchestrator.submit_event(&id, input).await?))
}

async fn get_status(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThreadStatus>, ApiError> {
    Ok(Json(st.orchestrator.get_status(&id).await?))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default)]
    before: Option<u64>,
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn get_history(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, ApiError> {
    let query = HistoryQuery {
        before: params.before,
        limit: params.limit.clamp(1, 200),
    };
    Ok(Json(st.orchestrator.history(&id, &query).await?))
}

async fn resume(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateSummary>, ApiError> {
    Ok(Json(st.orchestrator.resume(&id).await?))
}

async fn decide(
    State(st): State<AppState>,
    Path((id, checkpoint_id)): Path<(String, String)>,
    Json(decision): Json<Decision>,
) -> Result<Json<StateSummary>, ApiError> {
    Ok(Json(
        st.orchestrator.decide(&id, &checkpoint_id, decision).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct TravelBody {
    checkpoint_id: String,
}

async fn travel(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TravelBody>,
) -> Result<Json<StateSummary>, ApiError> {
    Ok(Json(st.orchestrator.travel(&id, &body.checkpoint_id).await?))
}
