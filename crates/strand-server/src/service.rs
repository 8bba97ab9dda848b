//! Shared handler state and the API error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use strand_contract::storage::StoreError;
use strand_orchestrator::{Orchestrator, OrchestratorError};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator serving all threads.
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Wrap an orchestrator for use as router state.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

/// API failure mapped onto an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    /// Unknown thread or checkpoint.
    NotFound(String),
    /// The request lost a race or targeted a settled step; retry against
    /// current state.
    Conflict(String),
    /// The request itself is invalid.
    BadRequest(String),
    /// Anything else.
    Internal(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Store(StoreError::ThreadNotFound(_))
            | OrchestratorError::Store(StoreError::CheckpointNotFound { .. }) => {
                ApiError::NotFound(err.to_string())
            }
            OrchestratorError::Store(StoreError::ParentConflict { .. })
            | OrchestratorError::StaleDecision { .. }
            | OrchestratorError::NotPending { .. }
            | OrchestratorError::TerminalStage { .. } => ApiError::Conflict(err.to_string()),
            OrchestratorError::Store(StoreError::InvalidId(_))
            | OrchestratorError::Channel(_)
            | OrchestratorError::Registry(_) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::BadRequest(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
