//! Session lifecycle REST handlers
//!
//! Sessions are created over plain HTTP before any audio flows: the
//! knowledge directory is scanned eagerly here so the context prefix is
//! ready by the time the client opens its WebSocket.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::knowledge::KnowledgeExtractor;
use crate::core::registry::{EndOutcome, SessionId, SessionState, SessionStatus};
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Response for `POST /start-session`
///
/// # Example
/// ```json
/// {
///   "session_id": "0c7e9f9a-3a24-4be2-9f7d-b19a44c53d4a",
///   "state": "created",
///   "documents": 3,
///   "failed_documents": ["notes"]
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Number of knowledge documents loaded into the session context
    pub documents: usize,
    /// Ids of documents that could not be loaded
    pub failed_documents: Vec<String>,
}

/// Response for `DELETE /session/{id}`
#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub session_id: SessionId,
    pub state: SessionState,
    /// True when the session was already gone; the delete is still a success
    pub already_closed: bool,
}

/// Handler for POST /start-session
///
/// Scans the knowledge directory, allocates a session in `created` state,
/// and returns its id. The client attaches audio via `GET /ws/{id}`.
///
/// # Errors
/// * 429 Too Many Requests - session limit reached
/// * 500 Internal Server Error - knowledge directory exists but is unreadable
pub async fn start_session(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<StartSessionResponse>> {
    let outcome = state
        .extractor
        .extract(&state.config.knowledge_dir)
        .await
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    if outcome.is_partial() {
        warn!(
            failed = outcome.failed.len(),
            "Some knowledge documents could not be loaded"
        );
    }

    let documents = outcome.documents.len();
    let failed_documents: Vec<String> = outcome
        .failed
        .iter()
        .map(|f| f.document_id.clone())
        .collect();

    let session = state.registry.create_session(outcome)?;
    info!(session_id = %session.id, documents, "Start-session request accepted");

    Ok(Json(StartSessionResponse {
        session_id: session.id,
        state: session.state(),
        documents,
        failed_documents,
    }))
}

/// Handler for GET /session/{id}/status
///
/// # Errors
/// * 404 Not Found - unknown or already torn down session id
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SessionStatus>> {
    let status = state.registry.status(SessionId::from(id))?;
    Ok(Json(status))
}

/// Handler for DELETE /session/{id}
///
/// Signals the session's bridge to drain and close, then releases the id.
/// Deleting an unknown or already closed session is a 200 no-op.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<EndSessionResponse>> {
    let id = SessionId::from(id);
    let outcome = state.registry.end_session(id).await;

    Ok(Json(EndSessionResponse {
        session_id: id,
        state: SessionState::Closed,
        already_closed: outcome == EndOutcome::AlreadyClosed,
    }))
}
