use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::state::AppState;

/// Health check handler
/// Returns a simple JSON response indicating the server is running,
/// plus the number of live session records
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "OK",
        "active_sessions": state.registry.active_sessions()
    })))
}
