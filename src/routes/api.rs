use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, session};
use crate::state::AppState;
use std::sync::Arc;

pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/start-session", post(session::start_session))
        .route("/session/{id}/status", get(session::session_status))
        .route("/session/{id}", delete(session::end_session))
        .route("/health", get(api::health_check))
        .layer(TraceLayer::new_for_http())
}
