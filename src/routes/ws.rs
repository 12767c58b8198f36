use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::ws;
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router
///
/// The `/ws/{id}` endpoint carries no credentials of its own: the session
/// id in the path is the capability. Ids are v4 UUIDs minted by
/// `POST /start-session`, unguessable in practice, and a session accepts
/// at most one live connection at a time. Deployments that need more
/// should terminate auth at a reverse proxy in front of this service.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/{id}", get(ws::ws_voice_handler))
        .layer(TraceLayer::new_for_http())
}
