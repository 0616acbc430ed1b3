//! Presence endpoint.

use axum::{extract::State, response::Json, routing::get, Router};
use courier_core::Identity;
use std::sync::Arc;
use tracing::debug;

use crate::server::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/online", get(online_handler))
        .with_state(state)
}

/// GET /online
///
/// JSON array of every identity with at least one live connection.
async fn online_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Identity>> {
    let online: Vec<Identity> = state.coordinator.online_identities().into_iter().collect();
    debug!(count = online.len(), "Presence query");
    Json(online)
}
