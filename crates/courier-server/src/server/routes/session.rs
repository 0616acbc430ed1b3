//! Anonymous sign-in and self-identity.

use axum::{
    extract::State,
    middleware,
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use courier_core::Identity;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::auth::{require_identity, AuthError};
use crate::server::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/me", get(me_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ));

    Router::new()
        .route("/signin/anonymous", post(signin_anonymous_handler))
        .merge(authenticated)
        .with_state(state)
}

// === Response Types ===

/// Response for GET /me
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub connection_id: Identity,
}

/// Response for POST /signin/anonymous
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninResponse {
    pub token: String,
    pub connection_id: Identity,
}

// === Handlers ===

/// GET /me
///
/// The identity the caller's token binds.
async fn me_handler(Extension(identity): Extension<Identity>) -> Json<MeResponse> {
    Json(MeResponse {
        connection_id: identity,
    })
}

/// POST /signin/anonymous
///
/// Mint a fresh identity and a token for it.
#[instrument(skip(state))]
async fn signin_anonymous_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SigninResponse>, AuthError> {
    let issued = state.tokens.issue(Identity::generate())?;
    info!(
        identity = %issued.connection_id,
        expires_at = %issued.expires_at,
        "Anonymous sign-in"
    );

    Ok(Json(SigninResponse {
        token: issued.token,
        connection_id: issued.connection_id,
    }))
}
