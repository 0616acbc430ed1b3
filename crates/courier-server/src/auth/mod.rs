//! Bearer credential verification.
//!
//! A credential is taken from `Authorization: Bearer <token>` or, failing
//! that, from the `token` query parameter (browsers cannot set headers on a
//! WebSocket handshake). Verified identities are placed in the request
//! extensions by [`require_identity`].

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::server::AppState;

mod token;

pub use token::TokenAuthority;

/// Authentication failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    Missing,

    #[error("Invalid token")]
    Invalid,

    /// The token verified but carries no identity
    #[error("Invalid token payload")]
    InvalidPayload,

    #[error("Token signing failed: {0}")]
    Signing(String),
}

/// JSON error body: `{"error": "..."}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::Missing | AuthError::Invalid | AuthError::InvalidPayload => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

/// Credential from the `Authorization` header, if it carries a bearer token.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Credential from the `token` query parameter. The first occurrence wins.
fn query_token(uri: &Uri) -> Option<String> {
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri).ok()?;
    pairs
        .into_iter()
        .find(|(key, _)| key == "token")
        .map(|(_, token)| token)
        .filter(|token| !token.is_empty())
}

/// Locate the bearer credential. The header takes precedence over the query.
pub fn extract_credential(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
    bearer_token(headers)
        .or_else(|| query_token(uri))
        .ok_or(AuthError::Missing)
}

/// Middleware that rejects unauthenticated requests and stores the caller's
/// [`courier_core::Identity`] in the request extensions.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let credential = extract_credential(request.headers(), request.uri())
        .and_then(|token| state.tokens.verify(&token));

    match credential {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            Ok(next.run(request).await)
        }
        Err(err) => {
            match &err {
                AuthError::Signing(_) => error!(error = %err, "Authentication failed"),
                _ => warn!(path = %request.uri().path(), error = %err, "Rejected request"),
            }
            Err(err)
        }
    }
}
