//! # Authentication
//!
//! Operator bearer authentication for the protected API routes. Tokens are
//! compared in constant time against the configured operator tokens.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized};
use crate::server::AppState;

/// Marker type for authenticated operator requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Rejects requests without a valid operator bearer token.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())?;
    if !is_operator_token(&config.operator_tokens, token) {
        return Err(unauthorized(Some("Invalid bearer token")));
    }

    tracing::debug!(path = %request.uri().path(), "Authenticated operator request");
    request.extensions_mut().insert(OperatorAuth);

    Ok(next.run(request).await)
}

/// The credentials of an `Authorization: Bearer <token>` header. The scheme
/// is matched case-insensitively.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => Ok(token.trim()),
        _ => Err(unauthorized(Some(
            "Authorization header must use Bearer scheme",
        ))),
    }
}

fn is_operator_token(configured: &[String], token: &str) -> bool {
    // Compare against every configured token, without short-circuiting.
    configured.iter().fold(false, |matched, candidate| {
        let equal = !candidate.is_empty() && bool::from(token.as_bytes().ct_eq(candidate.as_bytes()));
        matched | equal
    })
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    Arc<AppConfig>: FromRef<S>,
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorAuth>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Operator authentication required")))
    }
}
