//! Bearer token check of the protected routes.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use srm_common::SrmError;
use tracing::{debug, instrument};

use super::{ApiError, AppState};
use crate::auth::{PERM_READ, PERM_WRITE};

/// Token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(request: &Request<Body>) -> Option<&str> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

/// Permission a request needs: reads need `read`, everything else `write`.
pub fn required_permission(method: &Method) -> &'static str {
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        PERM_READ
    } else {
        PERM_WRITE
    }
}

/// Verifies the bearer token and stores its claims as a request extension.
#[instrument(name = "require_token", skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn require_token(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request) else {
        return ApiError(SrmError::RequestWithoutCert).into_response();
    };
    let claims = match state.auth.verify(token) {
        Ok(claims) => claims,
        Err(e) => return ApiError::from(e).into_response(),
    };
    if let Err(e) = claims.require(required_permission(request.method())) {
        return ApiError::from(e).into_response();
    }
    debug!(subject = %claims.sub, "Authenticated request");
    request.extensions_mut().insert(claims);
    next.run(request).await
}
