//! Authentication middleware for the external controller
//!
//! Bearer token authentication with constant-time comparison.

use super::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Paths that don't require authentication
const PUBLIC_PATHS: &[&str] = &["/", "/version"];

/// Authentication middleware
///
/// An empty secret disables authentication.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.secret.is_empty() {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path();
    if PUBLIC_PATHS.iter().any(|p| *p == path) || is_ui_path(path) {
        return Ok(next.run(req).await);
    }

    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| constant_time_eq(token.as_bytes(), state.secret.as_bytes()))
        .unwrap_or(false);

    if authorized {
        return Ok(next.run(req).await);
    }

    debug!("Auth failed - missing or invalid token");
    Err(StatusCode::UNAUTHORIZED)
}

/// Dashboard files under `/ui`
fn is_ui_path(path: &str) -> bool {
    path == "/ui" || path.starts_with("/ui/")
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
