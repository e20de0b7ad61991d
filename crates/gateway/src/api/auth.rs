//! API authentication middleware.
//!
//! The env var named by `server.api_token_env` (default `LA_API_TOKEN`) is
//! read **once at startup** and its SHA-256 digest cached in `AppState`.
//! - If set, every protected request must carry `Authorization: Bearer <token>`.
//! - If unset or empty, requests pass through (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::error_response;
use crate::state::AppState;

pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.api_token_hash else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    // Compare fixed-length digests so the token length does not leak.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid or missing API token");
    }

    next.run(req).await
}
