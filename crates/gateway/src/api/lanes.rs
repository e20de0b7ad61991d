use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /v1/lanes/stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.stats())
}

/// `GET /v1/health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "busy": state.scheduler.is_busy(),
    }))
}
