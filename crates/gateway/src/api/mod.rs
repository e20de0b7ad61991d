pub mod auth;
pub mod inbound;
pub mod lanes;
pub mod sessions;

use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the bearer-token middleware).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(lanes::health));

    let protected = Router::new()
        // Ingest (channel connector contract)
        .route("/v1/inbound", post(inbound::inbound))
        // Lanes
        .route("/v1/lanes/stats", get(lanes::stats))
        // Sessions
        .route("/v1/sessions/:id/ledger", get(sessions::get_ledger))
        .route("/v1/sessions/:id/clear", post(sessions::clear_session))
        .route("/v1/sessions/:id/memory", get(sessions::get_memory))
        .route("/v1/sessions/:id/pins", get(sessions::list_pins))
        .route("/v1/sessions/:id/pins", post(sessions::pin_message))
        .route("/v1/sessions/:id/pins/:message_id", delete(sessions::unpin_message))
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

// ── helpers ───────────────────────────────────────────────────────────

/// `{"error": "..."}` with the given status.
pub(crate) fn error_response(status: axum::http::StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

/// Run blocking storage work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> la_domain::error::Result<T>
where
    F: FnOnce() -> la_domain::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| la_domain::error::Error::Other(format!("spawn_blocking join: {e}")))?
}
