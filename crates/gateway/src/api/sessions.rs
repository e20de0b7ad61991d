//! Per-session read and control endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use la_domain::inbound::QueueItem;

use super::{blocking, error_response};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:id/ledger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    /// Global index of the first record.  Defaults to the active view start.
    pub start: Option<usize>,
    /// Exclusive upper bound.  Defaults to the total count.
    pub end: Option<usize>,
}

/// Ledger records by global index; archived ranges are included when
/// `start` precedes the active view.
pub async fn get_ledger(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(q): Query<LedgerQuery>,
) -> Response {
    let ledger = state.ledger.clone();
    let sid = session_id.clone();
    let result = blocking(move || {
        let total = ledger.total_message_count(&sid)?;
        let active_start = ledger.active_start(&sid)?;
        let start = q.start.unwrap_or(active_start);
        let end = q.end.unwrap_or(total).min(total);
        let records = ledger.load_range(&sid, start, end)?;
        Ok((total, active_start, start, end, records))
    })
    .await;

    match result {
        Ok((total, active_start, start, end, records)) => Json(serde_json::json!({
            "sessionId": session_id,
            "total": total,
            "activeStart": active_start,
            "start": start,
            "end": end.max(start),
            "records": records,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:id/clear
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearBody {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
}

/// Queue a `control: clear` for the session.  Pending items are dropped at
/// once; the archive and reset run after any turn in flight.
pub async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Option<Json<ClearBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let item = QueueItem::clear(
        body.channel.as_deref().unwrap_or("api"),
        body.target_id.as_deref().unwrap_or(""),
        &session_id,
    );
    let item_id = item.id.clone();
    let receipt = state.scheduler.enqueue(item);

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "sessionId": session_id,
            "itemId": item_id,
            "dropped": receipt.dropped,
            "lanePending": receipt.lane_pending,
            "pendingTotal": receipt.pending_total,
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:id/memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_memory(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let store = state.memory.clone();
    let sid = session_id.clone();
    let result = blocking(move || {
        let record = store.read_primary(&sid)?;
        let meta = store.read_meta(&sid)?;
        let backups = store.list_backups(&sid)?.len();
        Ok((record, meta, backups))
    })
    .await;

    match result {
        Ok((record, meta, backups)) => Json(serde_json::json!({
            "sessionId": session_id,
            "record": record,
            "meta": meta,
            "backups": backups,
            "extractionRunning": state.curator.as_ref().is_some_and(|c| c.is_running(&session_id)),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pins
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinBody {
    pub message_id: String,
}

pub async fn list_pins(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let ledger = state.ledger.clone();
    let sid = session_id.clone();
    match blocking(move || ledger.pinned(&sid)).await {
        Ok(pinned) => Json(serde_json::json!({
            "sessionId": session_id,
            "pinned": pinned,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn pin_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PinBody>,
) -> Response {
    if body.message_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "messageId must not be empty");
    }
    let ledger = state.ledger.clone();
    let mid = body.message_id.clone();
    match blocking(move || ledger.pin(&session_id, &mid)).await {
        Ok(added) => Json(serde_json::json!({
            "messageId": body.message_id,
            "pinned": true,
            "changed": added,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Response {
    let ledger = state.ledger.clone();
    let mid = message_id.clone();
    match blocking(move || ledger.unpin(&session_id, &mid)).await {
        Ok(true) => Json(serde_json::json!({
            "messageId": message_id,
            "pinned": false,
        }))
        .into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "message not pinned"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
