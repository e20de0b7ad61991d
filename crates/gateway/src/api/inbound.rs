//! `POST /v1/inbound`: the single entry point for channel connectors.
//!
//! The event is written to the session ledger and queued on its lane; the
//! reply is delivered later through the outbound adapter for the channel.
//! The response is the ingest receipt, returned with `202 Accepted`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use la_domain::inbound::{InboundEvent, QueueKind};

use super::error_response;
use crate::state::AppState;

pub async fn inbound(State(state): State<AppState>, Json(event): Json<InboundEvent>) -> Response {
    if let Err(msg) = check_event(&event) {
        return error_response(StatusCode::BAD_REQUEST, msg);
    }

    match state.scheduler.ingest(event).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "inbound ingest failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

fn check_event(event: &InboundEvent) -> Result<(), &'static str> {
    if event.channel.trim().is_empty() {
        return Err("channel must not be empty");
    }
    let has_session = event
        .session_id
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());
    if event.target_id.trim().is_empty() && !has_session {
        return Err("targetId or sessionId is required");
    }
    if event.effective_kind() == QueueKind::Exec && event.text.trim().is_empty() {
        return Err("text must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use la_domain::inbound::ControlAction;

    fn event(channel: &str, target: &str, text: &str) -> InboundEvent {
        InboundEvent {
            channel: channel.into(),
            target_id: target.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_incomplete_events() {
        assert!(check_event(&event("", "1", "hi")).is_err());
        assert!(check_event(&event("telegram", "", "hi")).is_err());
        assert!(check_event(&event("telegram", "1", "  ")).is_err());
        assert!(check_event(&event("telegram", "1", "hi")).is_ok());
    }

    #[test]
    fn control_events_need_no_text() {
        let mut ev = event("telegram", "1", "");
        ev.control = Some(ControlAction::Clear);
        assert!(check_event(&ev).is_ok());

        let mut by_session = event("api", "", "hello");
        by_session.session_id = Some("custom".into());
        assert!(check_event(&by_session).is_ok());
    }
}
