//! Session id derivation for events that arrive without one.
//!
//! Id templates:
//! - `<channel>:<targetType>:<targetId>`
//! - `<channel>:<targetType>:<targetId>:thread:<threadId>`
//!
//! `targetType` defaults to `direct`.  Ids are opaque to the rest of the
//! runtime; only their equality matters.

use la_domain::inbound::InboundEvent;

/// Compute a stable session id from channel + target + optional thread.
pub fn compute_session_id(
    channel: &str,
    target_type: Option<&str>,
    target_id: &str,
    thread_id: Option<&str>,
) -> String {
    let ch = non_empty(channel).unwrap_or("default");
    let ty = target_type.and_then(non_empty).unwrap_or("direct");
    let target = non_empty(target_id).unwrap_or("unknown");
    let key = format!("{ch}:{ty}:{target}");
    match thread_id.and_then(non_empty) {
        Some(tid) => format!("{key}:thread:{tid}"),
        None => key,
    }
}

/// Resolve the session id for an inbound event: the explicit id when
/// present, otherwise the derived one.
pub fn resolve_session_id(event: &InboundEvent) -> String {
    if let Some(sid) = event.session_id.as_deref().and_then(non_empty) {
        return sid.to_owned();
    }
    compute_session_id(
        &event.channel,
        event.target_type.as_deref(),
        &event.target_id,
        event.thread_id.as_deref(),
    )
}

fn non_empty(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_default() {
        assert_eq!(
            compute_session_id("telegram", None, "42", None),
            "telegram:direct:42"
        );
    }

    #[test]
    fn group_with_thread() {
        assert_eq!(
            compute_session_id("discord", Some("group"), "guild7", Some("t9")),
            "discord:group:guild7:thread:t9"
        );
    }

    #[test]
    fn blank_parts_fall_back() {
        assert_eq!(
            compute_session_id("", Some(" "), "", Some("")),
            "default:direct:unknown"
        );
    }

    #[test]
    fn explicit_session_id_wins() {
        let ev = InboundEvent {
            channel: "api".into(),
            target_id: "x".into(),
            session_id: Some("custom".into()),
            ..Default::default()
        };
        assert_eq!(resolve_session_id(&ev), "custom");

        let ev = InboundEvent {
            session_id: Some("  ".into()),
            ..ev
        };
        assert_eq!(resolve_session_id(&ev), "api:direct:x");
    }
}
