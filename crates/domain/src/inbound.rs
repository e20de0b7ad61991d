//! Normalized inbound events and the queue items derived from them.
//!
//! Channel connectors, API callers and the cron trigger all produce an
//! [`InboundEvent`]; the gateway stamps it into a [`QueueItem`] before it
//! enters a lane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a queue item asks the scheduler to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Drives an agent invocation.
    #[default]
    Exec,
    /// Recorded in the ledger only.
    Audit,
    /// Lane-level side effect (see [`ControlAction`]).
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Reset session-scoped agent state and drop the pending backlog.
    Clear,
}

/// The envelope every producer posts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Connector name: `"telegram"`, `"discord"`, `"api"`, `"cron"`, …
    pub channel: String,
    /// Chat / conversation id replies are addressed to.
    pub target_id: String,
    /// Explicit session id.  Derived from channel + target + thread when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub kind: Option<QueueKind>,
    /// `"direct"`, `"group"`, … (used only for session id derivation).
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub actor_name: Option<String>,
    #[serde(default)]
    pub control: Option<ControlAction>,
}

impl InboundEvent {
    /// Effective kind: a control payload always wins, then the explicit
    /// kind, then `exec`.
    pub fn effective_kind(&self) -> QueueKind {
        if self.control.is_some() {
            return QueueKind::Control;
        }
        self.kind.unwrap_or_default()
    }
}

/// One pending unit of work in a lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    pub kind: QueueKind,
    pub channel: String,
    pub target_id: String,
    pub session_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlAction>,
    /// Global ledger index of the user record written for this item at
    /// ingest, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_index: Option<usize>,
}

impl QueueItem {
    /// Stamp an inbound event into a queue item for `session_id`.
    pub fn from_event(event: InboundEvent, session_id: String) -> Self {
        let kind = event.effective_kind();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
            kind,
            channel: event.channel,
            target_id: event.target_id,
            session_id,
            text: event.text,
            actor_id: event.actor_id,
            actor_name: event.actor_name,
            message_id: event.message_id,
            thread_id: event.thread_id,
            control: event.control,
            ledger_index: None,
        }
    }

    /// Convenience constructor for an `exec` item.
    pub fn exec(channel: &str, target_id: &str, session_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
            kind: QueueKind::Exec,
            channel: channel.to_owned(),
            target_id: target_id.to_owned(),
            session_id: session_id.to_owned(),
            text: text.to_owned(),
            actor_id: None,
            actor_name: None,
            message_id: None,
            thread_id: None,
            control: None,
            ledger_index: None,
        }
    }

    /// Convenience constructor for a `control: clear` item.
    pub fn clear(channel: &str, target_id: &str, session_id: &str) -> Self {
        Self {
            kind: QueueKind::Control,
            control: Some(ControlAction::Clear),
            ..Self::exec(channel, target_id, session_id, "")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_payload_forces_control_kind() {
        let ev = InboundEvent {
            channel: "api".into(),
            target_id: "t".into(),
            kind: Some(QueueKind::Exec),
            control: Some(ControlAction::Clear),
            ..Default::default()
        };
        assert_eq!(ev.effective_kind(), QueueKind::Control);
    }

    #[test]
    fn inbound_event_parses_camel_case() {
        let raw = r#"{"channel":"telegram","targetId":"42","text":"hi","messageId":"m7","kind":"audit"}"#;
        let ev: InboundEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.target_id, "42");
        assert_eq!(ev.message_id.as_deref(), Some("m7"));
        assert_eq!(ev.effective_kind(), QueueKind::Audit);

        let item = QueueItem::from_event(ev, "telegram:direct:42".into());
        assert_eq!(item.kind, QueueKind::Audit);
        assert_eq!(item.session_id, "telegram:direct:42");
        assert!(!item.id.is_empty());
    }
}
