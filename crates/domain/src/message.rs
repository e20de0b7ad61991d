use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk version of [`LedgerMessage`].
pub const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Label used when rendering a conversation as plain dialogue.
    pub fn label(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Tool => "Tool",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ledger record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One line of a session ledger.
///
/// Records are append-only; their position in the ledger is their order.
/// `message_id` is the platform's id for the inbound event and is only
/// best-effort unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerMessage {
    #[serde(default = "d_version")]
    pub v: u32,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub session_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl LedgerMessage {
    /// Build a record stamped with the current time.
    pub fn new(channel: &str, session_id: &str, role: Role, text: &str) -> Self {
        Self {
            v: LEDGER_VERSION,
            timestamp: Utc::now(),
            channel: channel.to_owned(),
            session_id: session_id.to_owned(),
            role,
            actor_id: None,
            message_id: None,
            thread_id: None,
            text: text.to_owned(),
            metadata: None,
        }
    }

    pub fn with_actor(mut self, actor_id: Option<String>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_thread(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

fn d_version() -> u32 {
    LEDGER_VERSION
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model conversation message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message in a model conversation (provider-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&LedgerMessage> for ChatMessage {
    fn from(m: &LedgerMessage) -> Self {
        Self {
            role: m.role,
            content: m.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_message_uses_camel_case_keys() {
        let msg = LedgerMessage::new("telegram", "s1", Role::User, "hi")
            .with_actor(Some("u1".into()))
            .with_message_id(Some("m1".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["actorId"], "u1");
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["role"], "user");
        assert!(json.get("threadId").is_none());
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let raw = r#"{"timestamp":"2026-01-01T00:00:00Z","channel":"api","sessionId":"s","role":"assistant","text":"ok"}"#;
        let msg: LedgerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.v, LEDGER_VERSION);
        assert_eq!(msg.role, Role::Assistant);
    }
}
