use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Egress deduplication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// When disabled every send goes straight to the adapter.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Markers older than this are removed by `egress prune` and at startup.
    #[serde(default = "d_72")]
    pub retention_hours: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_hours: 72,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One outbound adapter binding.  Channels without a binding fall back to
/// the log-only sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Channel name this adapter serves (`"telegram"`, `"discord"`, …).
    pub channel: String,
    /// Webhook that receives `{chatId, text, threadId?, replyTo?}` as JSON.
    pub webhook_url: String,
    #[serde(default = "d_30")]
    pub timeout_secs: u64,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_72() -> u64 {
    72
}
fn d_30() -> u64 {
    30
}
