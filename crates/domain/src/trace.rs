use serde::Serialize;

/// Structured trace events emitted across all LaneAgent crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LedgerAppend {
        session_id: String,
        lines: usize,
    },
    LedgerCompacted {
        session_id: String,
        segment_id: String,
        archived: usize,
        reason: String,
    },
    LaneEnqueued {
        session_id: String,
        kind: String,
        lane_pending: usize,
        pending_total: usize,
    },
    LaneDispatched {
        session_id: String,
        item_id: String,
        running_total: usize,
    },
    LaneMerged {
        session_id: String,
        round: usize,
        drained: usize,
    },
    LaneCleared {
        session_id: String,
        dropped: usize,
    },
    EgressClaim {
        channel: String,
        chat_id: String,
        message_key: String,
        outcome: String,
    },
    MemoryExtracted {
        session_id: String,
        start: usize,
        end: usize,
        key_facts: usize,
        fallback: bool,
    },
    MemoryCompressed {
        session_id: String,
        before_chars: usize,
        after_chars: usize,
        backup: bool,
    },
    LlmRequest {
        provider: String,
        model: String,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "la_event");
    }
}
