use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lane scheduling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how the lane scheduler multiplexes sessions over agent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    /// Maximum number of lanes running an agent invocation at once.
    #[serde(default = "d_4")]
    pub max_concurrency: usize,
    /// How many times one invocation may drain follow-up messages from
    /// its own lane.
    #[serde(default = "d_2")]
    pub correction_max_rounds: usize,
    /// Upper bound on items pulled by a single drain call.
    #[serde(default = "d_5")]
    pub correction_max_merged_messages: usize,
    /// Wall-clock limit for one agent invocation.  `None` lets a model call
    /// hold its slot indefinitely.
    #[serde(default = "d_turn_timeout")]
    pub turn_timeout_secs: Option<u64>,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            correction_max_rounds: 2,
            correction_max_merged_messages: 5,
            turn_timeout_secs: d_turn_timeout(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_4() -> usize {
    4
}
fn d_2() -> usize {
    2
}
fn d_5() -> usize {
    5
}
fn d_turn_timeout() -> Option<u64> {
    Some(900)
}
