use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection settings for the OpenAI-compatible endpoint used by the
/// reference agent and the memory curator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_provider_id")]
    pub provider_id: String,
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.  Unset means no auth header.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// Model used for memory extraction and compression.  Falls back to
    /// `model` when unset.
    #[serde(default)]
    pub summarizer_model: Option<String>,
    #[serde(default = "d_120")]
    pub timeout_secs: u64,
    /// Number of recent ledger records the reference agent puts in context.
    #[serde(default = "d_40")]
    pub history_entries: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider_id: d_provider_id(),
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            model: d_model(),
            summarizer_model: None,
            timeout_secs: 120,
            history_entries: 40,
        }
    }
}

impl LlmConfig {
    pub fn summarizer_model(&self) -> &str {
        self.summarizer_model.as_deref().unwrap_or(&self.model)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_provider_id() -> String {
    "openai".into()
}
fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_120() -> u64 {
    120
}
fn d_40() -> usize {
    40
}
