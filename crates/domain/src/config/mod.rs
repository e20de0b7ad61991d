mod compaction;
mod egress;
mod lanes;
mod llm;
mod observability;
mod server;

pub use compaction::*;
pub use egress::*;
pub use lanes::*;
pub use llm::*;
pub use observability::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub lanes: LanesConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Outbound adapter bindings, one per channel.
    #[serde(default)]
    pub outbound: Vec<OutboundConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut push = |severity, field: &str, message: &str| {
            errors.push(ConfigError {
                severity,
                field: field.into(),
                message: message.into(),
            });
        };

        if self.server.port == 0 {
            push(ConfigSeverity::Error, "server.port", "port must be greater than 0");
        }
        if self.server.host.is_empty() {
            push(ConfigSeverity::Error, "server.host", "host must not be empty");
        }

        if self.lanes.max_concurrency == 0 {
            push(
                ConfigSeverity::Error,
                "lanes.max_concurrency",
                "max_concurrency must be at least 1",
            );
        }
        if self.lanes.correction_max_rounds > 0 && self.lanes.correction_max_merged_messages == 0 {
            push(
                ConfigSeverity::Warning,
                "lanes.correction_max_merged_messages",
                "merge rounds are enabled but each round may absorb 0 messages",
            );
        }
        if self.lanes.turn_timeout_secs == Some(0) {
            push(
                ConfigSeverity::Error,
                "lanes.turn_timeout_secs",
                "timeout must be greater than 0 (omit it to disable)",
            );
        }
        if self.lanes.turn_timeout_secs.is_none() {
            push(
                ConfigSeverity::Warning,
                "lanes.turn_timeout_secs",
                "no turn timeout: a hung model call holds its slot indefinitely",
            );
        }

        if self.ledger.keep_recent_entries >= self.ledger.max_active_entries {
            push(
                ConfigSeverity::Warning,
                "ledger.keep_recent_entries",
                "keep_recent_entries >= max_active_entries: compaction can never shrink the active view",
            );
        }

        if self.memory.enabled && self.memory.extract_min_entries == 0 {
            push(
                ConfigSeverity::Error,
                "memory.extract_min_entries",
                "extract_min_entries must be at least 1",
            );
        }
        if !(0.1..=1.0).contains(&self.memory.compression_ratio) {
            push(
                ConfigSeverity::Warning,
                "memory.compression_ratio",
                "compression_ratio outside 0.1..=1.0 is clamped",
            );
        }

        if self.llm.base_url.is_empty() {
            push(ConfigSeverity::Error, "llm.base_url", "base_url must not be empty");
        }

        for (i, ob) in self.outbound.iter().enumerate() {
            if ob.channel.is_empty() {
                push(
                    ConfigSeverity::Error,
                    &format!("outbound[{i}].channel"),
                    "channel must not be empty",
                );
            }
            if !ob.webhook_url.starts_with("http://") && !ob.webhook_url.starts_with("https://") {
                push(
                    ConfigSeverity::Error,
                    &format!("outbound[{i}].webhook_url"),
                    "webhook_url must be an http(s) URL",
                );
            }
        }

        errors
    }

    /// True when `validate()` reported no hard errors.
    pub fn is_valid(&self) -> bool {
        self.validate()
            .iter()
            .all(|e| e.severity != ConfigSeverity::Error)
    }
}
