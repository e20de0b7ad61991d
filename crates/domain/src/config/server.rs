use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_3210")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Maximum in-flight HTTP requests before the server applies backpressure.
    #[serde(default = "d_256")]
    pub max_concurrent_requests: usize,
    /// Environment variable holding the bearer token for the API.  Unset or
    /// empty disables authentication.
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3210,
            host: "127.0.0.1".into(),
            max_concurrent_requests: 256,
            api_token_env: d_api_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root of everything persisted across restarts: ledgers, memory records
/// and egress markers each live in their own subdirectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
        }
    }
}

impl StateConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.path.join("sessions")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.path.join("memory")
    }

    pub fn egress_dir(&self) -> PathBuf {
        self.path.join("egress")
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_3210() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_256() -> usize {
    256
}
fn d_api_token_env() -> String {
    "LA_API_TOKEN".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_parses_partial() {
        let toml_str = r#"
            port = 8080
            host = "0.0.0.0"
        "#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.max_concurrent_requests, 256);
    }

    #[test]
    fn state_subdirectories() {
        let cfg = StateConfig {
            path: PathBuf::from("/var/lib/laneagent"),
        };
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/var/lib/laneagent/sessions"));
        assert_eq!(cfg.memory_dir(), PathBuf::from("/var/lib/laneagent/memory"));
        assert_eq!(cfg.egress_dir(), PathBuf::from("/var/lib/laneagent/egress"));
    }
}
