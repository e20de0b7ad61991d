/// Shared error type used across all LaneAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// The agent failed mid-turn.  `partial` carries whatever output it
    /// produced before failing so the caller can still surface it.
    #[error("agent: {message}")]
    Agent {
        message: String,
        partial: Option<String>,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Partial agent output attached to this error, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::Agent { partial, .. } => partial.as_deref().filter(|p| !p.trim().is_empty()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
