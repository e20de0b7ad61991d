use std::sync::Arc;

use la_domain::config::Config;
use la_memory::{MemoryCurator, MemoryStore};
use la_sessions::Ledger;

use crate::runtime::LaneScheduler;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub ledger: Ledger,
    pub memory: MemoryStore,
    /// `None` when `[memory] enabled = false`.
    pub curator: Option<MemoryCurator>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub scheduler: LaneScheduler,

    // ── Security ──────────────────────────────────────────────────────
    /// SHA-256 of the API bearer token; `None` disables auth.
    pub api_token_hash: Option<Vec<u8>>,
}
