//! Session storage for LaneAgent.
//!
//! Stable session ids derived from inbound metadata, and the append-only
//! per-session ledger with archive segments.

pub mod ledger;
pub mod session_key;

pub use ledger::{write_atomic, ArchiveSegment, Ledger, LedgerSidecar};
pub use session_key::{compute_session_id, resolve_session_id};
