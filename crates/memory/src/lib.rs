//! `la-memory`: per-session memory records for LaneAgent.
//!
//! The [`MemoryStore`] keeps a Markdown primary record, timestamped
//! backups and a watermark file per session.  The [`MemoryCurator`] feeds
//! it from the session ledger in the background: it extracts a summary and
//! key facts from each unmemorized range, compresses the record when it
//! grows past its limit, and compacts the ledger once a range is safely
//! memorized.

pub mod curator;
pub mod extract;
pub mod store;

pub use curator::{MaintenanceOutcome, MemoryCurator};
pub use extract::{parse_extraction, Extraction};
pub use store::{MemoryEntry, MemoryMeta, MemoryStore, ReplaceOutcome};
