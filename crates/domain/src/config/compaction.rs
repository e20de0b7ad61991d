use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ledger compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compaction moves already-memorized ledger records into an archive
/// segment so the active view of a session stays short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Enable automatic compaction after memory extraction.
    #[serde(default = "d_true")]
    pub auto_compact: bool,
    /// Active-view size that triggers compaction.
    #[serde(default = "d_400")]
    pub max_active_entries: usize,
    /// Number of most recent records that always stay in the active view.
    #[serde(default = "d_80")]
    pub keep_recent_entries: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            auto_compact: true,
            max_active_entries: 400,
            keep_recent_entries: 80,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory curation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls the background summary/key-fact extraction and the
/// compression of the per-session memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Number of unmemorized ledger records that triggers an extraction.
    #[serde(default = "d_20")]
    pub extract_min_entries: usize,
    /// Size of the primary memory record (chars) that triggers compression.
    #[serde(default = "d_12000")]
    pub max_primary_chars: usize,
    /// Write a timestamped copy of the record before compressing it.
    #[serde(default = "d_true")]
    pub backup_before_compress: bool,
    /// Target size after compression, as a fraction of `max_primary_chars`.
    #[serde(default = "d_ratio")]
    pub compression_ratio: f64,
    /// Individual ledger records longer than this are clipped when rendered
    /// for the extraction prompt.
    #[serde(default = "d_2000")]
    pub max_line_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extract_min_entries: 20,
            max_primary_chars: 12_000,
            backup_before_compress: true,
            compression_ratio: 0.8,
            max_line_chars: 2_000,
        }
    }
}

impl MemoryConfig {
    /// Character budget requested from the model when compressing.
    pub fn compression_target_chars(&self) -> usize {
        let ratio = self.compression_ratio.clamp(0.1, 1.0);
        (self.max_primary_chars as f64 * ratio) as usize
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_400() -> usize {
    400
}
fn d_80() -> usize {
    80
}
fn d_20() -> usize {
    20
}
fn d_12000() -> usize {
    12_000
}
fn d_ratio() -> f64 {
    0.8
}
fn d_2000() -> usize {
    2_000
}
