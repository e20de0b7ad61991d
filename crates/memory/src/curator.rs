//! Background memory maintenance.
//!
//! After ledger appends the scheduler calls [`MemoryCurator::notify_appended`].
//! When enough unmemorized records have piled up, a detached task runs one
//! maintenance pass for that session:
//!
//! 1. extract a summary and key facts from `[watermark, total)` and append
//!    them to the primary record, then advance the watermark;
//! 2. compress the primary record when it outgrows `max_primary_chars`;
//! 3. compact the ledger's active view when it outgrows
//!    `ledger.max_active_entries`.
//!
//! Failures are logged and leave the previous memory state untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use la_domain::config::{LedgerConfig, MemoryConfig};
use la_domain::error::{Error, Result};
use la_domain::message::ChatMessage;
use la_domain::trace::TraceEvent;
use la_providers::{ChatRequest, LlmProvider};
use la_sessions::{ArchiveSegment, Ledger};

use crate::extract::{compression_prompt, extraction_prompt, parse_extraction, render_dialogue};
use crate::store::{MemoryEntry, MemoryMeta, MemoryStore, ReplaceOutcome};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceOutcome {
    /// Ledger range folded into the memory record.
    pub extracted: Option<(usize, usize)>,
    pub compressed: bool,
    pub compacted: Option<ArchiveSegment>,
}

/// Per-session memory maintenance driver.  Cheap to clone.
#[derive(Clone)]
pub struct MemoryCurator {
    inner: Arc<CuratorInner>,
}

struct CuratorInner {
    store: MemoryStore,
    ledger: Ledger,
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
    memory: MemoryConfig,
    ledger_cfg: LedgerConfig,
    /// Sessions with a maintenance pass currently running.
    in_flight: Mutex<HashSet<String>>,
    /// Last known watermark per session, to skip spawning when below
    /// threshold.
    watermarks: Mutex<HashMap<String, usize>>,
}

impl MemoryCurator {
    /// `model` overrides the provider's default model for extraction and
    /// compression calls.
    pub fn new(
        store: MemoryStore,
        ledger: Ledger,
        provider: Arc<dyn LlmProvider>,
        model: Option<String>,
        memory: MemoryConfig,
        ledger_cfg: LedgerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CuratorInner {
                store,
                ledger,
                provider,
                model,
                memory,
                ledger_cfg,
                in_flight: Mutex::new(HashSet::new()),
                watermarks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.inner.store
    }

    /// Number of sessions with a pass currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.inner.in_flight.lock().contains(session_id)
    }

    // ── Trigger ───────────────────────────────────────────────────────

    /// Called after the ledger for `session_id` reached `total` records.
    ///
    /// Spawns a detached, supervised maintenance task when enough records
    /// are unmemorized and no pass is already running for the session.
    /// Returns whether a task was spawned.  Never blocks on I/O.
    pub fn notify_appended(&self, session_id: &str, total: usize) -> bool {
        if !self.inner.memory.enabled {
            return false;
        }

        if let Some(&watermark) = self.inner.watermarks.lock().get(session_id) {
            if total.saturating_sub(watermark) < self.inner.memory.extract_min_entries {
                return false;
            }
        }

        if !self.inner.in_flight.lock().insert(session_id.to_owned()) {
            tracing::debug!(session_id, "memory pass already running");
            return false;
        }

        let this = self.clone();
        let sid = session_id.to_owned();
        let worker = tokio::spawn({
            let this = this.clone();
            let sid = sid.clone();
            async move { this.maintain(&sid).await }
        });

        // Supervisor: the in-flight guard is released even if the pass panics.
        tokio::spawn(async move {
            match worker.await {
                Ok(Ok(outcome)) => {
                    if outcome != MaintenanceOutcome::default() {
                        tracing::debug!(session_id = %sid, ?outcome, "memory pass finished");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %sid, error = %e, "memory pass failed");
                }
                Err(e) => {
                    tracing::error!(session_id = %sid, error = %e, "memory pass panicked");
                }
            }
            this.inner.in_flight.lock().remove(&sid);
        });

        true
    }

    /// Advance the watermark to the current ledger total so nothing before
    /// it is ever extracted.  Used when a session is cleared.
    pub async fn skip_to_current(&self, session_id: &str) -> Result<MemoryMeta> {
        let total = self
            .inner
            .ledger
            .total_message_count_async(session_id)
            .await?;
        let store = self.inner.store.clone();
        let sid = session_id.to_owned();
        let meta = blocking(move || store.skip_to(&sid, total)).await?;
        self.remember_watermark(session_id, meta.last_memorized_entry_count);
        Ok(meta)
    }

    /// Primary record and metadata for one session.
    pub async fn snapshot(&self, session_id: &str) -> Result<(String, MemoryMeta)> {
        let store = self.inner.store.clone();
        let sid = session_id.to_owned();
        blocking(move || Ok((store.read_primary(&sid)?, store.read_meta(&sid)?))).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Maintenance pass
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run one maintenance pass for `session_id` in the foreground.
    ///
    /// Extraction errors are returned. Compression and compaction errors
    /// after a successful extraction are logged and leave their step undone.
    pub async fn maintain(&self, session_id: &str) -> Result<MaintenanceOutcome> {
        let mut outcome = MaintenanceOutcome::default();

        let Some(range) = self.extract(session_id).await? else {
            return Ok(outcome);
        };
        outcome.extracted = Some(range);

        match self.compress_if_needed(session_id).await {
            Ok(done) => outcome.compressed = done,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "memory compression failed, record left as is");
            }
        }

        match self.compact_ledger(session_id, range.1).await {
            Ok(segment) => outcome.compacted = segment,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "ledger compaction after extraction failed");
            }
        }

        Ok(outcome)
    }

    // ── Step 1: extraction ────────────────────────────────────────────

    async fn extract(&self, session_id: &str) -> Result<Option<(usize, usize)>> {
        let store = self.inner.store.clone();
        let sid = session_id.to_owned();
        let meta = blocking(move || store.read_meta(&sid)).await?;
        let start = meta.last_memorized_entry_count;
        self.remember_watermark(session_id, start);

        let total = self
            .inner
            .ledger
            .total_message_count_async(session_id)
            .await?;
        if total.saturating_sub(start) < self.inner.memory.extract_min_entries {
            return Ok(None);
        }

        let records = self
            .inner
            .ledger
            .load_range_async(session_id, start, total)
            .await?;
        if records.is_empty() {
            return Ok(None);
        }
        let end = start + records.len();

        let dialogue = render_dialogue(&records, self.inner.memory.max_line_chars);
        let req = ChatRequest {
            messages: vec![ChatMessage::user(extraction_prompt(&dialogue))],
            temperature: Some(0.1),
            max_tokens: Some(1500),
            json_mode: true,
            model: self.inner.model.clone(),
        };
        let resp = self.inner.provider.chat(&req).await?;
        let parsed = parse_extraction(&resp.content);
        if parsed.summary.is_empty() && parsed.key_facts.is_empty() {
            return Err(Error::Other("empty extraction response".into()));
        }

        let entry = MemoryEntry {
            timestamp: Utc::now(),
            round_range: (start, end),
            summary: parsed.summary,
            key_facts: parsed.key_facts,
        };
        let key_facts = entry.key_facts.len();

        let store = self.inner.store.clone();
        let sid = session_id.to_owned();
        let committed = blocking(move || store.commit_extraction(&sid, &entry)).await?;
        if !committed {
            tracing::info!(session_id, start, end, "watermark moved during extraction, result dropped");
            return Ok(None);
        }
        self.remember_watermark(session_id, end);

        TraceEvent::MemoryExtracted {
            session_id: session_id.to_owned(),
            start,
            end,
            key_facts,
            fallback: parsed.fallback,
        }
        .emit();

        Ok(Some((start, end)))
    }

    // ── Step 2: compression ───────────────────────────────────────────

    async fn compress_if_needed(&self, session_id: &str) -> Result<bool> {
        let store = self.inner.store.clone();
        let sid = session_id.to_owned();
        let current = blocking(move || store.read_primary(&sid)).await?;

        let before_chars = current.chars().count();
        if before_chars <= self.inner.memory.max_primary_chars {
            return Ok(false);
        }

        let target = self.inner.memory.compression_target_chars();
        let req = ChatRequest {
            messages: vec![ChatMessage::user(compression_prompt(&current, target))],
            temperature: Some(0.1),
            max_tokens: None,
            json_mode: false,
            model: self.inner.model.clone(),
        };
        let resp = self.inner.provider.chat(&req).await?;
        let rewritten = format!("{}\n", resp.content.trim());
        let after_chars = rewritten.chars().count();

        let store = self.inner.store.clone();
        let sid = session_id.to_owned();
        let backup = self.inner.memory.backup_before_compress;
        let replaced =
            blocking(move || store.replace_primary(&sid, &current, &rewritten, backup)).await?;

        match replaced {
            ReplaceOutcome::Replaced { backup } => {
                TraceEvent::MemoryCompressed {
                    session_id: session_id.to_owned(),
                    before_chars,
                    after_chars,
                    backup: backup.is_some(),
                }
                .emit();
                Ok(true)
            }
            ReplaceOutcome::Stale => {
                tracing::info!(session_id, "memory record changed during compression, skipped");
                Ok(false)
            }
        }
    }

    // ── Step 3: ledger compaction ─────────────────────────────────────

    async fn compact_ledger(
        &self,
        session_id: &str,
        watermark: usize,
    ) -> Result<Option<ArchiveSegment>> {
        let cfg = &self.inner.ledger_cfg;
        if !cfg.auto_compact {
            return Ok(None);
        }

        let ledger = &self.inner.ledger;
        let active = ledger.active_len_async(session_id).await?;
        if active <= cfg.max_active_entries {
            return Ok(None);
        }

        let total = ledger.total_message_count_async(session_id).await?;
        let upto = watermark.min(total.saturating_sub(cfg.keep_recent_entries));
        ledger.compact_async(session_id, upto, "memorized").await
    }

    fn remember_watermark(&self, session_id: &str, watermark: usize) {
        self.inner
            .watermarks
            .lock()
            .insert(session_id.to_owned(), watermark);
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
}
