//! Append-only JSONL session ledgers with archive segments.
//!
//! Layout per session (`<base>/<session>/`):
//! - `ledger.jsonl`: the active view, one [`LedgerMessage`] per line.
//! - `archive/<segment>.jsonl`: records moved out of the active view.
//! - `meta.json`: the [`LedgerSidecar`]: pinned ids and segment index.
//!
//! Every record has a stable global index: archived records keep the index
//! they had before compaction, and the active view starts at
//! `sidecar.archived_entries`.  Records are never rewritten in place; the
//! active file is only ever shortened after the records it loses have been
//! synced into an archive segment.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use la_domain::error::{Error, Result};
use la_domain::message::LedgerMessage;
use la_domain::paths::safe_segment;
use la_domain::trace::TraceEvent;

const LEDGER_FILE: &str = "ledger.jsonl";
const SIDECAR_FILE: &str = "meta.json";
const ARCHIVE_DIR: &str = "archive";
const SIDECAR_VERSION: u32 = 1;
const CLEAR_REASON: &str = "clear";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sidecar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A contiguous run of records moved out of the active view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSegment {
    pub id: String,
    /// Global index of the first archived record.
    pub start: usize,
    /// Global index one past the last archived record.
    pub end: usize,
    pub archived_at: DateTime<Utc>,
    pub reason: String,
}

impl ArchiveSegment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Small per-session metadata file next to the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSidecar {
    #[serde(default)]
    pub v: u32,
    /// Message ids the operator asked to keep in view.
    #[serde(default)]
    pub pinned: Vec<String>,
    /// Number of records that live in archive segments.
    #[serde(default)]
    pub archived_entries: usize,
    #[serde(default)]
    pub segments: Vec<ArchiveSegment>,
    /// A compaction that wrote its segment but may not have shortened the
    /// active file yet.  Resolved on the next load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<ArchiveSegment>,
}

/// Cached per-session counters.
#[derive(Debug, Clone, Copy)]
struct Counts {
    archived: usize,
    active: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ledger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LedgerInner {
    base_dir: PathBuf,
    /// One write lock per session; held for the whole of an append,
    /// compaction or clear so the active file is never replaced mid-write.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    counts: RwLock<HashMap<String, Counts>>,
}

/// Persistent per-session message log.  Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl Ledger {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                base_dir: base_dir.to_path_buf(),
                locks: Mutex::new(HashMap::new()),
                counts: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Directory holding everything for one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.inner.base_dir.join(safe_segment(session_id))
    }

    /// True once the session has written anything.
    pub fn exists(&self, session_id: &str) -> bool {
        self.session_dir(session_id).exists()
    }

    // ── Writes ────────────────────────────────────────────────────────

    /// Append one record to its session's ledger.  Returns the total record
    /// count (archived + active) after the write.
    pub fn append(&self, message: &LedgerMessage) -> Result<usize> {
        self.append_batch(&message.session_id, std::slice::from_ref(message))
    }

    /// Append several records in one write.
    pub fn append_batch(&self, session_id: &str, messages: &[LedgerMessage]) -> Result<usize> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let counts = self.counts_locked(session_id)?;
        if messages.is_empty() {
            return Ok(counts.archived + counts.active);
        }

        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(LEDGER_FILE))?;

        // A crash mid-append can leave a torn last line; never glue a new
        // record onto it.
        let mut buf = String::new();
        if !ends_with_newline(&mut file)? {
            tracing::warn!(session_id, "ledger ends in a torn line, starting a fresh one");
            buf.push('\n');
        }
        buf.push_str(&serialize_lines(messages)?);
        file.write_all(buf.as_bytes())?;

        // Only update the cache once the write succeeded.
        let total = {
            let mut cache = self.inner.counts.write();
            let entry = cache.entry(session_id.to_owned()).or_insert(counts);
            entry.active += messages.len();
            entry.archived + entry.active
        };

        TraceEvent::LedgerAppend {
            session_id: session_id.to_owned(),
            lines: messages.len(),
        }
        .emit();

        Ok(total)
    }

    /// Move active records with global index `< upto` into a new archive
    /// segment.  Returns `None` when there is nothing to move.
    pub fn compact(
        &self,
        session_id: &str,
        upto: usize,
        reason: &str,
    ) -> Result<Option<ArchiveSegment>> {
        self.compact_with(session_id, upto, reason, write_sidecar)
    }

    /// [`Ledger::compact`] with the final sidecar write supplied by the
    /// caller.
    fn compact_with(
        &self,
        session_id: &str,
        upto: usize,
        reason: &str,
        finish: impl FnOnce(&Path, &LedgerSidecar) -> Result<()>,
    ) -> Result<Option<ArchiveSegment>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let counts = self.counts_locked(session_id)?;
        let upto = upto.min(counts.archived + counts.active);
        if upto <= counts.archived {
            return Ok(None);
        }

        let dir = self.session_dir(session_id);
        let active = read_jsonl_file(&dir.join(LEDGER_FILE), session_id)?;
        let split = upto - counts.archived;
        let (moved, kept) = active.split_at(split.min(active.len()));
        if moved.is_empty() {
            return Ok(None);
        }

        let segment = ArchiveSegment {
            id: format!(
                "{}-{}",
                Utc::now().format("%Y%m%dT%H%M%S"),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            start: counts.archived,
            end: counts.archived + moved.len(),
            archived_at: Utc::now(),
            reason: reason.to_owned(),
        };

        // 1. Archive first: the removed records must be durable before the
        //    active view loses them.
        let archive_dir = dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir)?;
        write_atomic(
            &archive_dir.join(format!("{}.jsonl", segment.id)),
            serialize_lines(moved)?.as_bytes(),
        )?;

        let steps = || -> Result<usize> {
            // 2. Record the in-progress compaction.
            let mut sidecar = read_sidecar(&dir)?;
            sidecar.compacting = Some(segment.clone());
            write_sidecar(&dir, &sidecar)?;

            // 3. Shorten the active view.
            write_atomic(&dir.join(LEDGER_FILE), serialize_lines(kept)?.as_bytes())?;

            // 4. Finalize.
            finalize_compaction(&mut sidecar);
            finish(&dir, &sidecar)?;
            Ok(sidecar.archived_entries)
        };
        let archived = match steps() {
            Ok(archived) => archived,
            Err(e) => {
                // The active file may already be shorter than the cache
                // thinks; the next access resolves the pending marker.
                self.inner.counts.write().remove(session_id);
                return Err(e);
            }
        };

        self.inner.counts.write().insert(
            session_id.to_owned(),
            Counts {
                archived,
                active: kept.len(),
            },
        );

        TraceEvent::LedgerCompacted {
            session_id: session_id.to_owned(),
            segment_id: segment.id.clone(),
            archived: segment.len(),
            reason: reason.to_owned(),
        }
        .emit();

        Ok(Some(segment))
    }

    /// Archive the whole active view so the session starts from an empty
    /// context.  Global indices keep counting from where they were.
    pub fn clear(&self, session_id: &str) -> Result<Option<ArchiveSegment>> {
        self.compact(session_id, usize::MAX, CLEAR_REASON)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Total records ever appended (archived + active).
    pub fn total_message_count(&self, session_id: &str) -> Result<usize> {
        let c = self.counts(session_id)?;
        Ok(c.archived + c.active)
    }

    /// Number of records in the active view.
    pub fn active_len(&self, session_id: &str) -> Result<usize> {
        Ok(self.counts(session_id)?.active)
    }

    /// Global index of the first record in the active view.
    pub fn active_start(&self, session_id: &str) -> Result<usize> {
        Ok(self.counts(session_id)?.archived)
    }

    /// Global index where the current conversation began: the end of the
    /// most recent clear, or 0.  Records before it belong to a conversation
    /// the user already discarded.
    pub fn session_start(&self, session_id: &str) -> Result<usize> {
        Ok(last_clear_end(&self.sidecar(session_id)?))
    }

    /// The active view in order.
    pub fn load_active(&self, session_id: &str) -> Result<Vec<LedgerMessage>> {
        // Make sure a pending compaction is resolved before reading.
        self.counts(session_id)?;
        read_jsonl_file(&self.session_dir(session_id).join(LEDGER_FILE), session_id)
    }

    /// The last `n` records of the active view.
    pub fn load_recent(&self, session_id: &str, n: usize) -> Result<Vec<LedgerMessage>> {
        let mut active = self.load_active(session_id)?;
        let skip = active.len().saturating_sub(n);
        Ok(active.split_off(skip))
    }

    /// Records with global index in `[start, end)`, in order.  `end` is
    /// clamped to the total count; archived segments are read as needed.
    pub fn load_range(
        &self,
        session_id: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<LedgerMessage>> {
        let counts = self.counts(session_id)?;
        let end = end.min(counts.archived + counts.active);
        if start >= end {
            return Ok(Vec::new());
        }

        let dir = self.session_dir(session_id);
        let mut out = Vec::with_capacity(end - start);

        if start < counts.archived {
            let sidecar = read_sidecar(&dir)?;
            for seg in sidecar
                .segments
                .iter()
                .filter(|s| s.end > start && s.start < end)
            {
                let path = dir.join(ARCHIVE_DIR).join(format!("{}.jsonl", seg.id));
                let records = read_jsonl_file(&path, session_id)?;
                let from = start.saturating_sub(seg.start);
                let to = (end.min(seg.end) - seg.start).min(records.len());
                if from < to {
                    out.extend_from_slice(&records[from..to]);
                }
            }
        }

        if end > counts.archived {
            let active = read_jsonl_file(&dir.join(LEDGER_FILE), session_id)?;
            let from = start.saturating_sub(counts.archived);
            let to = (end - counts.archived).min(active.len());
            if from < to {
                out.extend_from_slice(&active[from..to]);
            }
        }

        Ok(out)
    }

    /// Current sidecar contents (defaults when the session is new).
    pub fn sidecar(&self, session_id: &str) -> Result<LedgerSidecar> {
        self.counts(session_id)?;
        read_sidecar(&self.session_dir(session_id))
    }

    // ── Pinning ───────────────────────────────────────────────────────

    /// Pin a message id.  Returns `false` if it was already pinned.
    pub fn pin(&self, session_id: &str, message_id: &str) -> Result<bool> {
        self.update_sidecar(session_id, |sc| {
            if sc.pinned.iter().any(|p| p == message_id) {
                false
            } else {
                sc.pinned.push(message_id.to_owned());
                true
            }
        })
    }

    /// Unpin a message id.  Returns `false` if it was not pinned.
    pub fn unpin(&self, session_id: &str, message_id: &str) -> Result<bool> {
        self.update_sidecar(session_id, |sc| {
            let before = sc.pinned.len();
            sc.pinned.retain(|p| p != message_id);
            sc.pinned.len() != before
        })
    }

    pub fn pinned(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self.sidecar(session_id)?.pinned)
    }

    /// Pinned records of the current conversation with their global index.
    /// Compaction does not hide them; a clear does.
    pub fn load_pinned(&self, session_id: &str) -> Result<Vec<(usize, LedgerMessage)>> {
        let sidecar = self.sidecar(session_id)?;
        if sidecar.pinned.is_empty() {
            return Ok(Vec::new());
        }
        let from = last_clear_end(&sidecar);
        let total = self.total_message_count(session_id)?;
        let records = self.load_range(session_id, from, total)?;
        Ok(records
            .into_iter()
            .enumerate()
            .filter(|(_, m)| {
                m.message_id
                    .as_ref()
                    .is_some_and(|id| sidecar.pinned.contains(id))
            })
            .map(|(i, m)| (from + i, m))
            .collect())
    }

    // ── Async wrappers ────────────────────────────────────────────────

    /// Run a ledger operation on the blocking pool so file I/O never
    /// stalls the tokio workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Ledger) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }

    pub async fn append_async(&self, message: LedgerMessage) -> Result<usize> {
        self.blocking(move |l| l.append(&message)).await
    }

    pub async fn append_batch_async(
        &self,
        session_id: &str,
        messages: Vec<LedgerMessage>,
    ) -> Result<usize> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.append_batch(&sid, &messages)).await
    }

    pub async fn load_range_async(
        &self,
        session_id: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<LedgerMessage>> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.load_range(&sid, start, end)).await
    }

    pub async fn load_recent_async(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<LedgerMessage>> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.load_recent(&sid, n)).await
    }

    pub async fn session_start_async(&self, session_id: &str) -> Result<usize> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.session_start(&sid)).await
    }

    pub async fn load_pinned_async(&self, session_id: &str) -> Result<Vec<(usize, LedgerMessage)>> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.load_pinned(&sid)).await
    }

    pub async fn total_message_count_async(&self, session_id: &str) -> Result<usize> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.total_message_count(&sid)).await
    }

    pub async fn active_len_async(&self, session_id: &str) -> Result<usize> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.active_len(&sid)).await
    }

    pub async fn compact_async(
        &self,
        session_id: &str,
        upto: usize,
        reason: &str,
    ) -> Result<Option<ArchiveSegment>> {
        let sid = session_id.to_owned();
        let reason = reason.to_owned();
        self.blocking(move |l| l.compact(&sid, upto, &reason)).await
    }

    pub async fn clear_async(&self, session_id: &str) -> Result<Option<ArchiveSegment>> {
        let sid = session_id.to_owned();
        self.blocking(move |l| l.clear(&sid)).await
    }

    // ── Private helpers ───────────────────────────────────────────────

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }

    fn counts(&self, session_id: &str) -> Result<Counts> {
        if let Some(c) = self.inner.counts.read().get(session_id) {
            return Ok(*c);
        }
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();
        self.counts_locked(session_id)
    }

    /// Load (and cache) counters.  Caller holds the session lock.
    fn counts_locked(&self, session_id: &str) -> Result<Counts> {
        if let Some(c) = self.inner.counts.read().get(session_id) {
            return Ok(*c);
        }

        let dir = self.session_dir(session_id);
        let mut sidecar = read_sidecar(&dir)?;
        let ledger_path = dir.join(LEDGER_FILE);
        let mut active = read_jsonl_file(&ledger_path, session_id)?;

        if let Some(pending) = sidecar.compacting.clone() {
            let archived =
                read_jsonl_file(&dir.join(ARCHIVE_DIR).join(format!("{}.jsonl", pending.id)), session_id)?;
            let rewrite_done = match (archived.first(), active.first()) {
                (Some(a), Some(b)) => a != b,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if rewrite_done {
                tracing::warn!(session_id, segment = %pending.id, "finalizing interrupted compaction");
                finalize_compaction(&mut sidecar);
            } else {
                tracing::warn!(session_id, segment = %pending.id, "rolling back interrupted compaction");
                sidecar.compacting = None;
                let _ = std::fs::remove_file(dir.join(ARCHIVE_DIR).join(format!("{}.jsonl", pending.id)));
            }
            write_sidecar(&dir, &sidecar)?;
            active = read_jsonl_file(&ledger_path, session_id)?;
        }

        let counts = Counts {
            archived: sidecar.archived_entries,
            active: active.len(),
        };
        self.inner
            .counts
            .write()
            .insert(session_id.to_owned(), counts);
        Ok(counts)
    }

    fn update_sidecar<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut LedgerSidecar) -> T,
    ) -> Result<T> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();
        self.counts_locked(session_id)?;

        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;
        let mut sidecar = read_sidecar(&dir)?;
        let out = f(&mut sidecar);
        write_sidecar(&dir, &sidecar)?;
        Ok(out)
    }
}

fn last_clear_end(sidecar: &LedgerSidecar) -> usize {
    sidecar
        .segments
        .iter()
        .rev()
        .find(|s| s.reason == CLEAR_REASON)
        .map_or(0, |s| s.end)
}

fn ends_with_newline(file: &mut std::fs::File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn finalize_compaction(sidecar: &mut LedgerSidecar) {
    if let Some(seg) = sidecar.compacting.take() {
        sidecar.archived_entries = seg.end;
        sidecar.segments.push(seg);
    }
}

/// Serialize records to a JSONL string.
fn serialize_lines(lines: &[LedgerMessage]) -> Result<String> {
    let mut buf = String::new();
    for line in lines {
        let json = serde_json::to_string(line)
            .map_err(|e| Error::Other(format!("serializing ledger record: {e}")))?;
        buf.push_str(&json);
        buf.push('\n');
    }
    Ok(buf)
}

/// Read and parse a JSONL file.  A missing file is an empty ledger.
fn read_jsonl_file(path: &Path, session_id: &str) -> Result<Vec<LedgerMessage>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)?;
    let mut lines = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerMessage>(line) {
            Ok(m) => lines.push(m),
            Err(e) => {
                tracing::warn!(
                    session_id = session_id,
                    path = %path.display(),
                    error = %e,
                    "skipping malformed ledger line"
                );
            }
        }
    }
    Ok(lines)
}

fn read_sidecar(dir: &Path) -> Result<LedgerSidecar> {
    let path = dir.join(SIDECAR_FILE);
    if !path.exists() {
        return Ok(LedgerSidecar {
            v: SIDECAR_VERSION,
            ..Default::default()
        });
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_sidecar(dir: &Path, sidecar: &LedgerSidecar) -> Result<()> {
    let mut sc = sidecar.clone();
    sc.v = SIDECAR_VERSION;
    let json = serde_json::to_vec_pretty(&sc)?;
    write_atomic(&dir.join(SIDECAR_FILE), &json)
}

/// Write `data` to a sibling temp file, sync it, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "tmp-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));
    let result = (|| {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result.map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use la_domain::message::Role;

    fn msg(sid: &str, role: Role, text: &str) -> LedgerMessage {
        LedgerMessage::new("api", sid, role, text)
    }

    fn seed(ledger: &Ledger, sid: &str, n: usize) {
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            ledger.append(&msg(sid, role, &format!("m{i}"))).unwrap();
        }
    }

    fn texts(records: &[LedgerMessage]) -> Vec<String> {
        records.iter().map(|r| r.text.clone()).collect()
    }

    #[test]
    fn append_creates_session_dir_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        assert!(!ledger.exists("s1"));

        assert_eq!(ledger.append(&msg("s1", Role::User, "hello")).unwrap(), 1);
        assert_eq!(ledger.append(&msg("s1", Role::Assistant, "hi")).unwrap(), 2);
        assert!(ledger.exists("s1"));
        assert_eq!(ledger.total_message_count("s1").unwrap(), 2);
        assert_eq!(ledger.total_message_count("other").unwrap(), 0);
    }

    #[test]
    fn load_range_is_exclusive_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 5);

        assert_eq!(texts(&ledger.load_range("s", 1, 3).unwrap()), vec!["m1", "m2"]);
        assert_eq!(texts(&ledger.load_range("s", 3, 99).unwrap()), vec!["m3", "m4"]);
        assert!(ledger.load_range("s", 4, 4).unwrap().is_empty());
        assert!(ledger.load_range("s", 9, 12).unwrap().is_empty());
    }

    #[test]
    fn counts_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        seed(&Ledger::new(dir.path()), "s", 3);

        let reopened = Ledger::new(dir.path());
        assert_eq!(reopened.total_message_count("s").unwrap(), 3);
        assert_eq!(reopened.append(&msg("s", Role::User, "m3")).unwrap(), 4);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 2);

        let path = ledger.session_dir("s").join(LEDGER_FILE);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);

        let reopened = Ledger::new(dir.path());
        assert_eq!(reopened.load_active("s").unwrap().len(), 2);
    }

    #[test]
    fn compaction_archives_before_shortening_and_keeps_indices() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 10);

        let seg = ledger.compact("s", 6, "test").unwrap().unwrap();
        assert_eq!((seg.start, seg.end), (0, 6));

        let archive = ledger
            .session_dir("s")
            .join(ARCHIVE_DIR)
            .join(format!("{}.jsonl", seg.id));
        assert!(archive.exists());

        assert_eq!(ledger.active_len("s").unwrap(), 4);
        assert_eq!(ledger.total_message_count("s").unwrap(), 10);
        assert_eq!(ledger.active_start("s").unwrap(), 6);

        // Ranges spanning the archive boundary read both sides.
        assert_eq!(
            texts(&ledger.load_range("s", 4, 8).unwrap()),
            vec!["m4", "m5", "m6", "m7"]
        );

        // Appends continue the global numbering.
        assert_eq!(ledger.append(&msg("s", Role::User, "m10")).unwrap(), 11);

        // Compacting behind the boundary is a no-op.
        assert!(ledger.compact("s", 3, "again").unwrap().is_none());
    }

    #[test]
    fn clear_empties_active_view_only() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 4);

        let seg = ledger.clear("s").unwrap().unwrap();
        assert_eq!(seg.reason, "clear");
        assert!(ledger.load_active("s").unwrap().is_empty());
        assert_eq!(texts(&ledger.load_range("s", 0, 4).unwrap()), vec!["m0", "m1", "m2", "m3"]);

        let reopened = Ledger::new(dir.path());
        assert_eq!(reopened.total_message_count("s").unwrap(), 4);
        assert_eq!(reopened.active_len("s").unwrap(), 0);
    }

    #[test]
    fn interrupted_compaction_before_rewrite_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 4);
        let sdir = ledger.session_dir("s");

        // Simulate a crash after step 2: segment written, active untouched.
        let active = read_jsonl_file(&sdir.join(LEDGER_FILE), "s").unwrap();
        std::fs::create_dir_all(sdir.join(ARCHIVE_DIR)).unwrap();
        write_atomic(
            &sdir.join(ARCHIVE_DIR).join("seg-x.jsonl"),
            serialize_lines(&active[..2]).unwrap().as_bytes(),
        )
        .unwrap();
        let sidecar = LedgerSidecar {
            compacting: Some(ArchiveSegment {
                id: "seg-x".into(),
                start: 0,
                end: 2,
                archived_at: Utc::now(),
                reason: "test".into(),
            }),
            ..Default::default()
        };
        write_sidecar(&sdir, &sidecar).unwrap();

        let reopened = Ledger::new(dir.path());
        assert_eq!(reopened.total_message_count("s").unwrap(), 4);
        assert_eq!(reopened.active_len("s").unwrap(), 4);
        assert!(reopened.sidecar("s").unwrap().compacting.is_none());
    }

    #[test]
    fn interrupted_compaction_after_rewrite_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 4);
        let sdir = ledger.session_dir("s");

        // Simulate a crash after step 3: active shortened, sidecar pending.
        let active = read_jsonl_file(&sdir.join(LEDGER_FILE), "s").unwrap();
        std::fs::create_dir_all(sdir.join(ARCHIVE_DIR)).unwrap();
        write_atomic(
            &sdir.join(ARCHIVE_DIR).join("seg-y.jsonl"),
            serialize_lines(&active[..3]).unwrap().as_bytes(),
        )
        .unwrap();
        write_atomic(
            &sdir.join(LEDGER_FILE),
            serialize_lines(&active[3..]).unwrap().as_bytes(),
        )
        .unwrap();
        let sidecar = LedgerSidecar {
            compacting: Some(ArchiveSegment {
                id: "seg-y".into(),
                start: 0,
                end: 3,
                archived_at: Utc::now(),
                reason: "test".into(),
            }),
            ..Default::default()
        };
        write_sidecar(&sdir, &sidecar).unwrap();

        let reopened = Ledger::new(dir.path());
        assert_eq!(reopened.total_message_count("s").unwrap(), 4);
        assert_eq!(reopened.active_len("s").unwrap(), 1);
        assert_eq!(texts(&reopened.load_range("s", 0, 4).unwrap()), vec!["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn failed_finalize_does_not_leave_stale_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 10);

        let result = ledger.compact_with("s", 6, "test", |_, _| {
            Err(Error::Other("disk full".into()))
        });
        assert!(result.is_err());

        // The shortened active file plus the pending marker still resolve
        // to the same global numbering.
        assert_eq!(ledger.total_message_count("s").unwrap(), 10);
        assert_eq!(ledger.active_start("s").unwrap(), 6);
        assert_eq!(
            texts(&ledger.load_range("s", 0, 4).unwrap()),
            vec!["m0", "m1", "m2", "m3"]
        );
        assert_eq!(ledger.append(&msg("s", Role::User, "m10")).unwrap(), 11);
    }

    #[test]
    fn append_after_torn_line_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 2);

        let path = ledger.session_dir("s").join(LEDGER_FILE);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"v\":1,\"ro").unwrap();
        drop(f);

        let reopened = Ledger::new(dir.path());
        assert_eq!(reopened.append(&msg("s", Role::User, "m2")).unwrap(), 3);
        assert_eq!(
            texts(&Ledger::new(dir.path()).load_active("s").unwrap()),
            vec!["m0", "m1", "m2"]
        );
    }

    #[test]
    fn session_start_tracks_the_last_clear() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        seed(&ledger, "s", 6);
        assert_eq!(ledger.session_start("s").unwrap(), 0);

        ledger.compact("s", 2, "memorized").unwrap();
        assert_eq!(ledger.session_start("s").unwrap(), 0);

        ledger.clear("s").unwrap();
        assert_eq!(ledger.session_start("s").unwrap(), 6);
    }

    #[test]
    fn pinned_records_survive_compaction_but_not_clear() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        for i in 0..4 {
            ledger
                .append(&msg("s", Role::User, &format!("m{i}")).with_message_id(Some(format!("id{i}"))))
                .unwrap();
        }
        ledger.pin("s", "id1").unwrap();

        ledger.compact("s", 3, "memorized").unwrap();
        let pinned = ledger.load_pinned("s").unwrap();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].0, 1);
        assert_eq!(pinned[0].1.text, "m1");

        ledger.clear("s").unwrap();
        assert!(ledger.load_pinned("s").unwrap().is_empty());
    }

    #[test]
    fn pin_and_unpin() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        assert!(ledger.pin("s", "m1").unwrap());
        assert!(!ledger.pin("s", "m1").unwrap());
        assert!(ledger.pin("s", "m2").unwrap());
        assert_eq!(ledger.pinned("s").unwrap(), vec!["m1", "m2"]);
        assert!(ledger.unpin("s", "m1").unwrap());
        assert!(!ledger.unpin("s", "m1").unwrap());
        assert_eq!(Ledger::new(dir.path()).pinned("s").unwrap(), vec!["m2"]);
    }

    #[tokio::test]
    async fn async_wrappers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        ledger
            .append_batch_async("s", vec![msg("s", Role::User, "a"), msg("s", Role::Assistant, "b")])
            .await
            .unwrap();
        assert_eq!(ledger.total_message_count_async("s").await.unwrap(), 2);
        let recent = ledger.load_recent_async("s", 1).await.unwrap();
        assert_eq!(texts(&recent), vec!["b"]);
    }
}
