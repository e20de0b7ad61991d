//! On-disk memory records.
//!
//! Layout per session (`<base>/<session>/`):
//! - `MEMORY.md`: the primary record, a growing list of rendered entries.
//! - `backup/MEMORY-<timestamp>.md`: snapshots taken before compression.
//! - `meta.json`: the [`MemoryMeta`] watermark and counters.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use la_domain::error::{Error, Result};
use la_domain::paths::safe_segment;
use la_sessions::write_atomic;

const PRIMARY_FILE: &str = "MEMORY.md";
const META_FILE: &str = "meta.json";
const BACKUP_DIR: &str = "backup";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One extraction pass over the ledger range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub timestamp: DateTime<Utc>,
    pub round_range: (usize, usize),
    pub summary: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
}

impl MemoryEntry {
    /// Markdown block appended to the primary record.
    pub fn render(&self) -> String {
        let (start, end) = self.round_range;
        let mut out = format!(
            "## {} (entries {start}..{end})\n\n{}\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%SZ"),
            self.summary.trim()
        );
        if !self.key_facts.is_empty() {
            out.push('\n');
            for fact in &self.key_facts {
                out.push_str("- ");
                out.push_str(fact.trim());
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }
}

/// Watermark and counters for one session's memory record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMeta {
    /// Ledger records with a global index below this are already memorized.
    #[serde(default)]
    pub last_memorized_entry_count: usize,
    #[serde(default)]
    pub total_extractions: u64,
    #[serde(default)]
    pub last_extracted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_compressions: u64,
    #[serde(default)]
    pub last_compressed_at: Option<DateTime<Utc>>,
}

/// Result of [`MemoryStore::replace_primary`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    Replaced { backup: Option<PathBuf> },
    /// The record changed since it was read; nothing was written.
    Stale,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-backed memory records, one directory per session.
///
/// Every read-modify-write of a session's files runs under that session's
/// lock, so a clear and an extraction commit never interleave.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    base_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                base_dir: base_dir.to_path_buf(),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.inner.base_dir.join(safe_segment(session_id))
    }

    pub fn primary_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(PRIMARY_FILE)
    }

    pub fn backup_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(BACKUP_DIR)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// The primary record, empty when nothing was memorized yet.
    pub fn read_primary(&self, session_id: &str) -> Result<String> {
        read_optional(&self.primary_path(session_id))
    }

    pub fn read_meta(&self, session_id: &str) -> Result<MemoryMeta> {
        let raw = read_optional(&self.session_dir(session_id).join(META_FILE))?;
        if raw.trim().is_empty() {
            return Ok(MemoryMeta::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Backup snapshots, oldest first.
    pub fn list_backups(&self, session_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.backup_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    // ── Writes ────────────────────────────────────────────────────────

    /// Append `entry` and advance the watermark to its range end, but only
    /// if the watermark still equals the range start.  Returns `false` when
    /// the watermark moved underneath the caller (e.g. a clear), in which
    /// case nothing is written.
    ///
    /// The record and the watermark move together: if the watermark cannot
    /// be written the record is restored, so the range is extracted again
    /// later instead of twice.
    pub fn commit_extraction(&self, session_id: &str, entry: &MemoryEntry) -> Result<bool> {
        self.commit_extraction_with(session_id, entry, |store, meta| {
            store.write_meta(session_id, meta)
        })
    }

    fn commit_extraction_with(
        &self,
        session_id: &str,
        entry: &MemoryEntry,
        persist_meta: impl FnOnce(&Self, &MemoryMeta) -> Result<()>,
    ) -> Result<bool> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let mut meta = self.read_meta(session_id)?;
        let (start, end) = entry.round_range;
        if meta.last_memorized_entry_count != start {
            return Ok(false);
        }

        std::fs::create_dir_all(self.session_dir(session_id))?;
        let path = self.primary_path(session_id);
        let previous = read_optional(&path)?;
        let mut updated = previous.clone();
        updated.push_str(&entry.render());
        write_atomic(&path, updated.as_bytes())?;

        meta.last_memorized_entry_count = end;
        meta.total_extractions += 1;
        meta.last_extracted_at = Some(entry.timestamp);
        if let Err(e) = persist_meta(self, &meta) {
            if let Err(restore) = write_atomic(&path, previous.as_bytes()) {
                tracing::error!(session_id, error = %restore, "restoring memory record after failed commit");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Move the current record into `backup/` and start an empty one.
    /// Returns the snapshot path, or `None` when there was nothing to keep.
    pub fn archive_primary(&self, session_id: &str) -> Result<Option<PathBuf>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let current = self.read_primary(session_id)?;
        if current.is_empty() {
            return Ok(None);
        }
        let backup = self.write_backup(session_id, &current)?;
        write_atomic(&self.primary_path(session_id), b"")?;
        Ok(Some(backup))
    }

    /// Move the watermark forward to `count` without extracting anything.
    /// Never moves it backwards.
    pub fn skip_to(&self, session_id: &str, count: usize) -> Result<MemoryMeta> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let mut meta = self.read_meta(session_id)?;
        if count > meta.last_memorized_entry_count {
            meta.last_memorized_entry_count = count;
            std::fs::create_dir_all(self.session_dir(session_id))?;
            self.write_meta(session_id, &meta)?;
        }
        Ok(meta)
    }

    /// Replace the primary record with `rewritten`, provided it still
    /// equals `expected`.  With `backup` set, the current record is first
    /// copied to a timestamped snapshot that must land on disk non-empty.
    pub fn replace_primary(
        &self,
        session_id: &str,
        expected: &str,
        rewritten: &str,
        backup: bool,
    ) -> Result<ReplaceOutcome> {
        if rewritten.trim().is_empty() {
            return Err(Error::Other("refusing to replace memory with empty text".into()));
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let current = self.read_primary(session_id)?;
        if current != expected {
            return Ok(ReplaceOutcome::Stale);
        }

        let backup_path = if backup && !current.is_empty() {
            Some(self.write_backup(session_id, &current)?)
        } else {
            None
        };

        write_atomic(&self.primary_path(session_id), rewritten.as_bytes())?;

        let mut meta = self.read_meta(session_id)?;
        meta.total_compressions += 1;
        meta.last_compressed_at = Some(Utc::now());
        self.write_meta(session_id, &meta)?;

        Ok(ReplaceOutcome::Replaced {
            backup: backup_path,
        })
    }

    // ── Private helpers ───────────────────────────────────────────────

    fn write_meta(&self, session_id: &str, meta: &MemoryMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.session_dir(session_id).join(META_FILE), &json)
    }

    fn write_backup(&self, session_id: &str, content: &str) -> Result<PathBuf> {
        let dir = self.backup_dir(session_id);
        std::fs::create_dir_all(&dir)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut path = dir.join(format!("MEMORY-{stamp}.md"));
        let mut n = 1;
        let mut file = loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(f) => break f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    path = dir.join(format!("MEMORY-{stamp}-{n}.md"));
                    n += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        let written = std::fs::metadata(&path)?.len();
        if written == 0 || written as usize != content.len() {
            return Err(Error::Other(format!(
                "memory backup {} is incomplete ({written} of {} bytes)",
                path.display(),
                content.len()
            )));
        }
        Ok(path)
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }
}

fn read_optional(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: usize, end: usize, summary: &str) -> MemoryEntry {
        MemoryEntry {
            timestamp: Utc::now(),
            round_range: (start, end),
            summary: summary.into(),
            key_facts: vec!["likes tea".into()],
        }
    }

    #[test]
    fn missing_session_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert_eq!(store.read_primary("s").unwrap(), "");
        assert_eq!(store.read_meta("s").unwrap(), MemoryMeta::default());
        assert!(store.list_backups("s").unwrap().is_empty());
    }

    #[test]
    fn commit_appends_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        assert!(store.commit_extraction("s", &entry(0, 20, "first")).unwrap());
        assert!(store.commit_extraction("s", &entry(20, 25, "second")).unwrap());

        let primary = store.read_primary("s").unwrap();
        assert!(primary.contains("first"));
        assert!(primary.contains("(entries 20..25)"));
        assert!(primary.find("first").unwrap() < primary.find("second").unwrap());

        let meta = store.read_meta("s").unwrap();
        assert_eq!(meta.last_memorized_entry_count, 25);
        assert_eq!(meta.total_extractions, 2);
    }

    #[test]
    fn failed_watermark_write_restores_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.commit_extraction("s", &entry(0, 5, "first")).unwrap();
        let before = store.read_primary("s").unwrap();

        let result = store.commit_extraction_with("s", &entry(5, 10, "second"), |_, _| {
            Err(Error::Other("disk full".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.read_primary("s").unwrap(), before);
        assert_eq!(store.read_meta("s").unwrap().last_memorized_entry_count, 5);

        // Retrying the same range lands exactly one copy.
        assert!(store.commit_extraction("s", &entry(5, 10, "second")).unwrap());
        assert_eq!(store.read_primary("s").unwrap().matches("second").count(), 1);
    }

    #[test]
    fn archive_moves_record_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.archive_primary("s").unwrap().is_none());

        store.commit_extraction("s", &entry(0, 5, "secret")).unwrap();
        let before = store.read_primary("s").unwrap();

        let backup = store.archive_primary("s").unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), before);
        assert_eq!(store.read_primary("s").unwrap(), "");
        assert_eq!(store.read_meta("s").unwrap().last_memorized_entry_count, 5);
    }

    #[test]
    fn stale_commit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.skip_to("s", 30).unwrap();

        assert!(!store.commit_extraction("s", &entry(0, 20, "late")).unwrap());
        assert_eq!(store.read_primary("s").unwrap(), "");
        assert_eq!(store.read_meta("s").unwrap().last_memorized_entry_count, 30);
    }

    #[test]
    fn skip_to_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.skip_to("s", 10).unwrap();
        let meta = store.skip_to("s", 4).unwrap();
        assert_eq!(meta.last_memorized_entry_count, 10);
    }

    #[test]
    fn replace_writes_backup_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.commit_extraction("s", &entry(0, 5, "original")).unwrap();
        let before = store.read_primary("s").unwrap();

        let outcome = store
            .replace_primary("s", &before, "compressed", true)
            .unwrap();
        let ReplaceOutcome::Replaced { backup: Some(backup) } = outcome else {
            panic!("expected a backup, got {outcome:?}");
        };
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), before);
        assert_eq!(store.read_primary("s").unwrap(), "compressed");
        assert_eq!(store.read_meta("s").unwrap().total_compressions, 1);
    }

    #[test]
    fn replace_skips_when_record_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.commit_extraction("s", &entry(0, 5, "original")).unwrap();

        let outcome = store.replace_primary("s", "stale", "compressed", true).unwrap();
        assert_eq!(outcome, ReplaceOutcome::Stale);
        assert!(store.read_primary("s").unwrap().contains("original"));
        assert!(store.list_backups("s").unwrap().is_empty());
    }

    #[test]
    fn empty_rewrite_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.commit_extraction("s", &entry(0, 5, "original")).unwrap();
        let before = store.read_primary("s").unwrap();
        assert!(store.replace_primary("s", &before, "  ", true).is_err());
        assert_eq!(store.read_primary("s").unwrap(), before);
    }
}
