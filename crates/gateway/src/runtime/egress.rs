//! At-most-once delivery guard for outbound replies.
//!
//! Every reply is keyed by `(channel, chatId, messageKey)`, where the key
//! hashes the inbound message id together with the reply text.  A claim is
//! an exclusively created marker file at
//! `<dir>/<channel>/<chatId>/<messageKey>.json`; whoever creates it may send.
//! Markers survive restarts, so a replayed inbound event never produces a
//! second identical reply.
//!
//! Storage failures other than "already exists" fail open: the claim is
//! granted without a marker, because a lost reply is worse than a rare
//! duplicate.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use la_domain::error::{Error, Result};
use la_domain::paths::safe_segment;
use la_domain::trace::TraceEvent;
use la_sessions::write_atomic;

use super::outbound::{OutboundRouter, SendOptions};

const MARKER_VERSION: u32 = 1;
const KEY_LEN: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Marker model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Inflight,
    Delivered,
}

/// On-disk body of a claim marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressMarker {
    pub v: u32,
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub message_key: String,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// A granted claim.  `persisted` is false when the claim was granted
/// without a marker (fail-open).
#[derive(Debug, Clone)]
pub struct ClaimHandle {
    pub marker: EgressMarker,
    pub path: PathBuf,
    pub persisted: bool,
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(ClaimHandle),
    AlreadyClaimed,
}

/// `hex(sha256(messageId + "\n" + text))`, truncated to 32 hex chars.
pub fn message_key(message_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    let mut key = hex::encode(hasher.finalize());
    key.truncate(KEY_LEN);
    key
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deduplicator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-backed claim store.  All methods do blocking file I/O.
#[derive(Debug, Clone)]
pub struct EgressDeduplicator {
    dir: PathBuf,
}

impl EgressDeduplicator {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, channel: &str, chat_id: &str, message_key: &str) -> PathBuf {
        self.dir
            .join(safe_segment(channel))
            .join(safe_segment(chat_id))
            .join(format!("{}.json", safe_segment(message_key)))
    }

    /// Atomically claim `(channel, chat_id, message_key)`.
    pub fn try_claim(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: Option<&str>,
        message_key: &str,
    ) -> ClaimOutcome {
        let marker = EgressMarker {
            v: MARKER_VERSION,
            channel: channel.to_owned(),
            chat_id: chat_id.to_owned(),
            message_id: message_id.map(str::to_owned),
            message_key: message_key.to_owned(),
            status: ClaimStatus::Inflight,
            claimed_at: Utc::now(),
            delivered_at: None,
            meta: None,
        };
        let path = self.marker_path(channel, chat_id, message_key);

        match create_marker(&path, &marker) {
            Ok(()) => ClaimOutcome::Claimed(ClaimHandle {
                marker,
                path,
                persisted: true,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => ClaimOutcome::AlreadyClaimed,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "egress marker not writable, sending without a claim"
                );
                ClaimOutcome::Claimed(ClaimHandle {
                    marker,
                    path,
                    persisted: false,
                })
            }
        }
    }

    /// Rewrite the marker as delivered.  Best-effort.
    pub fn mark_delivered(&self, handle: &mut ClaimHandle) {
        handle.marker.status = ClaimStatus::Delivered;
        handle.marker.delivered_at = Some(Utc::now());
        if !handle.persisted {
            return;
        }
        let result = serde_json::to_vec_pretty(&handle.marker)
            .map_err(Error::from)
            .and_then(|json| write_atomic(&handle.path, &json));
        if let Err(e) = result {
            tracing::warn!(path = %handle.path.display(), error = %e, "marking egress claim delivered failed");
        }
    }

    /// Delete the marker so the key can be claimed again.  Best-effort.
    pub fn release(&self, handle: &ClaimHandle) {
        if !handle.persisted {
            return;
        }
        match std::fs::remove_file(&handle.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %handle.path.display(), error = %e, "releasing egress claim failed");
            }
        }
    }

    /// Remove markers claimed more than `max_age` ago.  Returns how many
    /// were removed.  Unreadable markers are aged by file mtime.
    pub fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let mut removed = 0;
        for path in self.expired_markers(max_age)? {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "pruning egress marker failed");
                }
            }
        }

        // Drop chat and channel directories left empty.  `remove_dir` only
        // succeeds on empty directories.
        if self.dir.exists() {
            for channel in read_dirs(&self.dir)? {
                for chat in read_dirs(&channel)? {
                    let _ = std::fs::remove_dir(&chat);
                }
                let _ = std::fs::remove_dir(&channel);
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "pruned egress markers");
        }
        Ok(removed)
    }

    /// How many markers [`prune_older_than`](Self::prune_older_than) would
    /// remove.
    pub fn count_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        Ok(self.expired_markers(max_age)?.len())
    }

    fn expired_markers(&self, max_age: chrono::Duration) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let cutoff = Utc::now() - max_age;
        let mut expired = Vec::new();
        for channel in read_dirs(&self.dir)? {
            for chat in read_dirs(&channel)? {
                for entry in std::fs::read_dir(&chat)?.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.extension().map_or(true, |ext| ext != "json") {
                        continue;
                    }
                    if marker_time(&path).is_some_and(|t| t < cutoff) {
                        expired.push(path);
                    }
                }
            }
        }
        Ok(expired)
    }
}

fn create_marker(path: &Path, marker: &EgressMarker) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let json = serde_json::to_vec_pretty(marker)?;
    // The marker exists from here on; a failed body write still holds the claim.
    if let Err(e) = file.write_all(&json).and_then(|_| file.sync_all()) {
        tracing::warn!(path = %path.display(), error = %e, "egress marker body not written");
    }
    Ok(())
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect())
}

fn marker_time(path: &Path) -> Option<DateTime<Utc>> {
    let parsed = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<EgressMarker>(&raw).ok())
        .map(|m| m.claimed_at);
    parsed.or_else(|| {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guarded sending
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent,
    /// An identical reply for the same inbound event was already claimed.
    Duplicate,
    Failed(String),
}

/// Claim → send → mark/release around an outbound adapter.
#[derive(Clone)]
pub struct GuardedSender {
    /// `None` sends without claims.
    dedup: Option<EgressDeduplicator>,
    router: Arc<OutboundRouter>,
}

impl GuardedSender {
    pub fn new(dedup: Option<EgressDeduplicator>, router: Arc<OutboundRouter>) -> Self {
        Self { dedup, router }
    }

    pub async fn send(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: Option<&str>,
        text: &str,
        opts: &SendOptions,
    ) -> SendOutcome {
        let sender = self.router.for_channel(channel);

        // Without an inbound id two distinct events can produce the same
        // text, so there is nothing safe to key a claim on.
        let (Some(dedup), Some(message_id)) = (self.dedup.clone(), message_id) else {
            let result = sender.send_text(chat_id, text, opts).await;
            return match result.success {
                true => SendOutcome::Sent,
                false => SendOutcome::Failed(result.error.unwrap_or_default()),
            };
        };

        let key = message_key(message_id, text);
        let claim = {
            let dedup = dedup.clone();
            let (ch, chat, mid, k) = (
                channel.to_owned(),
                chat_id.to_owned(),
                message_id.to_owned(),
                key.clone(),
            );
            blocking(move || Ok(dedup.try_claim(&ch, &chat, Some(&mid), &k))).await
        };

        let mut handle = match claim {
            Ok(ClaimOutcome::Claimed(handle)) => handle,
            Ok(ClaimOutcome::AlreadyClaimed) => {
                emit_claim(channel, chat_id, &key, "duplicate");
                return SendOutcome::Duplicate;
            }
            Err(e) => {
                tracing::warn!(error = %e, "egress claim task failed, sending unguarded");
                let result = sender.send_text(chat_id, text, opts).await;
                return match result.success {
                    true => SendOutcome::Sent,
                    false => SendOutcome::Failed(result.error.unwrap_or_default()),
                };
            }
        };
        emit_claim(
            channel,
            chat_id,
            &key,
            if handle.persisted { "claimed" } else { "fail_open" },
        );

        let result = sender.send_text(chat_id, text, opts).await;

        if result.success {
            let _ = blocking(move || {
                dedup.mark_delivered(&mut handle);
                Ok(())
            })
            .await;
            SendOutcome::Sent
        } else {
            let error = result.error.unwrap_or_else(|| "send failed".into());
            tracing::warn!(channel, chat_id, error = %error, "outbound send failed, releasing claim");
            let _ = blocking(move || {
                dedup.release(&handle);
                Ok(())
            })
            .await;
            emit_claim(channel, chat_id, &key, "released");
            SendOutcome::Failed(error)
        }
    }
}

fn emit_claim(channel: &str, chat_id: &str, key: &str, outcome: &str) {
    TraceEvent::EgressClaim {
        channel: channel.to_owned(),
        chat_id: chat_id.to_owned(),
        message_key: key.to_owned(),
        outcome: outcome.to_owned(),
    }
    .emit();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::outbound::{ChannelSender, SendResult};
    use parking_lot::Mutex;

    fn claim(dedup: &EgressDeduplicator, key: &str) -> ClaimOutcome {
        dedup.try_claim("telegram", "chat-1", Some("m1"), key)
    }

    #[test]
    fn key_depends_on_message_and_text() {
        let a = message_key("m1", "hello");
        assert_eq!(a.len(), 32);
        assert_eq!(a, message_key("m1", "hello"));
        assert_ne!(a, message_key("m1", "hello!"));
        assert_ne!(a, message_key("m2", "hello"));
    }

    #[test]
    fn claim_once_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key = message_key("m1", "hi");

        let first = EgressDeduplicator::new(dir.path());
        let ClaimOutcome::Claimed(handle) = claim(&first, &key) else {
            panic!("first claim must succeed");
        };
        assert!(handle.persisted);

        // A fresh instance over the same directory sees the marker.
        let restarted = EgressDeduplicator::new(dir.path());
        assert!(matches!(claim(&restarted, &key), ClaimOutcome::AlreadyClaimed));

        let raw = std::fs::read_to_string(&handle.path).unwrap();
        let marker: EgressMarker = serde_json::from_str(&raw).unwrap();
        assert_eq!(marker.status, ClaimStatus::Inflight);
        assert_eq!(marker.message_key, key);
        assert!(raw.contains("\"chatId\""));
    }

    #[test]
    fn release_makes_key_claimable_again() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = EgressDeduplicator::new(dir.path());
        let key = message_key("m1", "hi");

        let ClaimOutcome::Claimed(handle) = claim(&dedup, &key) else {
            panic!("claim must succeed");
        };
        dedup.release(&handle);
        assert!(matches!(claim(&dedup, &key), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn mark_delivered_rewrites_marker() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = EgressDeduplicator::new(dir.path());
        let ClaimOutcome::Claimed(mut handle) = claim(&dedup, "k") else {
            panic!("claim must succeed");
        };
        dedup.mark_delivered(&mut handle);

        let marker: EgressMarker =
            serde_json::from_str(&std::fs::read_to_string(&handle.path).unwrap()).unwrap();
        assert_eq!(marker.status, ClaimStatus::Delivered);
        assert!(marker.delivered_at.is_some());
        assert!(matches!(claim(&dedup, "k"), ClaimOutcome::AlreadyClaimed));
    }

    #[test]
    fn unwritable_storage_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("egress");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let dedup = EgressDeduplicator::new(&blocker);
        let ClaimOutcome::Claimed(handle) = claim(&dedup, "k") else {
            panic!("fail-open claim expected");
        };
        assert!(!handle.persisted);
    }

    #[test]
    fn prune_removes_only_old_markers() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = EgressDeduplicator::new(dir.path());

        let ClaimOutcome::Claimed(mut old) = claim(&dedup, "old") else {
            panic!("claim must succeed");
        };
        old.marker.claimed_at = Utc::now() - chrono::Duration::hours(100);
        write_atomic(&old.path, &serde_json::to_vec(&old.marker).unwrap()).unwrap();
        assert!(matches!(claim(&dedup, "fresh"), ClaimOutcome::Claimed(_)));

        assert_eq!(dedup.count_older_than(chrono::Duration::hours(72)).unwrap(), 1);
        let removed = dedup.prune_older_than(chrono::Duration::hours(72)).unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(claim(&dedup, "old"), ClaimOutcome::Claimed(_)));
        assert!(matches!(claim(&dedup, "fresh"), ClaimOutcome::AlreadyClaimed));
    }

    /// Records sends; fails the first `fail_first` attempts.
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
        fail_first: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ChannelSender for RecordingSender {
        async fn send_text(&self, _chat_id: &str, text: &str, _opts: &SendOptions) -> SendResult {
            let mut fail = self.fail_first.lock();
            if *fail > 0 {
                *fail -= 1;
                return SendResult::failed("platform down");
            }
            self.sent.lock().push(text.to_owned());
            SendResult::ok()
        }
    }

    fn guarded(dir: &Path, fail_first: usize) -> (GuardedSender, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
            fail_first: Mutex::new(fail_first),
        });
        let mut router = OutboundRouter::new();
        router.bind("telegram", sender.clone());
        let guard = GuardedSender::new(Some(EgressDeduplicator::new(dir)), Arc::new(router));
        (guard, sender)
    }

    #[tokio::test]
    async fn identical_reply_is_sent_once() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, sender) = guarded(dir.path(), 0);
        let opts = SendOptions::default();

        let first = guard.send("telegram", "c1", Some("m1"), "hello", &opts).await;
        let second = guard.send("telegram", "c1", Some("m1"), "hello", &opts).await;
        let other = guard.send("telegram", "c1", Some("m1"), "different", &opts).await;

        assert_eq!(first, SendOutcome::Sent);
        assert_eq!(second, SendOutcome::Duplicate);
        assert_eq!(other, SendOutcome::Sent);
        assert_eq!(*sender.sent.lock(), vec!["hello", "different"]);
    }

    #[tokio::test]
    async fn replies_without_inbound_id_are_never_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, sender) = guarded(dir.path(), 0);
        let opts = SendOptions::default();

        let first = guard.send("telegram", "c1", None, "4", &opts).await;
        let second = guard.send("telegram", "c1", None, "4", &opts).await;

        assert_eq!(first, SendOutcome::Sent);
        assert_eq!(second, SendOutcome::Sent);
        assert_eq!(*sender.sent.lock(), vec!["4", "4"]);
        assert!(!dir.path().join("telegram").exists());
    }

    #[tokio::test]
    async fn failed_send_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, sender) = guarded(dir.path(), 1);
        let opts = SendOptions::default();

        let first = guard.send("telegram", "c1", Some("m1"), "hello", &opts).await;
        assert!(matches!(first, SendOutcome::Failed(ref e) if e == "platform down"));

        let retry = guard.send("telegram", "c1", Some("m1"), "hello", &opts).await;
        assert_eq!(retry, SendOutcome::Sent);
        assert_eq!(sender.sent.lock().len(), 1);
    }
}
