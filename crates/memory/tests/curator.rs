use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use la_domain::config::{LedgerConfig, MemoryConfig};
use la_domain::error::{Error, Result};
use la_domain::message::{LedgerMessage, Role};
use la_memory::{MemoryCurator, MemoryStore};
use la_providers::{ChatRequest, ChatResponse, LlmProvider};
use la_sessions::Ledger;

/// Replays canned replies and records every prompt it was sent.
#[derive(Default)]
struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let prompt = req
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().push(prompt);
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Other("script exhausted".into())))?;
        Ok(ChatResponse {
            content: reply,
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    ledger: Ledger,
    curator: MemoryCurator,
    provider: Arc<ScriptedProvider>,
}

fn fixture(
    replies: Vec<Result<String>>,
    memory: MemoryConfig,
    ledger_cfg: LedgerConfig,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::new(&dir.path().join("sessions"));
    let store = MemoryStore::new(&dir.path().join("memory"));
    let provider = ScriptedProvider::new(replies);
    let curator = MemoryCurator::new(
        store,
        ledger.clone(),
        provider.clone(),
        None,
        memory,
        ledger_cfg,
    );
    Fixture {
        _dir: dir,
        ledger,
        curator,
        provider,
    }
}

fn small_memory() -> MemoryConfig {
    MemoryConfig {
        extract_min_entries: 4,
        ..Default::default()
    }
}

fn seed(ledger: &Ledger, sid: &str, from: usize, to: usize) -> usize {
    let mut total = 0;
    for i in from..to {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        total = ledger
            .append(&LedgerMessage::new("api", sid, role, &format!("turn-{i}")))
            .unwrap();
    }
    total
}

fn json_reply(summary: &str) -> Result<String> {
    Ok(format!(
        r#"{{"summary": "{summary}", "keyFacts": ["fact from {summary}"]}}"#
    ))
}

#[tokio::test]
async fn below_threshold_does_nothing() {
    let fx = fixture(vec![], small_memory(), LedgerConfig::default());
    seed(&fx.ledger, "s", 0, 3);

    let outcome = fx.curator.maintain("s").await.unwrap();
    assert_eq!(outcome.extracted, None);
    assert!(fx.provider.prompts().is_empty());
}

#[tokio::test]
async fn watermark_is_never_reprocessed() {
    let fx = fixture(
        vec![json_reply("first"), json_reply("second")],
        small_memory(),
        LedgerConfig::default(),
    );

    seed(&fx.ledger, "s", 0, 5);
    let first = fx.curator.maintain("s").await.unwrap();
    assert_eq!(first.extracted, Some((0, 5)));

    // Nothing new: no model call.
    let again = fx.curator.maintain("s").await.unwrap();
    assert_eq!(again.extracted, None);
    assert_eq!(fx.provider.prompts().len(), 1);

    seed(&fx.ledger, "s", 5, 9);
    let second = fx.curator.maintain("s").await.unwrap();
    assert_eq!(second.extracted, Some((5, 9)));

    let prompts = fx.provider.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("turn-5"));
    assert!(!prompts[1].contains("turn-4"));

    let (record, meta) = fx.curator.snapshot("s").await.unwrap();
    assert_eq!(meta.last_memorized_entry_count, 9);
    assert_eq!(meta.total_extractions, 2);
    assert!(record.contains("- fact from first"));
    assert!(record.contains("(entries 5..9)"));
}

#[tokio::test]
async fn malformed_output_becomes_summary() {
    let fx = fixture(
        vec![Ok("The user greeted the bot and asked about tea.".into())],
        small_memory(),
        LedgerConfig::default(),
    );
    seed(&fx.ledger, "s", 0, 4);

    let outcome = fx.curator.maintain("s").await.unwrap();
    assert_eq!(outcome.extracted, Some((0, 4)));
    let (record, _) = fx.curator.snapshot("s").await.unwrap();
    assert!(record.contains("asked about tea"));
}

#[tokio::test]
async fn model_failure_leaves_memory_untouched() {
    let fx = fixture(
        vec![Err(Error::Http("connection reset".into()))],
        small_memory(),
        LedgerConfig::default(),
    );
    seed(&fx.ledger, "s", 0, 6);

    assert!(fx.curator.maintain("s").await.is_err());
    let (record, meta) = fx.curator.snapshot("s").await.unwrap();
    assert!(record.is_empty());
    assert_eq!(meta.last_memorized_entry_count, 0);
}

#[tokio::test]
async fn compression_backs_up_before_overwrite() {
    let memory = MemoryConfig {
        extract_min_entries: 2,
        max_primary_chars: 50,
        ..Default::default()
    };
    let long_summary = "a".repeat(80);
    let fx = fixture(
        vec![json_reply(&long_summary), Ok("## Compressed\n\n- short".into())],
        memory,
        LedgerConfig::default(),
    );
    seed(&fx.ledger, "s", 0, 2);

    let outcome = fx.curator.maintain("s").await.unwrap();
    assert!(outcome.compressed);

    let store = fx.curator.store();
    let backups = store.list_backups("s").unwrap();
    assert_eq!(backups.len(), 1);
    let backup = std::fs::read_to_string(&backups[0]).unwrap();
    assert!(backup.contains(&long_summary));

    let (record, meta) = fx.curator.snapshot("s").await.unwrap();
    assert_eq!(record.trim(), "## Compressed\n\n- short");
    assert_eq!(meta.total_compressions, 1);
    assert_eq!(meta.last_memorized_entry_count, 2);
}

#[tokio::test]
async fn failed_compression_keeps_record() {
    let memory = MemoryConfig {
        extract_min_entries: 2,
        max_primary_chars: 50,
        ..Default::default()
    };
    let long_summary = "b".repeat(80);
    let fx = fixture(
        vec![json_reply(&long_summary), Err(Error::Timeout("slow".into()))],
        memory,
        LedgerConfig::default(),
    );
    seed(&fx.ledger, "s", 0, 2);

    let outcome = fx.curator.maintain("s").await.unwrap();
    assert_eq!(outcome.extracted, Some((0, 2)));
    assert!(!outcome.compressed);

    let (record, _) = fx.curator.snapshot("s").await.unwrap();
    assert!(record.contains(&long_summary));
    assert!(fx.curator.store().list_backups("s").unwrap().is_empty());
}

#[tokio::test]
async fn extraction_compacts_long_ledgers() {
    let ledger_cfg = LedgerConfig {
        auto_compact: true,
        max_active_entries: 10,
        keep_recent_entries: 4,
    };
    let fx = fixture(vec![json_reply("bulk")], small_memory(), ledger_cfg);
    seed(&fx.ledger, "s", 0, 12);

    let outcome = fx.curator.maintain("s").await.unwrap();
    let segment = outcome.compacted.expect("ledger should be compacted");
    assert_eq!((segment.start, segment.end), (0, 8));
    assert_eq!(segment.reason, "memorized");

    assert_eq!(fx.ledger.active_len("s").unwrap(), 4);
    assert_eq!(fx.ledger.total_message_count("s").unwrap(), 12);
    let archived = fx.ledger.load_range("s", 0, 2).unwrap();
    assert_eq!(archived[0].text, "turn-0");
}

#[tokio::test]
async fn skip_to_current_hides_cleared_turns() {
    let fx = fixture(vec![json_reply("after clear")], small_memory(), LedgerConfig::default());
    seed(&fx.ledger, "s", 0, 6);
    fx.ledger.clear("s").unwrap();

    let meta = fx.curator.skip_to_current("s").await.unwrap();
    assert_eq!(meta.last_memorized_entry_count, 6);

    seed(&fx.ledger, "s", 6, 10);
    fx.curator.maintain("s").await.unwrap();
    let prompts = fx.provider.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("turn-6"));
    assert!(!prompts[0].contains("turn-5"));
}

#[tokio::test]
async fn notify_runs_one_detached_pass() {
    let fx = fixture(vec![json_reply("bg")], small_memory(), LedgerConfig::default());
    let total = seed(&fx.ledger, "s", 0, 5);

    assert!(fx.curator.notify_appended("s", total));
    // A second notification while the first pass is running is a no-op.
    assert!(!fx.curator.notify_appended("s", total));

    for _ in 0..200 {
        if fx.curator.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fx.curator.in_flight(), 0);

    let (_, meta) = fx.curator.snapshot("s").await.unwrap();
    assert_eq!(meta.last_memorized_entry_count, 5);

    // Watermark is cached now: below threshold, nothing is spawned.
    assert!(!fx.curator.notify_appended("s", total + 1));
}

#[tokio::test]
async fn disabled_memory_never_spawns() {
    let memory = MemoryConfig {
        enabled: false,
        ..small_memory()
    };
    let fx = fixture(vec![], memory, LedgerConfig::default());
    assert!(!fx.curator.notify_appended("s", 100));
}
