//! Lane scheduler: per-session ordering, bounded global concurrency.
//!
//! Flow for one inbound event:
//!
//! 1. [`LaneScheduler::ingest`] resolves the session, writes the user
//!    record to the ledger (exec and audit items) and enqueues the item.
//! 2. [`LaneScheduler::enqueue`] pushes onto the session's lane and pumps
//!    the dispatcher.
//! 3. The pump claims free slots and spawns one supervised `process_one`
//!    task per runnable lane.  When a task ends its lane is released,
//!    re-queued at the back if it still has backlog, and the pump runs
//!    again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use la_domain::config::LanesConfig;
use la_domain::error::{Error, Result};
use la_domain::inbound::{ControlAction, InboundEvent, QueueItem, QueueKind};
use la_domain::message::{LedgerMessage, Role};
use la_domain::trace::TraceEvent;
use la_memory::MemoryCurator;
use la_sessions::{resolve_session_id, Ledger};

use super::agent::{Agent, AgentTurn};
use super::drainer::LaneBurst;
use super::egress::{GuardedSender, SendOutcome};
use super::lanes::{EnqueueReceipt, LaneQueue, LaneStats};
use super::outbound::SendOptions;

/// Returned from [`LaneScheduler::ingest`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub item_id: String,
    pub session_id: String,
    pub kind: QueueKind,
    /// Global ledger index of the user record, when one was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_index: Option<usize>,
    #[serde(flatten)]
    pub receipt: EnqueueReceipt,
}

/// Cheap to clone; all clones drive the same lanes.
#[derive(Clone)]
pub struct LaneScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: Arc<LaneQueue>,
    cfg: LanesConfig,
    agent: Arc<dyn Agent>,
    ledger: Ledger,
    egress: GuardedSender,
    curator: Option<MemoryCurator>,
    /// Serializes ledger append + enqueue per session so ledger order and
    /// lane order agree.
    ingest_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    idle: Notify,
}

impl LaneScheduler {
    pub fn new(
        cfg: LanesConfig,
        agent: Arc<dyn Agent>,
        ledger: Ledger,
        egress: GuardedSender,
        curator: Option<MemoryCurator>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Arc::new(LaneQueue::new()),
                cfg,
                agent,
                ledger,
                egress,
                curator,
                ingest_locks: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Intake
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Record and enqueue one inbound event.
    ///
    /// A failed ledger append is returned to the caller and nothing is
    /// enqueued.
    pub async fn ingest(&self, event: InboundEvent) -> Result<IngestReceipt> {
        let session_id = resolve_session_id(&event);
        let mut item = QueueItem::from_event(event, session_id.clone());

        let lock = self.ingest_lock(&session_id);
        let guard = lock.lock().await;

        let mut total = None;
        if matches!(item.kind, QueueKind::Exec | QueueKind::Audit) {
            let record = user_record(&item);
            let count = self.inner.ledger.append_async(record).await?;
            item.ledger_index = Some(count.saturating_sub(1));
            total = Some(count);
        }

        let item_id = item.id.clone();
        let kind = item.kind;
        let ledger_index = item.ledger_index;
        let receipt = self.enqueue(item);

        drop(guard);
        self.release_ingest_lock(&session_id, lock);

        if let (Some(curator), Some(total)) = (&self.inner.curator, total) {
            curator.notify_appended(&session_id, total);
        }

        Ok(IngestReceipt {
            item_id,
            session_id,
            kind,
            ledger_index,
            receipt,
        })
    }

    /// Push an already-stamped item onto its lane and start work if a slot
    /// is free.  Does not touch the ledger.
    pub fn enqueue(&self, item: QueueItem) -> EnqueueReceipt {
        let session_id = item.session_id.clone();
        let kind = item.kind;
        let is_clear = item.control == Some(ControlAction::Clear);

        let receipt = self.inner.queue.push(item);

        TraceEvent::LaneEnqueued {
            session_id: session_id.clone(),
            kind: kind_label(kind).to_owned(),
            lane_pending: receipt.lane_pending,
            pending_total: receipt.pending_total,
        }
        .emit();
        if is_clear {
            TraceEvent::LaneCleared {
                session_id,
                dropped: receipt.dropped,
            }
            .emit();
        }

        self.pump();
        receipt
    }

    pub fn stats(&self) -> LaneStats {
        self.inner.queue.stats()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.queue.is_busy()
    }

    /// Resolves once nothing is pending or running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.queue.is_busy() {
                return;
            }
            notified.await;
        }
    }

    fn ingest_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .ingest_locks
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }

    fn release_ingest_lock(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.inner.ingest_locks.lock();
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(session_id);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn pump(&self) {
        let max = self.inner.cfg.max_concurrency.max(1);
        while let Some(item) = self.inner.queue.next_dispatch(max) {
            let session_id = item.session_id.clone();

            TraceEvent::LaneDispatched {
                session_id: session_id.clone(),
                item_id: item.id.clone(),
                running_total: self.inner.queue.stats().running_total,
            }
            .emit();

            let worker = tokio::spawn({
                let this = self.clone();
                async move { this.process_one(item).await }
            });

            // Supervisor: the lane is released even if the worker panics.
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.await {
                    tracing::error!(session_id = %session_id, error = %e, "lane task panicked");
                }
                this.inner.queue.finish(&session_id);
                if !this.inner.queue.is_busy() {
                    this.inner.idle.notify_waiters();
                }
                this.pump();
            });
        }
    }

    async fn process_one(&self, item: QueueItem) {
        match item.kind {
            QueueKind::Exec => self.run_exec(item).await,
            QueueKind::Audit => {
                tracing::info!(
                    session_id = %item.session_id,
                    item_id = %item.id,
                    ledger_index = ?item.ledger_index,
                    "audit item recorded"
                );
            }
            QueueKind::Control => match item.control {
                Some(ControlAction::Clear) => self.run_clear(&item).await,
                None => {
                    tracing::warn!(session_id = %item.session_id, item_id = %item.id, "control item without action ignored");
                }
            },
        }
    }

    // ── exec ──────────────────────────────────────────────────────────

    async fn run_exec(&self, item: QueueItem) {
        let inner = &self.inner;
        let session_id = item.session_id.clone();
        let channel = item.channel.clone();

        let burst = LaneBurst::new(
            inner.queue.clone(),
            &item,
            inner.cfg.correction_max_rounds,
            inner.cfg.correction_max_merged_messages,
        );
        let turn = AgentTurn { head: item };

        let result = match inner.cfg.turn_timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), inner.agent.run(&turn, &burst))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!("agent turn exceeded {secs}s"))),
                }
            }
            None => inner.agent.run(&turn, &burst).await,
        };

        let text = match result {
            Ok(reply) => reply.text,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    item_id = %turn.head.id,
                    merged = burst.merged_count(),
                    error = %e,
                    "agent turn failed"
                );
                match e.partial_output() {
                    Some(partial) => partial.to_owned(),
                    None => return,
                }
            }
        };
        if text.trim().is_empty() {
            tracing::debug!(session_id = %session_id, "agent returned no reply");
            return;
        }

        let addr = burst.addressing();
        let record = LedgerMessage::new(&channel, &session_id, Role::Assistant, &text)
            .with_thread(addr.thread_id.clone())
            .with_metadata(serde_json::json!({
                "replyTo": addr.message_id,
                "merged": burst.merged_count(),
            }));
        let total = match inner.ledger.append_async(record).await {
            Ok(total) => Some(total),
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "assistant record not persisted");
                None
            }
        };

        let opts = SendOptions {
            thread_id: addr.thread_id.clone(),
            reply_to: addr.message_id.clone(),
        };
        match inner
            .egress
            .send(&channel, &addr.target_id, addr.message_id.as_deref(), &text, &opts)
            .await
        {
            SendOutcome::Sent => {
                tracing::debug!(session_id = %session_id, chat_id = %addr.target_id, "reply delivered");
            }
            SendOutcome::Duplicate => {
                tracing::info!(session_id = %session_id, chat_id = %addr.target_id, "duplicate reply suppressed");
            }
            SendOutcome::Failed(error) => {
                tracing::warn!(session_id = %session_id, chat_id = %addr.target_id, error = %error, "reply delivery failed");
            }
        }

        if let (Some(curator), Some(total)) = (&inner.curator, total) {
            curator.notify_appended(&session_id, total);
        }
    }

    // ── control: clear ────────────────────────────────────────────────

    async fn run_clear(&self, item: &QueueItem) {
        let inner = &self.inner;
        let sid = item.session_id.as_str();

        match inner.ledger.clear_async(sid).await {
            Ok(Some(segment)) => {
                tracing::info!(session_id = sid, segment = %segment.id, archived = segment.end - segment.start, "ledger cleared");
            }
            Ok(None) => tracing::debug!(session_id = sid, "ledger already empty"),
            Err(e) => tracing::warn!(session_id = sid, error = %e, "clearing ledger failed"),
        }

        if let Some(curator) = &inner.curator {
            if let Err(e) = curator.skip_to_current(sid).await {
                tracing::warn!(session_id = sid, error = %e, "resetting memory watermark failed");
            }
        }

        if let Err(e) = inner.agent.reset_session(sid).await {
            tracing::warn!(session_id = sid, error = %e, "agent session reset failed");
        }
    }
}

fn user_record(item: &QueueItem) -> LedgerMessage {
    let mut meta = serde_json::Map::new();
    meta.insert("itemId".into(), item.id.clone().into());
    if item.kind == QueueKind::Audit {
        meta.insert("kind".into(), "audit".into());
    }
    if let Some(name) = &item.actor_name {
        meta.insert("actorName".into(), name.clone().into());
    }
    LedgerMessage::new(&item.channel, &item.session_id, Role::User, &item.text)
        .with_actor(item.actor_id.clone())
        .with_message_id(item.message_id.clone())
        .with_thread(item.thread_id.clone())
        .with_metadata(serde_json::Value::Object(meta))
}

fn kind_label(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Exec => "exec",
        QueueKind::Audit => "audit",
        QueueKind::Control => "control",
    }
}
