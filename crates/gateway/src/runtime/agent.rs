//! The agent seam.
//!
//! The scheduler owns ordering, persistence and delivery; an [`Agent`] only
//! turns one lane head (plus any corrections it chooses to drain) into a
//! reply.  [`LlmAgent`] is the reference implementation: memory record plus
//! recent ledger history plus the user's messages, sent to one model call.

use std::sync::Arc;

use la_domain::error::{Error, Result};
use la_domain::inbound::QueueItem;
use la_domain::message::{ChatMessage, LedgerMessage};
use la_memory::MemoryStore;
use la_providers::{ChatRequest, LlmProvider};
use la_sessions::Ledger;

use super::drainer::LaneDrainer;

/// One agent invocation: the lane head that started it.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub head: QueueItem,
}

impl AgentTurn {
    pub fn session_id(&self) -> &str {
        &self.head.session_id
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    pub text: String,
}

#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Produce a reply for `turn`.  `drainer` yields follow-up messages the
    /// user sent to the same lane since the turn started.
    ///
    /// On failure, return [`Error::Agent`] with any partial output so the
    /// scheduler can still record and deliver it.
    async fn run(&self, turn: &AgentTurn, drainer: &dyn LaneDrainer) -> Result<AgentReply>;

    /// Drop session-scoped state after a `clear`.
    async fn reset_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reference LLM agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant in a chat conversation. \
Answer the user's latest messages. When the user sent several messages in a row, \
treat the later ones as corrections or additions to the earlier ones and reply once.";

pub struct LlmAgent {
    provider: Arc<dyn LlmProvider>,
    ledger: Ledger,
    memory: MemoryStore,
    history_entries: usize,
    system_prompt: String,
    model: Option<String>,
}

impl LlmAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        ledger: Ledger,
        memory: MemoryStore,
        history_entries: usize,
    ) -> Self {
        Self {
            provider,
            ledger,
            memory,
            history_entries,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            model: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Ledger records preceding the head item.  Items written at ingest
    /// carry their index, so records of messages still queued behind the
    /// head never leak into the context.  The window never reaches back past
    /// the last clear.
    async fn history(&self, head: &QueueItem) -> Result<Vec<LedgerMessage>> {
        if self.history_entries == 0 {
            return Ok(Vec::new());
        }
        match head.ledger_index {
            Some(idx) => {
                let start = self.ledger.session_start_async(&head.session_id).await?;
                let from = idx.saturating_sub(self.history_entries).max(start);
                self.ledger
                    .load_range_async(&head.session_id, from, idx)
                    .await
            }
            None => {
                self.ledger
                    .load_recent_async(&head.session_id, self.history_entries)
                    .await
            }
        }
    }

    /// Pinned records that fell out of the history window.
    async fn pinned(&self, head: &QueueItem, history: &[LedgerMessage]) -> Vec<LedgerMessage> {
        let pinned = match self.ledger.load_pinned_async(&head.session_id).await {
            Ok(pinned) => pinned,
            Err(e) => {
                tracing::warn!(session_id = %head.session_id, error = %e, "pinned records unreadable");
                return Vec::new();
            }
        };
        let before = head.ledger_index.unwrap_or(usize::MAX);
        pinned
            .into_iter()
            .filter(|(idx, _)| *idx < before)
            .map(|(_, m)| m)
            .filter(|m| !history.iter().any(|h| h.message_id == m.message_id))
            .collect()
    }

    async fn memory_record(&self, session_id: &str) -> Result<String> {
        let store = self.memory.clone();
        let sid = session_id.to_owned();
        tokio::task::spawn_blocking(move || store.read_primary(&sid))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }

    fn system_message(&self, memory: &str) -> ChatMessage {
        let memory = memory.trim();
        if memory.is_empty() {
            return ChatMessage::system(self.system_prompt.clone());
        }
        ChatMessage::system(format!(
            "{}\n\n## What you remember about this conversation\n\n{memory}",
            self.system_prompt
        ))
    }
}

#[async_trait::async_trait]
impl Agent for LlmAgent {
    async fn run(&self, turn: &AgentTurn, drainer: &dyn LaneDrainer) -> Result<AgentReply> {
        let sid = turn.session_id();

        // Absorb everything the user added while the turn was waiting.
        let mut corrections = Vec::new();
        loop {
            let out = drainer.drain();
            if out.drained == 0 {
                break;
            }
            corrections.extend(out.messages);
        }

        let memory = match self.memory_record(sid).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(session_id = sid, error = %e, "memory record unreadable, continuing without it");
                String::new()
            }
        };
        let history = self.history(&turn.head).await.map_err(|e| Error::Agent {
            message: format!("loading history: {e}"),
            partial: None,
        })?;

        let pinned = self.pinned(&turn.head, &history).await;

        let mut messages =
            Vec::with_capacity(pinned.len() + history.len() + corrections.len() + 2);
        messages.push(self.system_message(&memory));
        messages.extend(pinned.iter().map(ChatMessage::from));
        messages.extend(history.iter().map(ChatMessage::from));
        messages.push(ChatMessage::user(turn.head.text.clone()));
        messages.extend(corrections.iter().map(|c| ChatMessage::user(c.text.clone())));

        tracing::debug!(
            session_id = sid,
            history = history.len(),
            pinned = pinned.len(),
            corrections = corrections.len(),
            "calling model"
        );

        let req = ChatRequest {
            messages,
            temperature: Some(0.4),
            max_tokens: None,
            json_mode: false,
            model: self.model.clone(),
        };
        let resp = self.provider.chat(&req).await.map_err(|e| Error::Agent {
            message: e.to_string(),
            partial: None,
        })?;

        Ok(AgentReply {
            text: resp.content.trim().to_owned(),
        })
    }

    /// Snapshot the memory record into `backup/` and start over empty.
    async fn reset_session(&self, session_id: &str) -> Result<()> {
        let store = self.memory.clone();
        let sid = session_id.to_owned();
        let backup = tokio::task::spawn_blocking(move || store.archive_primary(&sid))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;
        if let Some(path) = backup {
            tracing::info!(session_id, backup = %path.display(), "memory record archived");
        }
        Ok(())
    }
}
