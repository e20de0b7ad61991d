//! Correction merging.
//!
//! While an agent is working on a lane's head item, the user may keep
//! typing ("wait, make it about cats").  The agent can pull those follow-ups
//! into the running turn through a [`LaneDrainer`] instead of answering each
//! one separately.  [`LaneBurst`] is the drainer handed out by the
//! scheduler: it bounds how many rounds and items a single turn may absorb.

use std::sync::Arc;

use parking_lot::Mutex;

use la_domain::inbound::QueueItem;
use la_domain::trace::TraceEvent;

use super::lanes::LaneQueue;

/// Result of one drain call.
#[derive(Debug, Clone, Default)]
pub struct DrainOutcome {
    pub drained: usize,
    pub messages: Vec<QueueItem>,
}

/// Pulls pending follow-up items of the current lane into a running turn.
pub trait LaneDrainer: Send + Sync {
    /// Remove and return consecutive leading `exec` items of the lane.
    /// Returns an empty outcome once the round budget is spent.
    fn drain(&self) -> DrainOutcome;
}

/// Reply addressing: moves to the newest merged item so the answer lands
/// under the user's latest message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Addressing {
    pub target_id: String,
    pub actor_id: Option<String>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
}

impl Addressing {
    pub fn of(item: &QueueItem) -> Self {
        Self {
            target_id: item.target_id.clone(),
            actor_id: item.actor_id.clone(),
            message_id: item.message_id.clone(),
            thread_id: item.thread_id.clone(),
        }
    }
}

struct BurstState {
    rounds: usize,
    merged: usize,
    addressing: Addressing,
}

/// Drainer bound to one lane for the duration of one turn.
pub struct LaneBurst {
    queue: Arc<LaneQueue>,
    session_id: String,
    max_rounds: usize,
    max_per_round: usize,
    state: Mutex<BurstState>,
}

impl LaneBurst {
    pub fn new(
        queue: Arc<LaneQueue>,
        head: &QueueItem,
        max_rounds: usize,
        max_per_round: usize,
    ) -> Self {
        Self {
            queue,
            session_id: head.session_id.clone(),
            max_rounds,
            max_per_round,
            state: Mutex::new(BurstState {
                rounds: 0,
                merged: 0,
                addressing: Addressing::of(head),
            }),
        }
    }

    pub fn addressing(&self) -> Addressing {
        self.state.lock().addressing.clone()
    }

    pub fn merged_count(&self) -> usize {
        self.state.lock().merged
    }

    pub fn rounds(&self) -> usize {
        self.state.lock().rounds
    }
}

impl LaneDrainer for LaneBurst {
    fn drain(&self) -> DrainOutcome {
        let mut state = self.state.lock();
        if state.rounds >= self.max_rounds || self.max_per_round == 0 {
            return DrainOutcome::default();
        }

        let messages = self
            .queue
            .drain_leading_exec(&self.session_id, self.max_per_round);
        if messages.is_empty() {
            return DrainOutcome::default();
        }

        state.rounds += 1;
        state.merged += messages.len();
        if let Some(last) = messages.last() {
            state.addressing = Addressing::of(last);
        }

        TraceEvent::LaneMerged {
            session_id: self.session_id.clone(),
            round: state.rounds,
            drained: messages.len(),
        }
        .emit();

        DrainOutcome {
            drained: messages.len(),
            messages,
        }
    }
}

/// Drainer that never yields anything.
pub struct NoDrain;

impl LaneDrainer for NoDrain {
    fn drain(&self) -> DrainOutcome {
        DrainOutcome::default()
    }
}
