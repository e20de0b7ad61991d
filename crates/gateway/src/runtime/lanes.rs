//! Per-session FIFO lanes.
//!
//! One lane per session id.  A lane is either idle, runnable (waiting for a
//! concurrency slot) or running (its head item is being processed).  All
//! lanes live behind a single mutex that is only held for short,
//! non-blocking bookkeeping and never across an `.await`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use la_domain::inbound::{ControlAction, QueueItem, QueueKind};

/// Returned from every enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    /// Items ahead of this one in its lane, counting a running turn.
    pub lane_position: usize,
    /// Items waiting in the lane after this enqueue.
    pub lane_pending: usize,
    /// Items waiting across all lanes.
    pub pending_total: usize,
    /// Pending items discarded because this item was a clear.
    #[serde(skip_serializing_if = "is_zero")]
    pub dropped: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Read-only view for `/v1/lanes/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub lanes: usize,
    pub pending_total: usize,
    pub running_total: usize,
    pub pending_by_channel: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Lane {
    items: VecDeque<QueueItem>,
    running: bool,
    /// Present in `QueueState::runnable`.
    runnable: bool,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    /// Lanes waiting for a slot, oldest first.
    runnable: VecDeque<String>,
    running: usize,
}

impl QueueState {
    fn pending_total(&self) -> usize {
        self.lanes.values().map(|l| l.items.len()).sum()
    }
}

/// The lane table.  Dispatch policy lives in the scheduler; this type only
/// keeps the bookkeeping consistent.
#[derive(Default)]
pub struct LaneQueue {
    state: Mutex<QueueState>,
}

impl LaneQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` to its session's lane.
    ///
    /// A `control: clear` item first discards every pending item of the
    /// lane; the turn currently running (if any) is left alone.
    pub fn push(&self, item: QueueItem) -> EnqueueReceipt {
        let mut st = self.state.lock();
        let sid = item.session_id.clone();
        let is_clear =
            item.kind == QueueKind::Control && item.control == Some(ControlAction::Clear);

        let lane = st.lanes.entry(sid.clone()).or_default();
        let dropped = if is_clear {
            let n = lane.items.len();
            lane.items.clear();
            n
        } else {
            0
        };

        let lane_position = lane.items.len() + usize::from(lane.running);
        lane.items.push_back(item);
        let lane_pending = lane.items.len();

        let mark_runnable = !lane.running && !lane.runnable;
        if mark_runnable {
            lane.runnable = true;
            st.runnable.push_back(sid);
        }

        EnqueueReceipt {
            lane_position,
            lane_pending,
            pending_total: st.pending_total(),
            dropped,
        }
    }

    /// Claim a slot and take the head item of the next runnable lane.
    ///
    /// Returns `None` when `max_running` slots are taken or nothing is
    /// runnable.  The returned item's lane stays marked running until
    /// [`finish`](Self::finish) is called.
    pub fn next_dispatch(&self, max_running: usize) -> Option<QueueItem> {
        let mut st = self.state.lock();
        if st.running >= max_running {
            return None;
        }

        while let Some(sid) = st.runnable.pop_front() {
            let Some(lane) = st.lanes.get_mut(&sid) else {
                continue;
            };
            lane.runnable = false;
            if lane.running {
                continue;
            }
            let Some(item) = lane.items.pop_front() else {
                st.lanes.remove(&sid);
                continue;
            };
            lane.running = true;
            st.running += 1;
            return Some(item);
        }
        None
    }

    /// Release the slot held by `session_id`'s lane.  A lane with backlog
    /// goes to the back of the runnable queue.
    pub fn finish(&self, session_id: &str) {
        let mut st = self.state.lock();
        let Some(lane) = st.lanes.get_mut(session_id) else {
            return;
        };
        if !lane.running {
            return;
        }
        lane.running = false;

        let requeue = if lane.items.is_empty() {
            st.lanes.remove(session_id);
            false
        } else if !lane.runnable {
            lane.runnable = true;
            true
        } else {
            false
        };
        if requeue {
            st.runnable.push_back(session_id.to_owned());
        }
        st.running = st.running.saturating_sub(1);
    }

    /// Remove up to `max` consecutive leading `exec` items of a lane.
    pub fn drain_leading_exec(&self, session_id: &str, max: usize) -> Vec<QueueItem> {
        let mut st = self.state.lock();
        let Some(lane) = st.lanes.get_mut(session_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < max {
            match lane.items.front() {
                Some(front) if front.kind == QueueKind::Exec => {
                    if let Some(item) = lane.items.pop_front() {
                        out.push(item);
                    }
                }
                _ => break,
            }
        }
        out
    }

    /// Discard every pending item of a lane.  Returns how many were dropped.
    pub fn drop_pending(&self, session_id: &str) -> usize {
        let mut st = self.state.lock();
        match st.lanes.get_mut(session_id) {
            Some(lane) => {
                let n = lane.items.len();
                lane.items.clear();
                n
            }
            None => 0,
        }
    }

    pub fn stats(&self) -> LaneStats {
        let st = self.state.lock();
        let mut pending_by_channel = BTreeMap::new();
        for item in st.lanes.values().flat_map(|l| l.items.iter()) {
            *pending_by_channel.entry(item.channel.clone()).or_insert(0) += 1;
        }
        LaneStats {
            lanes: st.lanes.len(),
            pending_total: st.pending_total(),
            running_total: st.running,
            pending_by_channel,
        }
    }

    /// Anything pending or running.
    pub fn is_busy(&self) -> bool {
        let st = self.state.lock();
        st.running > 0 || st.lanes.values().any(|l| !l.items.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(sid: &str, text: &str) -> QueueItem {
        QueueItem::exec("api", "t", sid, text)
    }

    #[test]
    fn receipt_counts_running_head() {
        let q = LaneQueue::new();
        let first = q.push(exec("s", "a"));
        assert_eq!((first.lane_position, first.lane_pending, first.pending_total), (0, 1, 1));

        q.next_dispatch(4).unwrap();
        let second = q.push(exec("s", "b"));
        assert_eq!(second.lane_position, 1);
        assert_eq!(second.lane_pending, 1);
    }

    #[test]
    fn one_running_item_per_lane() {
        let q = LaneQueue::new();
        q.push(exec("s", "a"));
        q.push(exec("s", "b"));
        assert_eq!(q.next_dispatch(4).unwrap().text, "a");
        assert!(q.next_dispatch(4).is_none());

        q.finish("s");
        assert_eq!(q.next_dispatch(4).unwrap().text, "b");
        q.finish("s");
        assert!(!q.is_busy());
        assert_eq!(q.stats().lanes, 0);
    }

    #[test]
    fn slots_are_bounded_and_lanes_rotate() {
        let q = LaneQueue::new();
        for sid in ["a", "b", "c"] {
            q.push(exec(sid, "x"));
            q.push(exec(sid, "y"));
        }
        let got: Vec<String> = (0..2)
            .filter_map(|_| q.next_dispatch(2))
            .map(|i| i.session_id)
            .collect();
        assert_eq!(got, vec!["a", "b"]);
        assert!(q.next_dispatch(2).is_none());
        assert_eq!(q.stats().running_total, 2);

        // Finished lane with backlog goes behind "c".
        q.finish("a");
        assert_eq!(q.next_dispatch(2).unwrap().session_id, "c");
        q.finish("b");
        assert_eq!(q.next_dispatch(2).unwrap().session_id, "a");
    }

    #[test]
    fn clear_drops_backlog_immediately() {
        let q = LaneQueue::new();
        q.push(exec("s", "a"));
        q.next_dispatch(1).unwrap();
        q.push(exec("s", "b"));
        q.push(exec("s", "c"));
        q.push(exec("other", "d"));

        let receipt = q.push(QueueItem::clear("api", "t", "s"));
        assert_eq!(receipt.dropped, 2);
        assert_eq!(receipt.lane_pending, 1);
        assert_eq!(receipt.pending_total, 2);

        let stats = q.stats();
        assert_eq!(stats.pending_total, 2);
        assert_eq!(stats.pending_by_channel.get("api"), Some(&2));
    }

    #[test]
    fn leading_exec_drain_stops_at_control() {
        let q = LaneQueue::new();
        q.push(exec("s", "a"));
        q.push(exec("s", "b"));
        let mut audit = exec("s", "c");
        audit.kind = QueueKind::Audit;
        q.push(audit);

        let drained = q.drain_leading_exec("s", 10);
        assert_eq!(drained.len(), 2);
        assert_eq!(q.stats().pending_total, 1);
        assert_eq!(q.drop_pending("s"), 1);
        assert!(q.drain_leading_exec("missing", 3).is_empty());
    }
}
