//! Event queue
//!
//! A binary min-heap of scheduled events keyed by `(time, sequence)`.
//! Ties on time dispatch in schedule order, so the observable order of
//! same-time events is exactly their insertion order. Cancelled events
//! stay in the heap and are skipped on pop.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, MessageId};
use crate::engine::ProcessId;
use crate::location::LocationId;
use crate::resource::{AssignmentId, RequestId, ResourceId};

/// Handle to a scheduled event, usable for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub(crate) u64);

/// What an event does when it fires
#[derive(Debug)]
pub(crate) enum EventAction {
    /// First poll of a process body
    StartProcess { process: ProcessId },
    /// Resume a suspended process; dropped stale if the token no longer
    /// matches (the process was resumed through another path first)
    Resume {
        process: ProcessId,
        token: u64,
        outcome: ResumeSignal,
    },
    /// Expire a pending resource request
    AcquireTimeout { request: RequestId },
    /// Expire a pending synchronous-send response
    ResponseTimeout { message: MessageId },
    /// Entity generator fire on a source
    SourceArrival { source: LocationId, generator: usize },
    /// Downtime-agent timer tick
    AgentTimer { agent: AgentId, tag: u64 },
    /// A going-down grace period ran out; hard take-down follows
    GoingDownExpired { resource: ResourceId },
    /// Close the current batch and open the next one
    BatchBoundary,
}

/// Payload carried by a scheduled resume
#[derive(Debug)]
pub(crate) enum ResumeSignal {
    Timer,
    Assignment(AssignmentId),
    Response(serde_json::Value),
    Counter,
    ResourceUp,
}

#[derive(Debug)]
struct Entry {
    time: f64,
    seq: u64,
    id: EventId,
    action: EventAction,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // total_cmp is safe here: non-finite times are rejected before
        // anything reaches the queue
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Min-heap of pending events with O(1) cancellation
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<EventId>,
    next_id: u64,
    next_seq: u64,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert an event at an absolute tick time. The caller has already
    /// validated `time >= now`.
    pub(crate) fn push(&mut self, time: f64, action: EventAction) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            time,
            seq,
            id,
            action,
        }));
        id
    }

    /// Mark an event cancelled. Idempotent; cancelling an event that has
    /// already fired has no effect.
    pub(crate) fn cancel(&mut self, id: EventId) {
        self.cancelled.insert(id);
    }

    /// Pop the earliest non-cancelled event
    pub(crate) fn pop(&mut self) -> Option<(f64, EventAction)> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            return Some((entry.time, entry.action));
        }
        None
    }

    /// Time of the earliest non-cancelled event, discarding cancelled
    /// entries along the way
    pub(crate) fn peek_time(&mut self) -> Option<f64> {
        loop {
            let cancelled = match self.heap.peek() {
                Some(Reverse(entry)) => self.cancelled.contains(&entry.id),
                None => return None,
            };
            if cancelled {
                if let Some(Reverse(entry)) = self.heap.pop() {
                    self.cancelled.remove(&entry.id);
                }
            } else {
                return self.heap.peek().map(|Reverse(e)| e.time);
            }
        }
    }

    pub(crate) fn is_empty(&mut self) -> bool {
        self.peek_time().is_none()
    }
}
