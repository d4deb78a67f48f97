//! Routing memory: short-lived task -> worker decisions for sticky routing

use baton_core::{RoutingDecision, TaskId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Bounded, time-windowed cache of routing decisions keyed by task id
///
/// Entries older than `window` are never returned. Once the table holds more
/// than `max_entries`, the oldest insertions are evicted first.
#[derive(Debug)]
pub struct RoutingMemory {
    window: Duration,
    max_entries: usize,
    entries: HashMap<TaskId, (u64, RoutingDecision)>,
    /// Insertion order; may hold stale sequence numbers for re-recorded tasks
    order: VecDeque<(u64, TaskId)>,
    next_seq: u64,
}

impl RoutingMemory {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Recent decision for `task_id`, dropping it if it has aged out
    pub fn lookup(&mut self, task_id: &str, now: DateTime<Utc>) -> Option<RoutingDecision> {
        let fresh = match self.entries.get(task_id) {
            Some((_, decision)) => now - decision.decided_at < self.window,
            None => return None,
        };

        if fresh {
            self.entries.get(task_id).map(|(_, d)| d.clone())
        } else {
            self.entries.remove(task_id);
            None
        }
    }

    pub fn record(&mut self, decision: RoutingDecision) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.push_back((seq, decision.task_id.clone()));
        self.entries.insert(decision.task_id.clone(), (seq, decision));

        while self.entries.len() > self.max_entries {
            match self.order.pop_front() {
                Some((seq, task_id)) => {
                    if self.entries.get(&task_id).map(|(s, _)| *s) == Some(seq) {
                        self.entries.remove(&task_id);
                    }
                }
                None => break,
            }
        }

        if self.order.len() > self.max_entries * 2 {
            self.compact();
        }
    }

    /// Remove every entry older than the window. Returns how many were dropped.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries
            .retain(|_, (_, decision)| now - decision.decided_at < window);
        self.compact();
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, task_id)| entries.get(task_id).map(|(s, _)| s) == Some(seq));
    }
}
