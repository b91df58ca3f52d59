//! Relative-time timer queue.
//!
//! Entries are keyed by milliseconds remaining and kept in a min-heap.
//! On every reactor wake the elapsed wall-clock delta is subtracted from
//! all entries; a uniform decrement preserves heap order. Entries within a
//! small slack of the due front fire together in one pass.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::callback::TimeoutCallback;

/// Firing slack: entries within this many milliseconds of the due front
/// are coalesced into the same dispatch.
pub(crate) const COALESCE_SLACK_MS: i64 = 3;

pub(crate) struct TimerEntry {
    pub remaining_ms: i64,
    pub callback: TimeoutCallback,
    /// Insertion sequence, tie-breaking equal deadlines deterministically.
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.remaining_ms == other.remaining_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest deadline first, then FIFO.
        match other.remaining_ms.cmp(&self.remaining_ms) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, remaining_ms: i64, callback: TimeoutCallback) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            remaining_ms,
            callback,
            seq,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remaining milliseconds of the soonest entry.
    pub fn front_remaining(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.remaining_ms)
    }

    /// Subtract `delta` from every entry. Uniform, so heap order holds.
    pub fn decrement_all(&mut self, delta: i64) {
        if delta == 0 || self.heap.is_empty() {
            return;
        }
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        for entry in &mut entries {
            entry.remaining_ms -= delta;
        }
        self.heap = BinaryHeap::from(entries);
    }

    /// Pop every entry within [`COALESCE_SLACK_MS`] of the front's
    /// remaining time, in heap order. Callers invoke the callbacks after
    /// the queue borrow is dropped.
    pub fn pop_due(&mut self) -> Vec<TimerEntry> {
        let due = match self.front_remaining() {
            Some(ms) => ms,
            None => return Vec::new(),
        };
        let mut fired = Vec::new();
        while let Some(front) = self.heap.peek() {
            if (front.remaining_ms - due).abs() < COALESCE_SLACK_MS {
                fired.push(self.heap.pop().expect("peeked entry"));
            } else {
                break;
            }
        }
        fired
    }

    /// Drop all entries (and their callbacks) without firing them.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
