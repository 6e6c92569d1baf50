//! Min-ordered expiry index for one cache level.
//!
//! Every live slot owns exactly one current record `(key, expires_at, seq)`.
//! Refreshing a slot pushes a new record and leaves the old one behind; stale
//! records are recognised by their sequence number and skipped when popped.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

const COMPACT_SLACK: usize = 32;

struct ExpiryRecord<K> {
    expires_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for ExpiryRecord<K> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.seq == other.seq
    }
}

impl<K> Eq for ExpiryRecord<K> {}

impl<K> PartialOrd for ExpiryRecord<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for ExpiryRecord<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then(self.seq.cmp(&other.seq))
    }
}

pub(crate) struct ExpiryIndex<K> {
    heap: BinaryHeap<Reverse<ExpiryRecord<K>>>,
    next_seq: u64,
}

impl<K: Eq> ExpiryIndex<K> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Record a deadline for `key`, returning the sequence number that marks
    /// the record as current.
    pub(crate) fn schedule(&mut self, key: K, expires_at: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ExpiryRecord {
            expires_at,
            seq,
            key,
        }));
        seq
    }

    /// Drop every record for `key`, current or stale.
    pub(crate) fn cancel(&mut self, key: &K) {
        self.heap.retain(|Reverse(record)| &record.key != key);
    }

    /// Pop the earliest record if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(K, u64)> {
        let due = self
            .heap
            .peek()
            .is_some_and(|Reverse(record)| record.expires_at <= now);
        if !due {
            return None;
        }
        self.heap
            .pop()
            .map(|Reverse(record)| (record.key, record.seq))
    }

    /// Discard stale records once they outnumber live slots by a wide margin.
    pub(crate) fn compact_if_bloated(&mut self, live_slots: usize, is_current: impl Fn(&K, u64) -> bool) {
        if self.heap.len() <= live_slots * 2 + COMPACT_SLACK {
            return;
        }
        self.heap
            .retain(|Reverse(record)| is_current(&record.key, record.seq));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(record)| record.expires_at)
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
