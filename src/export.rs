//! Bounded hand-off ring between the cache and the exporter.
//!
//! The cache is the sole producer, the downstream exporter the sole
//! consumer. `push` never blocks: when the ring is full the *oldest* queued
//! record is dropped in favour of the newcomer, because the freshest
//! terminations carry the most valuable recent state. Dropped records are
//! returned to the producer so it can account for them.

use std::collections::VecDeque;

use crate::cache::record::FlowRecord;

/// Bounded FIFO of terminated flow records.
pub struct ExportQueue {
    ring: VecDeque<Box<FlowRecord>>,
    capacity: usize,
}

impl ExportQueue {
    /// Ring with room for `capacity` records. Capacity must be at least 1;
    /// the cache builder validates this.
    pub fn new(capacity: usize) -> Self {
        ExportQueue {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Enqueues a terminated record. On overflow the oldest queued record is
    /// evicted and handed back; the caller drops and counts it.
    #[must_use = "an overflowed record must be accounted for"]
    pub fn push(&mut self, rec: Box<FlowRecord>) -> Option<Box<FlowRecord>> {
        let dropped = if self.ring.len() == self.capacity {
            self.ring.pop_front()
        } else {
            None
        };
        self.ring.push_back(rec);
        dropped
    }

    /// Dequeues the oldest record, FIFO order.
    pub fn pop(&mut self) -> Option<Box<FlowRecord>> {
        self.ring.pop_front()
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
