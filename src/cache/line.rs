//! One associative set of flow slots, ordered by recency.
//!
//! Index 0 is most-recently-used. Occupied slots form a contiguous prefix;
//! removals compact toward the front so the LRU victim is always the last
//! occupied slot. The MRU rotation is the only ordering — there are no
//! secondary keys.

use crate::cache::key::FlowKey;
use crate::cache::record::FlowRecord;

pub(crate) struct CacheLine {
    slots: Vec<Option<Box<FlowRecord>>>,
}

impl CacheLine {
    pub(crate) fn new(width: usize) -> Self {
        let mut slots = Vec::with_capacity(width);
        slots.resize_with(width, || None);
        CacheLine { slots }
    }

    /// Number of occupied slots.
    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().take_while(|s| s.is_some()).count()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots
            .last()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Position of the slot holding `key`, if any.
    pub(crate) fn find(&self, key: &FlowKey) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map(|rec| rec.key() == key)
                .unwrap_or(false)
        })
    }

    /// Rotates the hit at `pos` to the MRU position, preserving the relative
    /// order of every other slot.
    pub(crate) fn promote(&mut self, pos: usize) {
        self.slots[..=pos].rotate_right(1);
    }

    /// Borrow of the record at `pos`.
    pub(crate) fn peek(&self, pos: usize) -> Option<&FlowRecord> {
        self.slots.get(pos).and_then(|s| s.as_deref())
    }

    /// Mutable borrow of the record at `pos`.
    pub(crate) fn peek_mut(&mut self, pos: usize) -> Option<&mut FlowRecord> {
        self.slots.get_mut(pos).and_then(|s| s.as_deref_mut())
    }

    /// Removes the record at `pos`, compacting the hole to the tail.
    pub(crate) fn take(&mut self, pos: usize) -> Option<Box<FlowRecord>> {
        if pos >= self.slots.len() {
            return None;
        }
        let rec = self.slots.remove(pos);
        self.slots.push(None);
        rec
    }

    /// Evicts the LRU victim: the last occupied slot of a full line.
    pub(crate) fn evict_lru(&mut self) -> Option<Box<FlowRecord>> {
        let last = self.occupied().checked_sub(1)?;
        self.take(last)
    }

    /// Installs `rec` at the MRU position; occupied slots shift down by one.
    /// The line must have a free slot (evict first when full).
    pub(crate) fn insert_front(&mut self, rec: Box<FlowRecord>) {
        debug_assert!(!self.is_full(), "insert into full cache line");
        self.slots.pop();
        self.slots.insert(0, Some(rec));
    }
}
