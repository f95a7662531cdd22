//! Deduplication ring for user events and queries (spec.md §4.5): a fixed
//! `size` array indexed by `LTime mod size`. A message older than
//! `current − size` is rejected outright; one that lands on an
//! already-occupied slot is compared by `(LTime, key-hash)` and dropped if
//! it matches, accepted (overwriting the slot) otherwise.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy)]
struct Slot {
    ltime: u64,
    hash: u64,
}

pub struct DedupRing {
    slots: Vec<Option<Slot>>,
}

impl DedupRing {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size.max(1)],
        }
    }

    /// Returns `true` if this is a new message that should be processed
    /// (and records it), `false` if it's a duplicate or too old.
    pub fn accept(&mut self, ltime: u64, current: u64, key: impl Hash) -> bool {
        let size = self.slots.len() as u64;
        if current > size && ltime + size <= current {
            return false; // older than the window
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();

        let idx = (ltime % size) as usize;
        if let Some(slot) = &self.slots[idx] {
            if slot.ltime == ltime && slot.hash == hash {
                return false;
            }
        }
        self.slots[idx] = Some(Slot { ltime, hash });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_first_occurrence() {
        let mut ring = DedupRing::new(128);
        assert!(ring.accept(1, 1, ("name", vec![1u8])));
    }

    #[test]
    fn rejects_exact_duplicate() {
        let mut ring = DedupRing::new(128);
        assert!(ring.accept(1, 1, ("name", vec![1u8])));
        assert!(!ring.accept(1, 1, ("name", vec![1u8])));
    }

    #[test]
    fn accepts_same_ltime_different_payload_as_a_new_event() {
        let mut ring = DedupRing::new(128);
        assert!(ring.accept(1, 1, ("name", vec![1u8])));
        assert!(ring.accept(1, 1, ("name", vec![2u8])));
    }

    #[test]
    fn rejects_events_outside_the_window() {
        let mut ring = DedupRing::new(4);
        assert!(!ring.accept(0, 10, ("name", vec![1u8])));
    }
}
