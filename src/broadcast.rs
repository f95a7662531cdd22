// Priority broadcast queue: outgoing gossip messages are retransmitted a
// bounded number of times, with later entries for the same logical key
// invalidating earlier ones (e.g. a fresher Alive for a node replaces a
// stale Suspect for the same node).

use parking_lot::Mutex;
use std::collections::HashMap;

struct Entry {
    payload: Vec<u8>,
    key: Option<String>,
    transmits: u32,
    max_transmits: u32,
    order: u64,
}

/// Thread-safe FIFO-ish priority queue of pending broadcasts. Mutated by
/// the gossip ticker, the probe scheduler (to piggyback Suspect/Alive/Dead)
/// and by the Serf layer (to piggyback join/leave/user-event/query).
pub struct BroadcastQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Vec<Entry>,
    by_key: HashMap<String, usize>,
    next_order: u64,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                by_key: HashMap::new(),
                next_order: 0,
            }),
        }
    }

    /// Queue `payload` for gossip. If `key` is `Some` and an existing entry
    /// shares it, that entry is invalidated (dropped) and replaced.
    /// `max_transmits` should be `retransmit_limit(cluster_size, mult)`.
    pub fn queue_broadcast(&self, payload: Vec<u8>, key: Option<String>, max_transmits: u32) {
        let mut inner = self.inner.lock();
        if let Some(ref k) = key {
            if let Some(&idx) = inner.by_key.get(k) {
                inner.entries[idx].payload = Vec::new(); // tombstone; swept below
            }
        }
        // Sweep tombstoned entries (empty payload with a key) before inserting.
        inner.entries.retain(|e| !(e.payload.is_empty() && e.key.is_some()));
        inner.by_key.clear();
        for (idx, e) in inner.entries.iter().enumerate() {
            if let Some(ref k) = e.key {
                inner.by_key.insert(k.clone(), idx);
            }
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.entries.push(Entry {
            payload,
            key: key.clone(),
            transmits: 0,
            max_transmits,
            order,
        });
        if let Some(k) = key {
            let idx = inner.entries.len() - 1;
            inner.by_key.insert(k, idx);
        }
    }

    /// Invalidate any pending broadcast for `key` without queueing a
    /// replacement (used when a node is reaped and its lingering intents
    /// should stop being gossiped).
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.key.as_deref() != Some(key));
        inner.by_key.remove(key);
    }

    /// Select broadcasts whose total size, plus `overhead` (e.g. compound
    /// packet framing), fits within `limit`. Selected entries have their
    /// transmit counter incremented; entries that reach `max_transmits`
    /// are dropped from the queue. Returns message bodies in priority
    /// order (fewest transmits so far, then oldest first), most useful to
    /// spread coverage evenly across the cluster.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner
            .entries
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(a.order.cmp(&b.order)));

        let mut selected_idx = Vec::new();
        let mut used = overhead;
        for (idx, e) in inner.entries.iter().enumerate() {
            if used + e.payload.len() > limit {
                continue;
            }
            used += e.payload.len();
            selected_idx.push(idx);
        }

        let mut out = Vec::with_capacity(selected_idx.len());
        for &idx in &selected_idx {
            out.push(inner.entries[idx].payload.clone());
        }

        for &idx in selected_idx.iter() {
            inner.entries[idx].transmits += 1;
        }
        inner.entries.retain(|e| e.transmits < e.max_transmits);
        inner.by_key.clear();
        for (idx, e) in inner.entries.iter().enumerate() {
            if let Some(ref k) = e.key {
                inner.by_key.insert(k.clone(), idx);
            }
        }

        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// `log(N+1) × RetransmitMult`, rounded up — the number of times a
/// broadcast is retransmitted before being dropped, scaled to cluster
/// size so gossip convergence time stays roughly constant as N grows.
pub fn retransmit_limit(cluster_size: usize, retransmit_mult: u32) -> u32 {
    let n = cluster_size as f64 + 1.0;
    (n.ln().ceil() as u32).max(0) * retransmit_mult
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacing_a_key_drops_the_old_entry() {
        let q = BroadcastQueue::new();
        q.queue_broadcast(b"suspect-a".to_vec(), Some("alive:a".into()), 10);
        q.queue_broadcast(b"alive-a".to_vec(), Some("alive:a".into()), 10);
        let all = q.get_broadcasts(0, 1024);
        assert_eq!(all, vec![b"alive-a".to_vec()]);
    }

    #[test]
    fn respects_size_limit() {
        let q = BroadcastQueue::new();
        q.queue_broadcast(vec![0u8; 100], None, 10);
        q.queue_broadcast(vec![0u8; 100], None, 10);
        let selected = q.get_broadcasts(0, 150);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn entry_is_dropped_after_max_transmits() {
        let q = BroadcastQueue::new();
        q.queue_broadcast(b"x".to_vec(), None, 2);
        assert_eq!(q.get_broadcasts(0, 1024).len(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get_broadcasts(0, 1024).len(), 1);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn retransmit_limit_scales_with_cluster_size() {
        assert!(retransmit_limit(100, 4) > retransmit_limit(3, 4));
    }
}
