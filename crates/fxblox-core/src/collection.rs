// ── Keyed reactive collection ──
//
// Concurrent storage with O(1) lookups and copy-on-read snapshots pushed
// through a `watch` channel. Mutations run inside `send_modify`, so the
// map change and the snapshot rebuild happen as one step and no
// subscriber ever sees a half-applied mutation.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::watch;

struct Slot<T> {
    /// Insertion order, so snapshots list entries the way they were added.
    seq: u64,
    value: T,
}

/// A concurrent, reactive collection of cheaply cloneable handles.
pub(crate) struct EntityCollection<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    by_key: DashMap<K, Slot<T>>,
    next_seq: AtomicU64,
    snapshot: watch::Sender<Arc<Vec<T>>>,
}

impl<K, T> EntityCollection<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_key: DashMap::new(),
            next_seq: AtomicU64::new(0),
            snapshot,
        }
    }

    /// Insert or replace. Returns the previous value for `key`, if any.
    /// A replaced entry keeps its original position.
    pub(crate) fn upsert(&self, key: K, value: T) -> Option<T> {
        let mut previous = None;
        self.snapshot.send_modify(|snap| {
            let seq = self
                .by_key
                .get(&key)
                .map_or_else(|| self.next_seq.fetch_add(1, Ordering::Relaxed), |s| s.seq);
            previous = self
                .by_key
                .insert(key, Slot { seq, value })
                .map(|s| s.value);
            *snap = self.collect();
        });
        previous
    }

    /// Remove by key. Returns the removed value if it existed.
    pub(crate) fn remove(&self, key: &K) -> Option<T> {
        self.remove_if(key, |_| true)
    }

    /// Remove by key only if `predicate` holds for the stored value.
    pub(crate) fn remove_if(&self, key: &K, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut removed = None;
        self.snapshot.send_if_modified(|snap| {
            removed = self
                .by_key
                .remove_if(key, |_, slot| predicate(&slot.value))
                .map(|(_, slot)| slot.value);
            if removed.is_some() {
                *snap = self.collect();
            }
            removed.is_some()
        });
        removed
    }

    pub(crate) fn get(&self, key: &K) -> Option<T> {
        self.by_key.get(key).map(|r| r.value().value.clone())
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<T>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<T>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    fn collect(&self) -> Arc<Vec<T>> {
        let mut slots: Vec<(u64, T)> = self
            .by_key
            .iter()
            .map(|r| (r.value().seq, r.value().value.clone()))
            .collect();
        slots.sort_unstable_by_key(|(seq, _)| *seq);
        Arc::new(slots.into_iter().map(|(_, v)| v).collect())
    }
}
