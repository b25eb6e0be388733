//! Id-allocating concurrent map for engine-side handles

use crate::handle::HandleId;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ids start at 1 and are never reused. Entries are handed out as `Arc`s so
/// no map guard outlives a lookup.
pub(crate) struct HandleTable<T> {
    next_id: AtomicU64,
    entries: DashMap<HandleId, Arc<T>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, value: T) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, Arc::new(value));
        id
    }

    pub fn get(&self, id: HandleId) -> Option<Arc<T>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: HandleId) -> Option<Arc<T>> {
        self.entries.remove(&id).map(|(_, value)| value)
    }

    /// Remove every entry, returning them for shutdown.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let ids: Vec<HandleId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
