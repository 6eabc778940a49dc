//! Shared coordination substrate: a process-wide key-value store plugins use to
//! coordinate across requests, and a per-request store scoped to one pass
//! through the pipeline.
//!
//! Grounded on the `Arc<RwLock<...>>` store pattern used for `ConfigStore` in
//! the proxy crate this workspace grew out of: a handful of coarse locks
//! around plain maps, no bespoke concurrent map type.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::RequestId;

type AnyValue = Box<dyn Any + Send + Sync>;

/// Process-wide key-value store. Outlives any single request and is how
/// plugins like the throttling registry or the recording controller persist
/// state across the proxy's whole run.
#[derive(Default)]
pub struct GlobalStore {
    inner: RwLock<HashMap<String, AnyValue>>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: 'static + Clone>(&self, key: &str) -> Option<T> {
        self.inner.read().get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    pub fn set<T: 'static + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.write().insert(key.into(), Box::new(value));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    /// Reads and writes a slot in one critical section, initializing it with
    /// `T::default()` on first use. The closure receives `&mut T`, never the
    /// erased box, so callers never deal with downcasting.
    pub fn with_mut<T: 'static + Default + Send + Sync, R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let mut guard = self.inner.write();
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Box::new(T::default()) as AnyValue);
        let typed = entry
            .downcast_mut::<T>()
            .expect("global store key reused with a different type");
        f(typed)
    }
}

/// Per-request key-value store, keyed by [`RequestId`]. Entries are allocated
/// at ingress and released once the response phase completes, whichever exit
/// path gets there — see [`RequestScope`].
#[derive(Default)]
pub struct PerRequestStore {
    inner: RwLock<HashMap<RequestId, RwLock<HashMap<String, AnyValue>>>>,
}

impl PerRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, id: RequestId) {
        self.inner.write().insert(id, RwLock::new(HashMap::new()));
    }

    fn release(&self, id: &RequestId) -> bool {
        self.inner.write().remove(id).is_some()
    }

    pub fn get<T: 'static + Clone>(&self, id: &RequestId, key: &str) -> Option<T> {
        let outer = self.inner.read();
        let slot = outer.get(id)?;
        slot.read().get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    pub fn set<T: 'static + Send + Sync>(&self, id: &RequestId, key: impl Into<String>, value: T) {
        let outer = self.inner.read();
        if let Some(slot) = outer.get(id) {
            slot.write().insert(key.into(), Box::new(value));
        }
    }

    pub fn with_mut<T: 'static + Default + Send + Sync, R>(
        &self,
        id: &RequestId,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let outer = self.inner.read();
        let slot = outer.get(id)?;
        let mut guard = slot.write();
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Box::new(T::default()) as AnyValue);
        let typed = entry
            .downcast_mut::<T>()
            .expect("per-request store key reused with a different type");
        Some(f(typed))
    }

    /// Allocates a fresh slot for `id` and returns a guard that releases it on
    /// drop, however the caller's future exits.
    pub fn acquire(self: &Arc<Self>, id: RequestId) -> RequestScope {
        self.allocate(id.clone());
        RequestScope {
            store: self.clone(),
            id,
        }
    }
}

/// RAII handle over a request's storage slot. Dropping it — on success, on
/// error, or on cancellation — releases the slot exactly once.
pub struct RequestScope {
    store: Arc<PerRequestStore>,
    id: RequestId,
}

impl RequestScope {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn store(&self) -> &PerRequestStore {
        &self.store
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.store.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_store_round_trips() {
        let store = GlobalStore::new();
        store.set("count", 3u32);
        assert_eq!(store.get::<u32>("count"), Some(3));
        assert_eq!(store.get::<u32>("missing"), None);
    }

    #[test]
    fn global_store_with_mut_initializes_default() {
        let store = GlobalStore::new();
        let total = store.with_mut::<u32, _>("hits", |n| {
            *n += 1;
            *n
        });
        assert_eq!(total, 1);
        let total = store.with_mut::<u32, _>("hits", |n| {
            *n += 1;
            *n
        });
        assert_eq!(total, 2);
    }

    #[test]
    fn request_scope_allocates_and_releases() {
        let store = Arc::new(PerRequestStore::new());
        let id = RequestId::new();
        {
            let scope = store.acquire(id.clone());
            scope.store().set(scope.id(), "seen", true);
            assert_eq!(store.get::<bool>(&id, "seen"), Some(true));
        }
        assert_eq!(store.get::<bool>(&id, "seen"), None);
    }

    #[test]
    fn unknown_request_id_reads_as_absent() {
        let store = PerRequestStore::new();
        let id = RequestId::new();
        assert_eq!(store.get::<u32>(&id, "anything"), None);
    }
}
