//! Shared in-memory resource state with per-type observer notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::resources_model::{OutboxEntry, Resource};
use crate::events::SubscriptionId;

/// Receives the full slice of a resource type after every applied change.
pub trait ResourceObserver: Send + Sync {
    fn on_resources_changed(&self, resource_type: &str, resources: &[Resource]);
}

impl<F> ResourceObserver for F
where
    F: Fn(&str, &[Resource]) + Send + Sync,
{
    fn on_resources_changed(&self, resource_type: &str, resources: &[Resource]) {
        self(resource_type, resources)
    }
}

/// One resource type's state: visible resources, the outbox mirror and confirmations
/// that arrived before the optimistic merge.
#[derive(Debug, Default)]
pub struct ResourceSlice {
    resources: Vec<Resource>,
    outbox: Vec<OutboxEntry>,
    settled: HashMap<String, Resource>,
    changed: bool,
}

impl ResourceSlice {
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn outbox(&self) -> &[OutboxEntry] {
        &self.outbox
    }

    pub fn find(&self, key: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.matches_key(key))
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id.as_deref() == Some(id))
    }

    pub fn find_by_id_mut(&mut self, id: &str) -> Option<&mut Resource> {
        let found = self.resources.iter_mut().find(|r| r.id.as_deref() == Some(id));
        if found.is_some() {
            self.changed = true;
        }
        found
    }

    /// Position of the optimistic resource created under `temp_id`.
    pub fn position_of_temp(&self, temp_id: &str) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.temp_id.as_deref() == Some(temp_id))
    }

    pub fn position_of_id(&self, id: &str) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.id.as_deref() == Some(id))
    }

    /// Replace the resource with the same key, or append.
    pub fn upsert(&mut self, resource: Resource) {
        let position = resource
            .id
            .as_deref()
            .and_then(|id| self.position_of_id(id))
            .or_else(|| {
                resource
                    .temp_id
                    .as_deref()
                    .and_then(|t| self.position_of_temp(t))
            });
        match position {
            Some(index) => self.resources[index] = resource,
            None => self.resources.push(resource),
        }
        self.changed = true;
    }

    /// Like [`upsert`](Self::upsert) but keeps an optimistic entry in place,
    /// including one whose create response already echoed this id. Returns
    /// whether the resource was applied.
    pub fn upsert_confirmed(&mut self, resource: Resource) -> bool {
        if let Some(id) = resource.id.as_deref() {
            let optimistic = self.find_by_id(id).is_some_and(|r| r.is_optimistic);
            if optimistic || self.pending_temp_for(id).is_some() {
                return false;
            }
        }
        self.upsert(resource);
        true
    }

    /// Temp id of the optimistic resource awaiting confirmation as `server_id`.
    pub fn pending_temp_for(&self, server_id: &str) -> Option<&str> {
        self.outbox
            .iter()
            .filter(|e| e.server_id.as_deref() == Some(server_id))
            .map(|e| e.temp_id.as_str())
            .find(|temp_id| self.position_of_temp(temp_id).is_some())
    }

    /// Drops every resource carrying `id` except the one at `keep`.
    pub fn retain_single(&mut self, id: &str, keep: usize) -> usize {
        let before = self.resources.len();
        let mut index = 0;
        self.resources.retain(|r| {
            let retained = index == keep || r.id.as_deref() != Some(id);
            index += 1;
            retained
        });
        let removed = before - self.resources.len();
        if removed > 0 {
            self.changed = true;
        }
        removed
    }

    pub fn replace_at(&mut self, index: usize, resource: Resource) {
        self.resources[index] = resource;
        self.changed = true;
    }

    pub fn push(&mut self, resource: Resource) {
        self.resources.push(resource);
        self.changed = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<Resource> {
        let index = self.resources.iter().position(|r| r.matches_key(key))?;
        self.changed = true;
        Some(self.resources.remove(index))
    }

    /// Opens an outbox entry. At most one entry per temp id.
    pub fn open_outbox(&mut self, entry: OutboxEntry) -> bool {
        if self.outbox.iter().any(|e| e.temp_id == entry.temp_id) {
            return false;
        }
        self.outbox.push(entry);
        true
    }

    pub fn outbox_entry_mut(&mut self, temp_id: &str) -> Option<&mut OutboxEntry> {
        self.outbox.iter_mut().find(|e| e.temp_id == temp_id)
    }

    pub fn has_outbox(&self, temp_id: &str) -> bool {
        self.outbox.iter().any(|e| e.temp_id == temp_id)
    }

    pub fn take_outbox(&mut self, temp_id: &str) -> Option<OutboxEntry> {
        let index = self.outbox.iter().position(|e| e.temp_id == temp_id)?;
        Some(self.outbox.remove(index))
    }

    pub fn take_outbox_where<P>(&mut self, predicate: P) -> Option<OutboxEntry>
    where
        P: Fn(&OutboxEntry) -> bool,
    {
        let index = self.outbox.iter().position(predicate)?;
        Some(self.outbox.remove(index))
    }

    /// Records a confirmation for a create whose optimistic merge has not happened yet.
    pub fn settle(&mut self, temp_id: &str, confirmed: Resource) {
        self.settled.insert(temp_id.to_string(), confirmed);
    }

    pub fn take_settled(&mut self, temp_id: &str) -> Option<Resource> {
        self.settled.remove(temp_id)
    }

    /// Number of optimistic resources; always equals the outbox size once
    /// every in-flight `add` has finished.
    pub fn optimistic_count(&self) -> usize {
        self.resources.iter().filter(|r| r.is_optimistic).count()
    }
}

struct ObserverEntry {
    id: SubscriptionId,
    resource_type: String,
    observer: Arc<dyn ResourceObserver>,
}

/// Explicit shared-state object. Every mutation is a short synchronous critical
/// section; observers run after the lock is released.
#[derive(Default)]
pub struct ResourceStore {
    slices: Mutex<HashMap<String, ResourceSlice>>,
    observers: Mutex<Vec<ObserverEntry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource_type: &str) {
        lock(&self.slices)
            .entry(resource_type.to_string())
            .or_default();
    }

    pub fn is_registered(&self, resource_type: &str) -> bool {
        lock(&self.slices).contains_key(resource_type)
    }

    /// Runs `f` against the slice and notifies observers when it changed anything.
    pub fn mutate<R, F>(&self, resource_type: &str, f: F) -> R
    where
        F: FnOnce(&mut ResourceSlice) -> R,
    {
        let (result, changed) = {
            let mut slices = lock(&self.slices);
            let slice = slices.entry(resource_type.to_string()).or_default();
            slice.changed = false;
            let result = f(slice);
            let changed = std::mem::take(&mut slice.changed).then(|| slice.resources.clone());
            (result, changed)
        };
        if let Some(resources) = changed {
            self.notify(resource_type, &resources);
        }
        result
    }

    /// Read-only access; never notifies.
    pub fn read<R, F>(&self, resource_type: &str, f: F) -> R
    where
        F: FnOnce(Option<&ResourceSlice>) -> R,
    {
        let slices = lock(&self.slices);
        f(slices.get(resource_type))
    }

    /// Copy of the current slice.
    pub fn snapshot(&self, resource_type: &str) -> Vec<Resource> {
        self.read(resource_type, |slice| {
            slice.map(|s| s.resources.clone()).unwrap_or_default()
        })
    }

    pub fn find(&self, resource_type: &str, key: &str) -> Option<Resource> {
        self.read(resource_type, |slice| slice.and_then(|s| s.find(key).cloned()))
    }

    pub fn outbox_entries(&self, resource_type: &str) -> Vec<OutboxEntry> {
        self.read(resource_type, |slice| {
            slice.map(|s| s.outbox.clone()).unwrap_or_default()
        })
    }

    pub fn subscribe(
        &self,
        resource_type: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> SubscriptionId {
        let id = SubscriptionId::next();
        lock(&self.observers).push(ObserverEntry {
            id,
            resource_type: resource_type.to_string(),
            observer,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|entry| entry.id != id);
        observers.len() != before
    }

    pub fn observer_count(&self, resource_type: &str) -> usize {
        lock(&self.observers)
            .iter()
            .filter(|entry| entry.resource_type == resource_type)
            .count()
    }

    fn notify(&self, resource_type: &str, resources: &[Resource]) {
        let targets: Vec<Arc<dyn ResourceObserver>> = lock(&self.observers)
            .iter()
            .filter(|entry| entry.resource_type == resource_type)
            .map(|entry| entry.observer.clone())
            .collect();
        for observer in targets {
            observer.on_resources_changed(resource_type, resources);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn confirmed(id: &str, name: &str) -> Resource {
        let mut data = Map::new();
        data.insert("name".to_string(), json!(name));
        Resource::confirmed("patients", id, data)
    }

    #[test]
    fn observers_see_full_slice_after_each_change() {
        let store = ResourceStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let last_len = Arc::new(AtomicUsize::new(0));
        let (c, l) = (calls.clone(), last_len.clone());
        store.subscribe(
            "patients",
            Arc::new(move |_: &str, resources: &[Resource]| {
                c.fetch_add(1, Ordering::SeqCst);
                l.store(resources.len(), Ordering::SeqCst);
            }),
        );

        store.mutate("patients", |s| s.push(confirmed("1", "Ana")));
        store.mutate("patients", |s| s.push(confirmed("2", "Bo")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(last_len.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mutation_without_change_does_not_notify() {
        let store = ResourceStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        store.subscribe(
            "patients",
            Arc::new(move |_: &str, _: &[Resource]| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let removed = store.mutate("patients", |s| s.remove("missing"));
        assert!(removed.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observers_of_other_types_are_not_called() {
        let store = ResourceStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = store.subscribe(
            "sales",
            Arc::new(move |_: &str, _: &[Resource]| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        store.mutate("patients", |s| s.push(confirmed("1", "Ana")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn observer_may_read_store_during_notification() {
        let store = Arc::new(ResourceStore::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let (inner, s) = (store.clone(), seen.clone());
        store.subscribe(
            "patients",
            Arc::new(move |t: &str, _: &[Resource]| {
                s.store(inner.snapshot(t).len(), Ordering::SeqCst);
            }),
        );
        store.mutate("patients", |s| s.push(confirmed("1", "Ana")));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upsert_replaces_by_id_and_confirmed_upsert_keeps_optimistic() {
        let store = ResourceStore::new();
        store.mutate("patients", |s| {
            s.upsert(confirmed("1", "Ana"));
            s.upsert(confirmed("1", "Ana Maria"));
        });
        let snapshot = store.snapshot("patients");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].data["name"], json!("Ana Maria"));

        store.mutate("patients", |s| {
            let mut pending = confirmed("2", "Bo");
            pending.is_optimistic = true;
            s.push(pending);
            s.upsert_confirmed(confirmed("2", "Server Bo"));
        });
        let bo = store.find("patients", "2").unwrap();
        assert!(bo.is_optimistic);
        assert_eq!(bo.data["name"], json!("Bo"));
    }

    #[test]
    fn confirmed_upsert_skips_id_echoed_to_pending_create() {
        let store = ResourceStore::new();
        let applied = store.mutate("patients", |s| {
            let mut entry = OutboxEntry::new("patients", "tmp_9", "fp".to_string());
            entry.server_id = Some("srv-9".to_string());
            s.open_outbox(entry);
            s.push(Resource::optimistic("patients", "tmp_9", Map::new()));
            s.upsert_confirmed(confirmed("srv-9", "Server copy"))
        });
        assert!(!applied);
        let snapshot = store.snapshot("patients");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_optimistic);

        let applied = store.mutate("patients", |s| s.upsert_confirmed(confirmed("srv-10", "Other")));
        assert!(applied);
    }

    #[test]
    fn retain_single_drops_other_copies_of_an_id() {
        let store = ResourceStore::new();
        let removed = store.mutate("patients", |s| {
            s.push(confirmed("1", "Ana"));
            s.push(confirmed("2", "Bo"));
            s.push(confirmed("1", "Ana again"));
            s.retain_single("1", 2)
        });
        assert_eq!(removed, 1);
        let snapshot = store.snapshot("patients");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].data["name"], json!("Ana again"));
    }

    #[test]
    fn outbox_allows_one_entry_per_temp_id() {
        let store = ResourceStore::new();
        let entry = OutboxEntry::new("patients", "tmp_1", "fp".to_string());
        let first = store.mutate("patients", |s| s.open_outbox(entry.clone()));
        let second = store.mutate("patients", |s| s.open_outbox(entry.clone()));
        assert!(first);
        assert!(!second);
        assert_eq!(store.outbox_entries("patients").len(), 1);
    }
}
