//! In-process implementation of the watcher and client capabilities.
//!
//! Backs the service tests and lets a host run the core without a cluster.
//! Objects get a monotonically increasing `resource_version` on every write,
//! updates are version checked, and handlers fire after the write is
//! visible. Failure injection hooks make conflict and outage paths testable.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alert_engine::{ObjectKey, Resource};

use crate::clients::{EventHandler, ResourceClient, Watcher};
use crate::error::StoreError;

enum Event<T> {
    Added(T),
    Updated(T, T),
    Deleted(T),
}

pub struct MemoryStore<T: Resource> {
    objects: RwLock<BTreeMap<ObjectKey, T>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
    version: AtomicU64,
    reads: AtomicUsize,
    writes: AtomicUsize,
    list_failures: AtomicUsize,
    update_conflicts: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            list_failures: AtomicUsize::new(0),
            update_conflicts: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: impl IntoIterator<Item = T>) -> Self {
        let store = Self::new();
        for object in objects {
            store.upsert(object);
        }
        store
    }

    // ========================================================================
    // Direct manipulation (plays the role of other controllers)
    // ========================================================================

    /// Stores `object` unconditionally and notifies handlers.
    pub fn upsert(&self, mut object: T) -> T {
        self.stamp(&mut object);
        let previous = self.objects.write().insert(object.key(), object.clone());
        match previous {
            Some(old) => self.dispatch(Event::Updated(old, object.clone())),
            None => self.dispatch(Event::Added(object.clone())),
        }
        object
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<T> {
        let removed = self.objects.write().remove(key);
        if let Some(object) = &removed {
            self.dispatch(Event::Deleted(object.clone()));
        }
        removed
    }

    /// Current stored copy, bypassing counters and latency.
    pub fn object(&self, key: &ObjectKey) -> Option<T> {
        self.objects.read().get(key).cloned()
    }

    pub fn objects(&self) -> Vec<T> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    // ========================================================================
    // Failure injection and counters
    // ========================================================================

    /// The next `n` list calls fail with a backend error.
    pub fn fail_next_lists(&self, n: usize) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` update calls fail with a conflict.
    pub fn conflict_next_updates(&self, n: usize) {
        self.update_conflicts.store(n, Ordering::SeqCst);
    }

    /// Delay applied to every client and watcher call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Client and watcher reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Client writes (create, update, delete) attempted so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn stamp(&self, object: &mut T) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        object.meta_mut().resource_version = Some(version.to_string());
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    // Handlers run without any store lock held.
    fn dispatch(&self, event: Event<T>) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            match &event {
                Event::Added(object) => handler.on_add(object),
                Event::Updated(old, new) => handler.on_update(old, new),
                Event::Deleted(object) => handler.on_delete(object),
            }
        }
    }

    fn list_all(&self) -> Result<Vec<T>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Self::take_injected(&self.list_failures) {
            return Err(StoreError::Backend("injected list failure".to_string()));
        }
        Ok(self.objects())
    }
}

#[async_trait]
impl<T: Resource> Watcher<T> for MemoryStore<T> {
    async fn list(&self) -> Result<Vec<T>, StoreError> {
        self.simulate_latency().await;
        self.list_all()
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<T>, StoreError> {
        self.simulate_latency().await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.object(key))
    }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        self.handlers.write().push(handler);
    }

    async fn wait_for_sync(&self) -> bool {
        true
    }
}

#[async_trait]
impl<T: Resource> ResourceClient<T> for MemoryStore<T> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
        self.simulate_latency().await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.object(&ObjectKey::new(namespace, name)))
    }

    async fn create(&self, mut object: T) -> Result<T, StoreError> {
        self.simulate_latency().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = object.key();
        {
            let mut objects = self.objects.write();
            if objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            self.stamp(&mut object);
            objects.insert(key, object.clone());
        }
        self.dispatch(Event::Added(object.clone()));
        Ok(object)
    }

    async fn update(&self, mut object: T) -> Result<T, StoreError> {
        self.simulate_latency().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = object.key();
        if Self::take_injected(&self.update_conflicts) {
            return Err(StoreError::Conflict(key.to_string()));
        }
        let old = {
            let mut objects = self.objects.write();
            let Some(current) = objects.get(&key) else {
                return Err(StoreError::NotFound(key.to_string()));
            };
            if current.meta().resource_version != object.meta().resource_version {
                return Err(StoreError::Conflict(key.to_string()));
            }
            self.stamp(&mut object);
            objects.insert(key, object.clone())
        };
        if let Some(old) = old {
            self.dispatch(Event::Updated(old, object.clone()));
        }
        Ok(object)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = ObjectKey::new(namespace, name);
        let removed = self.objects.write().remove(&key);
        match removed {
            Some(object) => {
                self.dispatch(Event::Deleted(object));
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<T>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|o| o.meta().namespace == namespace)
            .collect())
    }
}
