use super::resource::Resource;
use crate::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Marks a removal the cache performs itself, so the deletion notice coming
/// back from an observable store is not mistaken for an external eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionToken {
    key: String,
}

impl SuppressionToken {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn covers(&self, key: &str) -> bool {
        self.key == key
    }
}

/// Receives deletion notices from an observable backing map.
pub trait BackingMapObserver: Send + Sync {
    fn entry_deleted(&self, key: &str, cause: Option<&SuppressionToken>);
}

/// Storage for the resource values of one cache.
pub trait BackingMap: Send + Sync + Debug {
    fn get(&self, key: &str) -> Option<Resource>;
    fn contains_key(&self, key: &str) -> bool;
    fn put(&self, key: String, value: Resource) -> Option<Resource>;
    fn remove(&self, key: &str, token: Option<&SuppressionToken>) -> Option<Resource>;
    fn keys(&self) -> Vec<String>;
    fn len(&self) -> usize;
    fn clear(&self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn supports_expiry(&self) -> bool {
        false
    }

    /// Store with a per-entry time to live. Only meaningful when
    /// `supports_expiry` is true.
    fn put_with_expiry(&self, key: String, value: Resource, _ttl: Duration) -> Option<Resource> {
        self.put(key, value)
    }

    /// Attach a deletion observer. Returns false for maps that cannot be
    /// observed.
    fn subscribe(&self, _observer: Arc<dyn BackingMapObserver>) -> bool {
        false
    }

    fn unsubscribe(&self) {}
}

/// Provider of named backing maps.
pub trait BackingMapManager: Send + Sync + Debug {
    fn instantiate_backing_map(&self, name: &str) -> Result<Arc<dyn BackingMap>>;
    fn release_backing_map(&self, name: &str, map: &Arc<dyn BackingMap>) -> Result<()>;
}

/// Concurrent in-process backing map. Observable.
#[derive(Default)]
pub struct InMemoryBackingMap {
    data: DashMap<String, Resource>,
    observer: RwLock<Option<Arc<dyn BackingMapObserver>>>,
}

impl Debug for InMemoryBackingMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackingMap")
            .field("len", &self.data.len())
            .field("observed", &self.observer.read().is_some())
            .finish()
    }
}

impl InMemoryBackingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an entry the way an external agent (eviction, expiry) would.
    pub fn evict(&self, key: &str) -> Option<Resource> {
        self.remove(key, None)
    }
}

impl BackingMap for InMemoryBackingMap {
    fn get(&self, key: &str) -> Option<Resource> {
        self.data.get(key).map(|v| v.clone())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    fn put(&self, key: String, value: Resource) -> Option<Resource> {
        self.data.insert(key, value)
    }

    fn remove(&self, key: &str, token: Option<&SuppressionToken>) -> Option<Resource> {
        let removed = self.data.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            let observer = self.observer.read().clone();
            if let Some(observer) = observer {
                observer.entry_deleted(key, token);
            }
        }
        removed
    }

    fn keys(&self) -> Vec<String> {
        self.data.iter().map(|e| e.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn clear(&self) {
        for key in self.keys() {
            self.remove(&key, None);
        }
    }

    fn subscribe(&self, observer: Arc<dyn BackingMapObserver>) -> bool {
        *self.observer.write() = Some(observer);
        true
    }

    fn unsubscribe(&self) {
        *self.observer.write() = None;
    }
}

/// Hands out a fresh in-memory map per cache name.
#[derive(Debug, Default)]
pub struct InMemoryBackingMapManager {
    maps: DashMap<String, Arc<InMemoryBackingMap>>,
}

impl InMemoryBackingMapManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete map created for a cache, for inspection and eviction.
    pub fn map(&self, name: &str) -> Option<Arc<InMemoryBackingMap>> {
        self.maps.get(name).map(|m| m.clone())
    }
}

impl BackingMapManager for InMemoryBackingMapManager {
    fn instantiate_backing_map(&self, name: &str) -> Result<Arc<dyn BackingMap>> {
        let map = Arc::new(InMemoryBackingMap::new());
        self.maps.insert(name.to_owned(), map.clone());
        Ok(map)
    }

    fn release_backing_map(&self, name: &str, _map: &Arc<dyn BackingMap>) -> Result<()> {
        self.maps.remove(name);
        Ok(())
    }
}
