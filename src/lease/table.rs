// Per-cache lease table with an optional LRU graveyard
//
// Live leases sit in the front map. Terminating a lease moves it out of the
// front map; when a graveyard is configured the record is kept there (bounded,
// least recently used evicted first) so a key that comes back keeps its
// version history. Only lease bookkeeping lives here, never cached values.

use super::Lease;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

/// A lease guarded by its own lock. Holding the guard is the per-key
/// critical section for mutations of that key.
#[derive(Debug)]
pub struct LeaseCell {
    lease: Mutex<Lease>,
    changed: Notify,
}

impl LeaseCell {
    pub fn new(lease: Lease) -> Self {
        Self {
            lease: Mutex::new(lease),
            changed: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Lease> {
        self.lease.lock()
    }

    pub fn snapshot(&self) -> Lease {
        self.lease.lock().clone()
    }

    /// Wake everyone waiting for this lease to change hands.
    pub fn notify_waiters(&self) {
        self.changed.notify_waiters();
    }

    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }
}

/// Bounded LRU store for terminated leases.
#[derive(Debug)]
pub struct Graveyard {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (u64, Arc<LeaseCell>)>,
    order: BTreeMap<u64, String>,
}

impl Graveyard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Bury a lease, evicting the least recently used one when full.
    /// Returns the evicted key, if any.
    pub fn insert(&mut self, key: String, cell: Arc<LeaseCell>) -> Option<String> {
        let tick = self.next_tick();
        if let Some((old_tick, _)) = self.entries.insert(key.clone(), (tick, cell)) {
            self.order.remove(&old_tick);
        }
        self.order.insert(tick, key);

        if self.entries.len() > self.capacity {
            let (_, victim) = self.order.pop_first()?;
            self.entries.remove(&victim);
            return Some(victim);
        }
        None
    }

    /// Look a lease up, marking it recently used.
    pub fn get(&mut self, key: &str) -> Option<Arc<LeaseCell>> {
        let tick = self.next_tick();
        let (old_tick, cell) = {
            let entry = self.entries.get_mut(key)?;
            let old = entry.0;
            entry.0 = tick;
            (old, entry.1.clone())
        };
        self.order.remove(&old_tick);
        self.order.insert(tick, key.to_owned());
        Some(cell)
    }

    pub fn take(&mut self, key: &str) -> Option<Arc<LeaseCell>> {
        let (tick, cell) = self.entries.remove(key)?;
        self.order.remove(&tick);
        Some(cell)
    }

    pub fn keys(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Leases of one cache, keyed by resource key.
#[derive(Debug)]
pub struct LeaseTable {
    cache_index: u32,
    front: DashMap<String, Arc<LeaseCell>>,
    graveyard: Option<Mutex<Graveyard>>,
}

impl LeaseTable {
    pub fn new(cache_index: u32, graveyard_size: usize) -> Self {
        Self {
            cache_index,
            front: DashMap::new(),
            graveyard: (graveyard_size > 0).then(|| Mutex::new(Graveyard::new(graveyard_size))),
        }
    }

    pub fn cache_index(&self) -> u32 {
        self.cache_index
    }

    pub fn get(&self, key: &str) -> Option<Arc<LeaseCell>> {
        if let Some(cell) = self.front.get(key) {
            return Some(cell.clone());
        }
        self.graveyard.as_ref()?.lock().get(key)
    }

    /// Return the lease for a key, reviving it from the graveyard or
    /// creating a fresh one as needed.
    pub fn ensure(&self, key: &str) -> Arc<LeaseCell> {
        if let Some(cell) = self.front.get(key) {
            return cell.clone();
        }
        let revived = self.graveyard.as_ref().and_then(|g| g.lock().take(key));
        self.front
            .entry(key.to_owned())
            .or_insert_with(|| {
                revived.unwrap_or_else(|| Arc::new(LeaseCell::new(Lease::new(self.cache_index, key))))
            })
            .clone()
    }

    /// Move a lease out of the live table.
    pub fn terminate(&self, key: &str) {
        let Some((key, cell)) = self.front.remove(key) else {
            return;
        };
        match &self.graveyard {
            Some(graveyard) => {
                if let Some(evicted) = graveyard.lock().insert(key.clone(), cell) {
                    debug!(cache_index = self.cache_index, key = %evicted, "evicted lease from graveyard");
                }
                debug!(cache_index = self.cache_index, key = %key, "moved lease to graveyard");
            }
            None => debug!(cache_index = self.cache_index, key = %key, "dropped lease"),
        }
    }

    /// Keys of live and buried leases.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.front.iter().map(|e| e.key().clone()).collect();
        if let Some(graveyard) = &self.graveyard {
            keys.extend(graveyard.lock().keys());
        }
        keys
    }

    pub fn live_len(&self) -> usize {
        self.front.len()
    }

    pub fn graveyard_len(&self) -> usize {
        self.graveyard.as_ref().map_or(0, |g| g.lock().len())
    }

    pub fn is_buried(&self, key: &str) -> bool {
        self.graveyard.as_ref().is_some_and(|g| g.lock().contains(key))
    }

    pub fn clear(&self) {
        self.front.clear();
        if let Some(graveyard) = &self.graveyard {
            graveyard.lock().clear();
        }
    }
}
