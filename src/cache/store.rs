// Shared state of one cache and the lease callbacks that mutate it
//
// Every loader-specific view of a cache (a CacheHandler) shares one store:
// the resource map, the lease table and the secondary indexes. The views
// themselves form an ordered chain; the first is the prime view, which
// receives replication traffic for the cache.

use super::backing::{
    BackingMap, BackingMapManager, BackingMapObserver, InMemoryBackingMap, SuppressionToken,
};
use super::event::{fire, CacheEvent, CacheEventKind, DeactivationListener, ListenerSupport};
use super::index::IndexMap;
use super::resource::{JsonSerializer, Loader, Resource, Serializer};
use super::service::ServiceContext;
use crate::lease::{Lease, LeaseCell, LeaseStatus, LeaseTable};
use crate::membership::{MemberId, MemberSnapshot};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// What a lease callback carries besides the lease itself.
#[derive(Debug, Clone)]
pub enum LeaseUpdate {
    /// Lock, unlock or issue; the resource is untouched.
    LeaseOnly,
    Resource {
        value: Resource,
        expiry: Option<Duration>,
    },
}

/// Result of applying an inbound lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The local lease was at least as fresh; nothing changed.
    Rejected,
    /// A removal for a key with no local lease.
    Absent,
}

/// Per-loader slot in a cache's chain of views.
pub(crate) struct HandlerView {
    pub(crate) id: u64,
    pub(crate) loader: RwLock<Option<Arc<Loader>>>,
    pub(crate) listeners: RwLock<ListenerSupport>,
    pub(crate) deactivation: RwLock<Vec<Arc<dyn DeactivationListener>>>,
    pub(crate) use_event_daemon: AtomicBool,
    pub(crate) valid: AtomicBool,
    pub(crate) expiry_warned: AtomicBool,
}

impl HandlerView {
    fn new(id: u64, loader: Option<Arc<Loader>>, use_event_daemon: bool) -> Self {
        Self {
            id,
            loader: RwLock::new(loader),
            listeners: RwLock::new(ListenerSupport::default()),
            deactivation: RwLock::new(Vec::new()),
            use_event_daemon: AtomicBool::new(use_event_daemon),
            valid: AtomicBool::new(true),
            expiry_warned: AtomicBool::new(false),
        }
    }

    pub(crate) fn loader(&self) -> Option<Arc<Loader>> {
        self.loader.read().clone()
    }

    pub(crate) fn loader_id(&self) -> Option<Uuid> {
        self.loader.read().as_ref().map(|l| l.id())
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(atomic::Ordering::SeqCst)
    }

    /// Valid and bound to a loader.
    pub(crate) fn is_active(&self) -> bool {
        self.is_valid() && self.loader.read().is_some()
    }

    fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    fn uses_event_daemon(&self) -> bool {
        self.use_event_daemon.load(atomic::Ordering::SeqCst)
    }
}

/// Terminates the lease of any entry the backing map drops on its own.
struct LeasePruner {
    leases: Arc<LeaseTable>,
}

impl BackingMapObserver for LeasePruner {
    fn entry_deleted(&self, key: &str, cause: Option<&SuppressionToken>) {
        if !cause.is_some_and(|token| token.covers(key)) {
            self.leases.terminate(key);
        }
    }
}

pub struct CacheStore {
    cache_index: u32,
    name: RwLock<Option<String>>,
    context: Arc<ServiceContext>,
    resources: RwLock<Arc<dyn BackingMap>>,
    leases: Arc<LeaseTable>,
    indexes: OnceLock<IndexMap>,
    views: RwLock<Vec<Arc<HandlerView>>>,
    next_view: AtomicU64,
    observed: AtomicBool,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("cache_index", &self.cache_index)
            .field("name", &*self.name.read())
            .field("views", &self.views.read().len())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(cache_index: u32, name: Option<&str>, context: Arc<ServiceContext>) -> Arc<Self> {
        let leases = Arc::new(LeaseTable::new(cache_index, context.dependencies.graveyard_size));
        let store = Arc::new(Self {
            cache_index,
            name: RwLock::new(name.map(str::to_owned)),
            context,
            resources: RwLock::new(Arc::new(InMemoryBackingMap::new())),
            leases,
            indexes: OnceLock::new(),
            views: RwLock::new(Vec::new()),
            next_view: AtomicU64::new(1),
            observed: AtomicBool::new(false),
        });

        let manager = store.context.backing_manager.clone();
        match (manager, name) {
            (Some(manager), Some(name)) => {
                let map = store.instantiate_backing_map(manager.as_ref(), name);
                *store.resources.write() = map;
            }
            (Some(_), None) => trace!(cache_index, "creating a temporary map"),
            (None, _) => {}
        }
        store.observe(&store.resources());
        store
    }

    pub fn cache_index(&self) -> u32 {
        self.cache_index
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub(crate) fn display_name(&self) -> String {
        self.name()
            .unwrap_or_else(|| format!("{}[{}]", self.context.name, self.cache_index))
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    pub fn resources(&self) -> Arc<dyn BackingMap> {
        self.resources.read().clone()
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub(crate) fn members(&self) -> Arc<MemberSnapshot> {
        self.context.membership.snapshot()
    }

    /// Bind the cache to its name, moving entries out of a temporary map
    /// into the managed backing map.
    pub fn set_cache_name(&self, name: &str) -> Result<()> {
        let mut current = self.name.write();
        match current.as_deref() {
            Some(old) if old == name => return Ok(()),
            Some(old) => {
                return Err(Error::InvalidHandler(format!(
                    "attempt to rename cache {old} to {name}"
                )))
            }
            None => {}
        }

        if let Some(manager) = self.context.backing_manager.clone() {
            let actual = self.instantiate_backing_map(manager.as_ref(), name);
            let temporary = self.resources();
            if !temporary.is_empty() {
                debug!(cache = name, entries = temporary.len(), "transferring entries from temporary map");
                for key in temporary.keys() {
                    if let Some(value) = temporary.get(&key) {
                        actual.put(key, value);
                    }
                }
            }
            if self.observed.swap(false, atomic::Ordering::SeqCst) {
                temporary.unsubscribe();
            }
            self.observe(&actual);
            *self.resources.write() = actual;
        }
        *current = Some(name.to_owned());
        Ok(())
    }

    fn instantiate_backing_map(&self, manager: &dyn BackingMapManager, name: &str) -> Arc<dyn BackingMap> {
        match manager.instantiate_backing_map(name) {
            Ok(map) => {
                if !map.is_empty() {
                    // left over from a previous incarnation of the service
                    map.clear();
                }
                map
            }
            Err(err) => {
                warn!(cache = name, error = %err, "failed to instantiate a backing map; using an in-memory map");
                Arc::new(InMemoryBackingMap::new())
            }
        }
    }

    fn observe(&self, map: &Arc<dyn BackingMap>) {
        let observed = map.subscribe(Arc::new(LeasePruner {
            leases: self.leases.clone(),
        }));
        self.observed.store(observed, atomic::Ordering::SeqCst);
    }

    /// Detach and release the backing map, leaving an empty in-memory one.
    pub(crate) fn release_storage(&self) {
        let map = self.resources();
        if self.observed.swap(false, atomic::Ordering::SeqCst) {
            map.unsubscribe();
        }
        if let (Some(manager), Some(name)) = (&self.context.backing_manager, self.name()) {
            if let Err(err) = manager.release_backing_map(&name, &map) {
                warn!(cache = %name, error = %err, "failed to release a backing map");
            }
        }
        self.leases.clear();
        *self.resources.write() = Arc::new(InMemoryBackingMap::new());
    }

    // ----- views -----

    pub(crate) fn views(&self) -> Vec<Arc<HandlerView>> {
        self.views.read().clone()
    }

    /// The view for a loader: an existing one with the same loader, else an
    /// unbound valid view adopting it, else a new view appended to the chain.
    pub(crate) fn view_for(&self, loader: Option<Arc<Loader>>) -> Arc<HandlerView> {
        let mut views = self.views.write();
        let wanted = loader.as_ref().map(|l| l.id());
        if let Some(view) = views.iter().find(|v| v.is_valid() && v.loader_id() == wanted) {
            return view.clone();
        }
        if loader.is_some() {
            if let Some(view) = views.iter().find(|v| v.is_valid() && v.loader_id().is_none()) {
                *view.loader.write() = loader;
                return view.clone();
            }
        }
        let id = self.next_view.fetch_add(1, atomic::Ordering::SeqCst);
        let view = Arc::new(HandlerView::new(id, loader, self.context.dependencies.use_event_daemon));
        views.push(view.clone());
        view
    }

    pub(crate) fn prime_view(&self) -> Arc<HandlerView> {
        if let Some(view) = self.views.read().first() {
            return view.clone();
        }
        self.view_for(None)
    }

    pub(crate) fn has_valid_views(&self) -> bool {
        self.views.read().iter().any(|v| v.is_valid())
    }

    /// Whether any view of this cache has listeners.
    pub fn has_listeners(&self) -> bool {
        self.views.read().iter().any(|v| v.has_listeners())
    }

    /// Run `f` with the serializer of the given loader, falling back to any
    /// bound view's serializer and finally to JSON.
    pub(crate) fn with_serializer<T>(&self, loader: Option<Uuid>, f: impl FnOnce(&dyn Serializer) -> T) -> T {
        let views = self.views.read();
        let bound = views
            .iter()
            .filter_map(|v| v.loader())
            .find(|l| loader.is_none() || Some(l.id()) == loader)
            .or_else(|| views.iter().find_map(|v| v.loader()));
        drop(views);
        match bound {
            Some(loader) => f(loader.serializer()),
            None => f(&JsonSerializer),
        }
    }

    pub(crate) fn serialization_error(&self, key: &str, source: crate::error::BoxError) -> Error {
        Error::Serialization {
            cache: self.display_name(),
            key: key.to_owned(),
            source,
        }
    }

    // ----- lease callbacks -----

    /// Apply an inbound lease (and possibly a new value) for its key.
    pub(crate) fn on_lease_update(&self, view: &HandlerView, incoming: &Lease, update: LeaseUpdate) -> UpdateOutcome {
        let key = incoming.resource_key.as_str();
        let cell = self.leases.ensure(key);
        let members = self.members();
        let now = self.context.now();
        let resources = self.resources();

        let event = {
            let mut current = cell.lock();
            if current.freshness_cmp(incoming) != Ordering::Less {
                trace!(
                    cache = %self.display_name(),
                    current = %current.describe(&members, now),
                    incoming = %incoming.describe(&members, now),
                    "Rejected update"
                );
                return UpdateOutcome::Rejected;
            }
            current.copy_from(incoming);

            match update {
                LeaseUpdate::Resource { value, expiry } => {
                    let kind = (view.is_active() && self.has_listeners()).then(|| {
                        if resources.contains_key(key) {
                            CacheEventKind::Updated
                        } else {
                            CacheEventKind::Inserted
                        }
                    });
                    current.loader = match &value {
                        Resource::Binary(_) => None,
                        Resource::Object(_) => view.loader_id(),
                    };
                    let old = self.store_resource(resources.as_ref(), key, value.clone(), expiry);
                    self.reindex(key, Some(&value));
                    kind.map(|kind| CacheEvent::new(kind, self.name(), key, old, Some(value)))
                }
                LeaseUpdate::LeaseOnly => {
                    if current.status(&members, now) == LeaseStatus::Available && !resources.contains_key(key) {
                        // unlocked lease without a resource
                        self.leases.terminate(key);
                    }
                    None
                }
            }
        };
        cell.notify_waiters();

        if let Some(event) = event {
            self.dispatch(&event);
        }
        UpdateOutcome::Applied
    }

    /// Apply an inbound removal.
    pub(crate) fn on_lease_remove(&self, view: &HandlerView, incoming: &Lease) -> UpdateOutcome {
        let key = incoming.resource_key.as_str();
        let Some(cell) = self.leases.get(key) else {
            return UpdateOutcome::Absent;
        };
        let members = self.members();
        let now = self.context.now();
        let resources = self.resources();

        let event = {
            let mut current = cell.lock();
            if current.freshness_cmp(incoming) != Ordering::Less {
                trace!(
                    cache = %self.display_name(),
                    current = %current.describe(&members, now),
                    incoming = %incoming.describe(&members, now),
                    "Rejected remove"
                );
                return UpdateOutcome::Rejected;
            }
            current.copy_from(incoming);
            current.loader = None;

            let notify = view.is_active() && self.has_listeners() && resources.contains_key(key);
            let old = resources.remove(key, Some(&SuppressionToken::new(key)));
            self.reindex(key, None);

            if current.status(&members, now) == LeaseStatus::Available {
                self.leases.terminate(key);
            }
            notify.then(|| CacheEvent::new(CacheEventKind::Deleted, self.name(), key, old, None))
        };
        cell.notify_waiters();

        if let Some(event) = event {
            self.dispatch(&event);
        }
        UpdateOutcome::Applied
    }

    fn store_resource(&self, map: &dyn BackingMap, key: &str, value: Resource, expiry: Option<Duration>) -> Option<Resource> {
        match expiry {
            Some(ttl) if map.supports_expiry() => map.put_with_expiry(key.to_owned(), value, ttl),
            Some(_) => {
                warn!(cache = %self.display_name(), "backing map does not support per-entry expiry");
                map.put(key.to_owned(), value)
            }
            None => map.put(key.to_owned(), value),
        }
    }

    pub fn terminate_lease(&self, key: &str) {
        self.leases.terminate(key);
    }

    /// Re-check a lease after a membership change: promote an issuer where
    /// the old one is gone and bury unlocked leases with no resource.
    pub(crate) fn validate_lease(&self, cell: &LeaseCell, members: &MemberSnapshot, now: i64) {
        let orphan = {
            let mut lease = cell.lock();
            lease.validate(members, now);
            match lease.status(members, now) {
                status @ (LeaseStatus::Unissued | LeaseStatus::Available) => {
                    if status == LeaseStatus::Unissued {
                        if let Some(oldest) = members.oldest() {
                            lease.issuer_id = oldest;
                        }
                    }
                    (!self.resources().contains_key(&lease.resource_key)).then(|| lease.resource_key.clone())
                }
                LeaseStatus::Locked | LeaseStatus::Dirty => {
                    if lease.issuer_id.is_none() {
                        lease.issuer_id = lease.holder_id;
                    }
                    None
                }
            }
        };
        cell.notify_waiters();
        if let Some(key) = orphan {
            self.leases.terminate(&key);
        }
    }

    pub fn on_farewell(&self, member: MemberId) {
        let members = self.members();
        let now = self.context.now();
        debug!(cache = %self.display_name(), %member, "revalidating leases after member departure");
        for key in self.leases.keys() {
            if let Some(cell) = self.leases.get(&key) {
                self.validate_lease(&cell, &members, now);
            }
        }
    }

    /// Push a value cached under a loader back to its serialized form.
    pub(crate) fn release_loader(&self, cell: &LeaseCell, key: &str, serializer: &dyn Serializer) -> Result<Option<Resource>> {
        let resources = self.resources();
        let mut lease = cell.lock();
        lease.loader = None;
        match resources.get(key) {
            Some(Resource::Object(value)) => {
                let bin = serializer
                    .serialize(&value)
                    .map_err(|source| self.serialization_error(key, source))?;
                let resource = Resource::Binary(bin);
                resources.put(key.to_owned(), resource.clone());
                Ok(Some(resource))
            }
            other => Ok(other),
        }
    }

    // ----- events -----

    /// Deliver an event to every view with matching listeners.
    pub(crate) fn dispatch(&self, event: &CacheEvent) {
        for view in self.views() {
            let listeners = view.listeners.read().collect(event);
            if listeners.is_empty() {
                continue;
            }
            let event = event.clone().with_loader(view.loader());
            if view.uses_event_daemon() {
                self.context.dispatcher.enqueue(event, listeners);
            } else {
                fire(&event, &listeners);
            }
        }
    }

    // ----- indexes -----

    pub(crate) fn index_map(&self) -> Option<&IndexMap> {
        self.indexes.get()
    }

    pub(crate) fn ensure_index_map(&self) -> &IndexMap {
        self.indexes.get_or_init(IndexMap::default)
    }

    fn reindex(&self, key: &str, value: Option<&Resource>) {
        let Some(indexes) = self.index_map().filter(|i| !i.is_empty()) else {
            return;
        };
        let Some(value) = value else {
            indexes.update(key, None);
            return;
        };
        match self.with_serializer(None, |s| value.to_value(s)) {
            Ok(value) => indexes.update(key, Some(&value)),
            Err(err) => {
                warn!(cache = %self.display_name(), key, error = %err, "cannot index value");
                indexes.update(key, None);
            }
        }
    }
}
