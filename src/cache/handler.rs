// Client-facing view of one replicated cache
//
// A CacheHandler pairs the shared cache store with one loader view and the
// service actor that sequences mutations. Reads are served locally; writes
// go through the service, which calls back on_lease_update/on_lease_remove
// on every member (this one included) once the mutation is accepted.

use super::event::{fire, CacheEvent, CacheEventKind, DeactivationListener, Filter, MapListener};
use super::index::ValueExtractor;
use super::resource::{Loader, Resource};
use super::service::{on_service_thread, CacheService, ServiceContext};
use super::store::{CacheStore, HandlerView, LeaseUpdate, UpdateOutcome};
use crate::config::ServiceDependencies;
use crate::lease::{Lease, LeaseCell, LeaseStatus, NO_VERSION};
use crate::membership::MemberId;
use crate::txn::LeaseValidator;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PRIMING_FILTER_REQUIRED: &str = "Priming listeners are only supported with key set filters";

#[derive(Clone)]
pub struct CacheHandler {
    store: Arc<CacheStore>,
    view: Arc<HandlerView>,
    service: Arc<dyn CacheService>,
}

impl fmt::Debug for CacheHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandler")
            .field("cache_index", &self.store.cache_index())
            .field("name", &self.store.name())
            .field("view", &self.view.id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CacheHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheHandler{{Name={}, Index={}, ServiceName={}",
            self.store.name().as_deref().unwrap_or("<unnamed>"),
            self.store.cache_index(),
            self.store.context().name,
        )?;
        match self.view.loader() {
            Some(loader) => write!(f, ", Loader={loader}")?,
            None => write!(f, ", Loader=<none>")?,
        }
        if !self.view.is_valid() {
            write!(f, ", INVALID")?;
        }
        write!(f, "}}")
    }
}

impl CacheHandler {
    pub(crate) fn new(store: Arc<CacheStore>, view: Arc<HandlerView>, service: Arc<dyn CacheService>) -> Self {
        Self { store, view, service }
    }

    pub fn cache_index(&self) -> u32 {
        self.store.cache_index()
    }

    pub fn cache_name(&self) -> Option<String> {
        self.store.name()
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        self.store.context()
    }

    pub fn dependencies(&self) -> &ServiceDependencies {
        &self.store.context().dependencies
    }

    pub fn this_member(&self) -> MemberId {
        self.store.context().this_member()
    }

    pub fn loader(&self) -> Option<Arc<Loader>> {
        self.view.loader()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Valid and bound to a loader.
    pub fn is_active(&self) -> bool {
        self.view.is_active()
    }

    pub fn is_valid(&self) -> bool {
        self.view.is_valid()
    }

    pub fn set_use_event_daemon(&self, enabled: bool) {
        self.view.use_event_daemon.store(enabled, Ordering::SeqCst);
    }

    pub fn set_cache_name(&self, name: &str) -> Result<()> {
        self.store.set_cache_name(name)
    }

    fn check_access(&self) -> Result<()> {
        if self.view.is_valid() || on_service_thread() {
            Ok(())
        } else {
            Err(Error::InvalidHandler(self.store.display_name()))
        }
    }

    // ----- leases -----

    pub fn lease(&self, key: &str) -> Option<Lease> {
        self.store.leases().get(key).map(|cell| cell.snapshot())
    }

    pub fn lease_cell(&self, key: &str) -> Option<Arc<LeaseCell>> {
        self.store.leases().get(key)
    }

    pub fn ensure_lease(&self, key: &str) -> Arc<LeaseCell> {
        self.store.leases().ensure(key)
    }

    pub fn lease_status(&self, lease: &Lease) -> LeaseStatus {
        lease.status(&self.store.members(), self.store.context().now())
    }

    pub fn terminate_lease(&self, key: &str) {
        self.store.terminate_lease(key);
    }

    pub fn on_lease_update(&self, lease: &Lease, update: LeaseUpdate) -> UpdateOutcome {
        self.store.on_lease_update(&self.view, lease, update)
    }

    pub fn on_lease_remove(&self, lease: &Lease) -> UpdateOutcome {
        self.store.on_lease_remove(&self.view, lease)
    }

    pub fn on_farewell(&self, member: MemberId) {
        self.store.on_farewell(member);
    }

    // ----- reads -----

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_access()?;
        let resources = self.store.resources();
        let Some(resource) = resources.get(key) else {
            return Ok(None);
        };

        let bin = match resource {
            Resource::Object(value) => {
                let cell = self.store.leases().get(key);
                let cached = cell.as_ref().and_then(|c| c.lock().loader);
                if cached.is_none() || cached == self.view.loader_id() {
                    return Ok(Some(value.as_ref().clone()));
                }
                // materialized under another loader
                let Some(cell) = cell else {
                    return Ok(Some(value.as_ref().clone()));
                };
                let released = self
                    .store
                    .with_serializer(cached, |s| self.store.release_loader(&cell, key, s))?;
                match released {
                    Some(Resource::Binary(bin)) => bin,
                    Some(Resource::Object(value)) => return Ok(Some(value.as_ref().clone())),
                    None => return Ok(None),
                }
            }
            Resource::Binary(bin) => bin,
        };

        let Some(loader) = self.view.loader() else {
            return self
                .store
                .with_serializer(None, |s| s.deserialize(&bin))
                .map(Some)
                .map_err(|source| self.store.serialization_error(key, source));
        };
        let value = loader
            .serializer()
            .deserialize(&bin)
            .map_err(|source| self.store.serialization_error(key, source))?;

        // cache the materialized form unless the resource changed meanwhile
        let cell = self.store.leases().ensure(key);
        let mut lease = cell.lock();
        if resources.get(key).is_some_and(|r| r.is_same_binary(&bin)) {
            if lease.resource_version == NO_VERSION {
                lease.increment_resource_version();
            }
            lease.loader = Some(loader.id());
            resources.put(key.to_owned(), Resource::object(value.clone()));
        }
        Ok(Some(value))
    }

    pub fn get_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key)? {
                found.insert(key.to_owned(), value);
            }
        }
        Ok(found)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.check_access()?;
        Ok(self.store.resources().contains_key(key))
    }

    /// Whether any entry holds the value, in either its materialized or its
    /// serialized form.
    pub fn contains_value(&self, value: &Value) -> Result<bool> {
        self.check_access()?;
        let resources = self.store.resources();
        let bin = match self.view.loader() {
            Some(loader) => loader.serializer().serialize(value),
            None => self.store.with_serializer(None, |s| s.serialize(value)),
        }
        .map_err(|source| self.store.serialization_error("<value>", source))?;

        Ok(resources.keys().iter().any(|key| match resources.get(key) {
            Some(Resource::Object(held)) => held.as_ref() == value,
            Some(Resource::Binary(held)) => held == bin,
            None => false,
        }))
    }

    pub fn size(&self) -> Result<usize> {
        self.check_access()?;
        Ok(self.store.resources().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.check_access()?;
        Ok(self.store.resources().keys())
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        for key in self.keys()? {
            if let Some(value) = self.get(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    // ----- writes -----

    /// Run a service call, retrying on concurrent modification with a
    /// linearly growing backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deps = self.dependencies();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    tokio::time::sleep(deps.retry_backoff(attempt)).await;
                    if attempt >= deps.max_map_retries {
                        warn!(cache = %self.store.display_name(), key, operation, attempts = attempt, "giving up after concurrent modifications");
                        return Err(err);
                    }
                    debug!(cache = %self.store.display_name(), key, operation, attempt, error = %err, "retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Store a value, returning the previous one.
    pub async fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.check_access()?;
        self.with_retry("put", key, || {
            self.service
                .update_resource(self, key, value.clone(), None, false, true)
        })
        .await
    }

    /// Store a value with a time to live. Backing maps without per-entry
    /// expiry keep the value indefinitely.
    pub async fn put_with_expiry(&self, key: &str, value: Value, ttl: Duration) -> Result<Option<Value>> {
        self.check_access()?;
        if !self.store.resources().supports_expiry() && !self.view.expiry_warned.swap(true, Ordering::SeqCst) {
            warn!(cache = %self.store.display_name(), "per-entry expiry is not supported by this cache; ignoring it");
        }
        self.with_retry("put", key, || {
            self.service
                .update_resource(self, key, value.clone(), Some(ttl), false, true)
        })
        .await
    }

    pub async fn put_all(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        self.check_access()?;
        for (key, value) in entries {
            self.with_retry("put", &key, || {
                self.service
                    .update_resource(self, &key, value.clone(), None, false, false)
            })
            .await?;
        }
        Ok(())
    }

    /// Store a value and release this member's lock on the key.
    pub async fn put_final(&self, key: &str, value: Value) -> Result<()> {
        self.check_access()?;
        self.service
            .update_resource(self, key, value, None, true, false)
            .await
            .map(drop)
    }

    pub async fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.check_access()?;
        self.with_retry("remove", key, || self.service.remove_resource(self, key, true))
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.with_retry("remove", &key, || self.service.remove_resource(self, &key, false))
                .await?;
        }
        Ok(())
    }

    // ----- locks -----

    /// Try to lock without waiting.
    pub async fn lock(&self, key: &str) -> Result<bool> {
        self.lock_with_wait(key, Duration::ZERO).await
    }

    pub async fn lock_with_wait(&self, key: &str, wait: Duration) -> Result<bool> {
        self.check_access()?;
        let lease_millis = self.dependencies().standard_lease_millis;
        self.service.lock_resource(self, key, lease_millis, wait).await
    }

    pub async fn unlock(&self, key: &str) -> Result<bool> {
        self.check_access()?;
        self.service.unlock_resource(self, key).await
    }

    /// Lock a key, waiting up to the standard lease duration, and read it.
    pub async fn get_locked_resource(&self, key: &str) -> Result<Option<Value>> {
        let wait = Duration::from_millis(u64::try_from(self.dependencies().standard_lease_millis).unwrap_or(0));
        if self.lock_with_wait(key, wait).await? {
            self.get(key)
        } else {
            Err(Error::concurrent_modification(
                self.store.display_name(),
                format!("unable to lock {key}"),
            ))
        }
    }

    // ----- listeners -----

    pub fn add_map_listener(&self, listener: Arc<dyn MapListener>, lite: bool) -> Result<()> {
        self.check_access()?;
        if listener.is_priming() {
            return Err(Error::UnsupportedListener(PRIMING_FILTER_REQUIRED.into()));
        }
        self.view.listeners.write().add(listener, lite);
        Ok(())
    }

    /// Register for events passing a filter. Priming listeners must use a
    /// key set filter; they are registered per key and primed immediately.
    pub fn add_filter_listener(&self, listener: Arc<dyn MapListener>, filter: Arc<dyn Filter>, lite: bool) -> Result<()> {
        self.check_access()?;
        if !listener.is_priming() {
            self.view.listeners.write().add_filtered(listener, filter, lite);
            return Ok(());
        }
        let Some(keys) = filter.key_set() else {
            return Err(Error::UnsupportedListener(PRIMING_FILTER_REQUIRED.into()));
        };
        for key in keys {
            self.add_key_listener(listener.clone(), key, lite)?;
        }
        Ok(())
    }

    pub fn add_key_listener(&self, listener: Arc<dyn MapListener>, key: &str, lite: bool) -> Result<()> {
        self.check_access()?;
        self.view.listeners.write().add_key(listener.clone(), key, lite);
        if listener.is_priming() {
            self.prime(listener, key, lite);
        }
        Ok(())
    }

    fn prime(&self, listener: Arc<dyn MapListener>, key: &str, lite: bool) {
        let Some(current) = self.store.resources().get(key) else {
            return;
        };
        let event = CacheEvent::new(CacheEventKind::Updated, self.store.name(), key, None, Some(current))
            .as_priming()
            .with_loader(self.view.loader());
        let listeners = vec![(listener, lite)];
        if self.view.use_event_daemon.load(Ordering::SeqCst) {
            self.store.context().dispatcher.enqueue(event, listeners);
        } else {
            fire(&event, &listeners);
        }
    }

    pub fn remove_map_listener(&self, listener: &Arc<dyn MapListener>) {
        self.view.listeners.write().remove(listener);
    }

    pub fn remove_key_listener(&self, listener: &Arc<dyn MapListener>, key: &str) {
        self.view.listeners.write().remove_key(listener, key);
    }

    pub fn add_deactivation_listener(&self, listener: Arc<dyn DeactivationListener>) {
        self.view.deactivation.write().push(listener);
    }

    pub fn remove_deactivation_listener(&self, listener: &Arc<dyn DeactivationListener>) {
        self.view
            .deactivation
            .write()
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    // ----- lifecycle -----

    /// Push every value cached under this handler's loader back to its
    /// serialized form, release this member's locks and unbind the loader.
    pub async fn release_class_loader(&self) -> Result<()> {
        let Some(loader) = self.view.loader.write().take() else {
            return Ok(());
        };
        let this = self.this_member();
        for key in self.store.leases().keys() {
            let Some(cell) = self.store.leases().get(&key) else {
                continue;
            };
            let (locked_here, cached) = {
                let lease = cell.lock();
                (
                    lease.holder_id == this && self.lease_status(&lease) == LeaseStatus::Locked,
                    lease.loader,
                )
            };
            if locked_here {
                self.service.unlock_resource(self, &key).await?;
            }
            if cached == Some(loader.id()) {
                self.store.release_loader(&cell, &key, loader.serializer())?;
            }
        }
        debug!(cache = %self.store.display_name(), %loader, "released loader");
        Ok(())
    }

    /// Detach listeners, loader and (for the last valid view) the backing
    /// store, then notify deactivation listeners once.
    pub fn invalidate(&self) {
        if !self.view.valid.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.view.loader.write() = None;
        *self.view.listeners.write() = Default::default();
        if !self.store.has_valid_views() {
            self.store.release_storage();
        }
        let name = self.store.name();
        let listeners = std::mem::take(&mut *self.view.deactivation.write());
        for listener in listeners {
            listener.deactivated(name.as_deref());
        }
    }

    // ----- transactions -----

    /// Fresh optimistic validator over this cache.
    pub fn validator(&self) -> LeaseValidator {
        LeaseValidator::new(self.clone())
    }

    // ----- indexes -----

    /// Index every current value with the extractor. Returns false when the
    /// extractor is already indexed.
    pub fn add_index(&self, extractor: Arc<dyn ValueExtractor>) -> Result<bool> {
        self.check_access()?;
        let mut entries = Vec::new();
        for key in self.store.resources().keys() {
            if let Some(value) = self.get(&key)? {
                entries.push((key, value));
            }
        }
        let indexes = self.store.ensure_index_map();
        Ok(indexes.add(extractor, entries.iter().map(|(k, v)| (k.as_str(), v.clone()))))
    }

    pub fn remove_index(&self, extractor: &dyn ValueExtractor) -> bool {
        self.store.index_map().is_some_and(|i| i.remove(extractor))
    }

    pub fn release_index_map(&self) {
        if let Some(indexes) = self.store.index_map() {
            indexes.clear();
        }
    }

    pub fn index_lookup(&self, extractor: &dyn ValueExtractor, attr: &Value) -> Option<HashSet<String>> {
        self.store.index_map()?.lookup(extractor, attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PointerExtractor;
    use crate::test_utils::LoopbackCluster;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_then_get_on_same_member() {
        let cluster = LoopbackCluster::new(2);
        let handler = cluster.handler(1, "orders");

        assert_eq!(handler.put("a", json!({"qty": 1})).await.unwrap(), None);
        assert_eq!(handler.get("a").unwrap(), Some(json!({"qty": 1})));
        assert_eq!(handler.put("a", json!({"qty": 2})).await.unwrap(), Some(json!({"qty": 1})));
        assert_eq!(handler.size().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remote_value_is_materialized_on_read() {
        let cluster = LoopbackCluster::new(2);
        let writer = cluster.handler(1, "orders");
        let reader = cluster.handler(2, "orders");

        writer.put("a", json!([1, 2])).await.unwrap();
        assert!(reader.store().resources().get("a").unwrap().is_binary());
        assert_eq!(reader.get("a").unwrap(), Some(json!([1, 2])));
        assert!(!reader.store().resources().get("a").unwrap().is_binary());
        assert_eq!(reader.lease("a").unwrap().loader, reader.loader().map(|l| l.id()));
    }

    #[tokio::test]
    async fn test_contains_value_matches_either_form() {
        let cluster = LoopbackCluster::new(2);
        let writer = cluster.handler(1, "orders");
        let reader = cluster.handler(2, "orders");

        writer.put("a", json!("x")).await.unwrap();
        assert!(writer.contains_value(&json!("x")).unwrap());
        assert!(reader.contains_value(&json!("x")).unwrap());
        assert!(!reader.contains_value(&json!("y")).unwrap());
    }

    #[tokio::test]
    async fn test_priming_listener_requires_key_set() {
        use crate::cache::{KeyPrefixFilter, KeySetFilter};
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct Priming(AtomicUsize);
        impl MapListener for Priming {
            fn entry_updated(&self, event: &CacheEvent) {
                if event.priming {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
            fn is_priming(&self) -> bool {
                true
            }
        }

        let cluster = LoopbackCluster::new(1);
        let handler = cluster.handler(1, "orders");
        handler.set_use_event_daemon(false);
        handler.put("a", json!(1)).await.unwrap();

        let priming = Arc::new(Priming::default());
        let listener: Arc<dyn MapListener> = priming.clone();
        assert!(matches!(
            handler.add_map_listener(listener.clone(), false),
            Err(Error::UnsupportedListener(_))
        ));
        assert!(matches!(
            handler.add_filter_listener(listener.clone(), Arc::new(KeyPrefixFilter("a".into())), false),
            Err(Error::UnsupportedListener(_))
        ));
        handler
            .add_filter_listener(listener, Arc::new(KeySetFilter::new(["a", "b"])), false)
            .unwrap();
        assert_eq!(priming.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidated_handler_rejects_access() {
        struct Flag(std::sync::atomic::AtomicBool);
        impl DeactivationListener for Flag {
            fn deactivated(&self, _cache_name: Option<&str>) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let cluster = LoopbackCluster::new(1);
        let handler = cluster.handler(1, "orders");
        let flag = Arc::new(Flag(false.into()));
        handler.add_deactivation_listener(flag.clone());

        handler.invalidate();
        handler.invalidate();
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(matches!(handler.get("a"), Err(Error::InvalidHandler(_))));
        assert!(handler.to_string().ends_with("INVALID}"));
    }

    #[tokio::test]
    async fn test_index_follows_mutations() {
        let cluster = LoopbackCluster::new(2);
        let handler = cluster.handler(1, "people");
        let by_city = Arc::new(PointerExtractor("/city".into()));

        handler.put("ann", json!({"city": "Oslo"})).await.unwrap();
        assert!(handler.add_index(by_city.clone()).unwrap());
        handler.put("bob", json!({"city": "Oslo"})).await.unwrap();
        handler.remove("ann").await.unwrap();

        let oslo = handler.index_lookup(by_city.as_ref(), &json!("Oslo")).unwrap();
        assert_eq!(oslo, HashSet::from(["bob".to_string()]));
        assert!(handler.remove_index(by_city.as_ref()));
        assert!(handler.index_lookup(by_city.as_ref(), &json!("Oslo")).is_none());
    }

    #[tokio::test]
    async fn test_release_class_loader_serializes_cached_values() {
        let cluster = LoopbackCluster::new(1);
        let handler = cluster.handler(1, "orders");
        handler.put("a", json!(7)).await.unwrap();
        assert!(!handler.store().resources().get("a").unwrap().is_binary());

        handler.release_class_loader().await.unwrap();
        assert!(!handler.is_active());
        assert!(handler.store().resources().get("a").unwrap().is_binary());
        assert_eq!(handler.lease("a").unwrap().loader, None);
    }
}
