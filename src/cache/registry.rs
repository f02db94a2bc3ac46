// Caches of one service on one member, by index and by name

use super::handler::CacheHandler;
use super::resource::Loader;
use super::service::{CacheService, ServiceContext};
use super::store::CacheStore;
use crate::membership::MemberId;
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct HandlerRegistry {
    context: Arc<ServiceContext>,
    service: Arc<dyn CacheService>,
    stores: DashMap<u32, Arc<CacheStore>>,
    names: DashMap<String, u32>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("service", &self.context.name)
            .field("caches", &self.stores.len())
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    pub fn new(context: Arc<ServiceContext>, service: Arc<dyn CacheService>) -> Self {
        Self {
            context,
            service,
            stores: DashMap::new(),
            names: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    fn ensure_store(&self, cache_index: u32, name: Option<&str>) -> Arc<CacheStore> {
        self.stores
            .entry(cache_index)
            .or_insert_with(|| {
                debug!(service = %self.context.name, cache_index, "creating cache store");
                CacheStore::new(cache_index, name, self.context.clone())
            })
            .clone()
    }

    /// Handler of a named cache for a loader, creating the cache and the
    /// loader's view as needed.
    pub fn ensure_cache(&self, cache_index: u32, name: &str, loader: Arc<Loader>) -> Result<CacheHandler> {
        let store = self.ensure_store(cache_index, Some(name));
        store.set_cache_name(name)?;
        self.names.insert(name.to_owned(), cache_index);
        let view = store.view_for(Some(loader));
        Ok(CacheHandler::new(store, view, self.service.clone()))
    }

    /// The first handler of a cache chain; the target of replication
    /// traffic. Creates a nameless cache when the index is unknown.
    pub fn prime_handler(&self, cache_index: u32) -> CacheHandler {
        let store = self.ensure_store(cache_index, None);
        let view = store.prime_view();
        CacheHandler::new(store, view, self.service.clone())
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.names.get(name).map(|i| *i)
    }

    pub fn cache_indexes(&self) -> Vec<u32> {
        self.stores.iter().map(|e| *e.key()).collect()
    }

    /// Revalidate every lease after a member left.
    pub fn on_farewell(&self, member: MemberId) {
        let stores: Vec<_> = self.stores.iter().map(|e| e.value().clone()).collect();
        for store in stores {
            store.on_farewell(member);
        }
    }

    /// Release a handler's loader, leaving the cache in place.
    pub async fn release_cache(&self, handler: &CacheHandler) -> Result<()> {
        handler.release_class_loader().await
    }

    /// Invalidate every view of a cache and forget it.
    pub fn destroy_cache(&self, name: &str) -> bool {
        let Some((_, cache_index)) = self.names.remove(name) else {
            return false;
        };
        let Some((_, store)) = self.stores.remove(&cache_index) else {
            return false;
        };
        for view in store.views() {
            CacheHandler::new(store.clone(), view, self.service.clone()).invalidate();
        }
        info!(service = %self.context.name, cache = name, "destroyed cache");
        true
    }
}
