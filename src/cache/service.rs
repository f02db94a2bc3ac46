// Seams to the replicated cache service that owns the handlers.

use super::backing::BackingMapManager;
use super::event::EventDispatcher;
use super::handler::CacheHandler;
use crate::clock::ClusterClock;
use crate::config::ServiceDependencies;
use crate::membership::{MemberId, Membership};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

/// Sequences mutations cluster-wide. Implementations call back into every
/// member's handler chain (including the caller's) once per accepted change.
///
/// Any operation may fail with a retryable concurrent-modification error.
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn update_resource(
        &self,
        handler: &CacheHandler,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
        unlock: bool,
        want_old: bool,
    ) -> Result<Option<Value>>;

    async fn remove_resource(&self, handler: &CacheHandler, key: &str, want_old: bool) -> Result<Option<Value>>;

    /// Returns false when the lock could not be obtained within `wait`.
    async fn lock_resource(
        &self,
        handler: &CacheHandler,
        key: &str,
        lease_millis: i64,
        wait: Duration,
    ) -> Result<bool>;

    async fn unlock_resource(&self, handler: &CacheHandler, key: &str) -> Result<bool>;
}

/// Per-service state shared by all caches on a member.
#[derive(Debug)]
pub struct ServiceContext {
    pub name: String,
    pub membership: Arc<Membership>,
    pub clock: Arc<dyn ClusterClock>,
    pub dependencies: ServiceDependencies,
    pub backing_manager: Option<Arc<dyn BackingMapManager>>,
    pub dispatcher: EventDispatcher,
}

impl ServiceContext {
    pub fn new(
        name: impl Into<String>,
        membership: Arc<Membership>,
        clock: Arc<dyn ClusterClock>,
        dependencies: ServiceDependencies,
    ) -> Self {
        Self {
            name: name.into(),
            membership,
            clock,
            dependencies,
            backing_manager: None,
            dispatcher: EventDispatcher::new(),
        }
    }

    pub fn with_backing_manager(mut self, manager: Arc<dyn BackingMapManager>) -> Self {
        self.backing_manager = Some(manager);
        self
    }

    pub fn this_member(&self) -> MemberId {
        self.membership.this_member()
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }
}

thread_local! {
    static ON_SERVICE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as the service thread until dropped.
pub struct ServiceThreadGuard {
    previous: bool,
}

impl ServiceThreadGuard {
    pub fn enter() -> Self {
        let previous = ON_SERVICE_THREAD.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for ServiceThreadGuard {
    fn drop(&mut self) {
        ON_SERVICE_THREAD.with(|flag| flag.set(self.previous));
    }
}

pub fn on_service_thread() -> bool {
    ON_SERVICE_THREAD.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_thread_guard_nests() {
        assert!(!on_service_thread());
        {
            let _outer = ServiceThreadGuard::enter();
            assert!(on_service_thread());
            {
                let _inner = ServiceThreadGuard::enter();
                assert!(on_service_thread());
            }
            assert!(on_service_thread());
        }
        assert!(!on_service_thread());
    }
}
