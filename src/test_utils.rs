// In-process stand-ins for the replicated cache service and its transport
//
// LoopbackCluster plays the service actor for a handful of simulated
// members: it sequences mutations under a cluster-wide lock and calls the
// lease callbacks of every member, the originating one last. ConfigBus
// queues config map messages so tests decide when they are delivered.

use crate::cache::{
    CacheHandler, CacheService, HandlerRegistry, InMemoryBackingMapManager, JsonSerializer, LeaseUpdate, Loader,
    Resource, Serializer, ServiceContext, ServiceThreadGuard, UpdateOutcome,
};
use crate::clock::{ClusterClock, ManualClock};
use crate::config::ServiceDependencies;
use crate::config_map::{ConfigMap, ConfigMessage, ConfigTransport};
use crate::lease::{Lease, LeaseStatus};
use crate::membership::{MemberId, Membership};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

pub const SERVICE_NAME: &str = "ReplicatedCache";

/// One simulated member.
pub struct LoopbackNode {
    pub id: MemberId,
    pub membership: Arc<Membership>,
    pub registry: Arc<HandlerRegistry>,
    pub loader: Arc<Loader>,
}

struct ClusterInner {
    clock: Arc<ManualClock>,
    dependencies: ServiceDependencies,
    nodes: RwLock<BTreeMap<MemberId, Arc<LoopbackNode>>>,
    catalog: DashMap<String, u32>,
    next_index: AtomicU32,
    service_thread: tokio::sync::Mutex<()>,
    conflicts: AtomicU32,
    calls: AtomicU64,
}

impl ClusterInner {
    fn node(&self, id: MemberId) -> Option<Arc<LoopbackNode>> {
        self.nodes.read().get(&id).cloned()
    }

    fn live_members(&self) -> Vec<MemberId> {
        self.nodes.read().keys().copied().collect()
    }

    /// Count the call and fail it if a conflict was injected.
    fn admit(&self, handler: &CacheHandler, key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::concurrent_modification(
                handler.cache_name().unwrap_or_default(),
                format!("injected conflict on {key}"),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LoopbackCluster {
    inner: Arc<ClusterInner>,
}

impl LoopbackCluster {
    /// Members 1..=n, oldest first.
    pub fn new(members: u16) -> Self {
        Self::with_dependencies(members, ServiceDependencies::default())
    }

    pub fn with_dependencies(members: u16, dependencies: ServiceDependencies) -> Self {
        let inner = Arc::new(ClusterInner {
            clock: Arc::new(ManualClock::new(1_000)),
            dependencies,
            nodes: RwLock::new(BTreeMap::new()),
            catalog: DashMap::new(),
            next_index: AtomicU32::new(0),
            service_thread: tokio::sync::Mutex::new(()),
            conflicts: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        });

        let ids: Vec<MemberId> = (1..=members).map(MemberId).collect();
        for &id in &ids {
            let membership = Arc::new(Membership::new(id, ids.clone()));
            let clock: Arc<dyn ClusterClock> = inner.clock.clone();
            let context = ServiceContext::new(SERVICE_NAME, membership.clone(), clock, inner.dependencies.clone())
                .with_backing_manager(Arc::new(InMemoryBackingMapManager::new()));
            let service: Arc<dyn CacheService> = Arc::new(LoopbackService {
                cluster: Arc::downgrade(&inner),
                member: id,
            });
            let node = LoopbackNode {
                id,
                membership,
                registry: Arc::new(HandlerRegistry::new(Arc::new(context), service)),
                loader: Loader::new(format!("member-{}", id.0)),
            };
            inner.nodes.write().insert(id, Arc::new(node));
        }
        Self { inner }
    }

    pub fn node(&self, member: u16) -> Arc<LoopbackNode> {
        self.inner
            .node(MemberId(member))
            .unwrap_or_else(|| panic!("member {member} is not in the cluster"))
    }

    pub fn registry(&self, member: u16) -> Arc<HandlerRegistry> {
        self.node(member).registry.clone()
    }

    /// Handler of a named cache on a member, bound to the member's loader.
    pub fn handler(&self, member: u16, name: &str) -> CacheHandler {
        let index = *self
            .inner
            .catalog
            .entry(name.to_owned())
            .or_insert_with(|| self.inner.next_index.fetch_add(1, Ordering::SeqCst));
        let node = self.node(member);
        node.registry
            .ensure_cache(index, name, node.loader.clone())
            .unwrap_or_else(|err| panic!("cannot create cache {name}: {err}"))
    }

    pub fn clock(&self) -> &ManualClock {
        &self.inner.clock
    }

    /// Fail the next `count` service calls with a concurrent modification.
    pub fn inject_conflicts(&self, count: u32) {
        self.inner.conflicts.store(count, Ordering::SeqCst);
    }

    /// Service calls made so far, failed ones included.
    pub fn service_calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Remove a member; the survivors revalidate their leases.
    pub fn depart(&self, member: u16) {
        let departed = MemberId(member);
        self.inner.nodes.write().remove(&departed);
        let survivors: Vec<_> = self.inner.nodes.read().values().cloned().collect();
        for node in survivors {
            node.membership.leave(departed);
            let _thread = ServiceThreadGuard::enter();
            node.registry.on_farewell(departed);
        }
        debug!(%departed, "member left the loopback cluster");
    }

    /// Wait until every member's dispatcher delivered queued events.
    pub async fn drain_events(&self) {
        let nodes: Vec<_> = self.inner.nodes.read().values().cloned().collect();
        for node in nodes {
            node.registry.context().dispatcher.drain().await;
        }
    }
}

enum Delivery {
    Value {
        value: Value,
        bin: Bytes,
        expiry: Option<Duration>,
    },
    LeaseOnly,
    Remove,
}

struct LoopbackService {
    cluster: Weak<ClusterInner>,
    member: MemberId,
}

impl LoopbackService {
    fn cluster(&self) -> Result<Arc<ClusterInner>> {
        self.cluster
            .upgrade()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("loopback cluster is gone")))
    }

    /// Issue the lease if nobody does, then check it is not locked by
    /// another member.
    fn prepare(&self, cluster: &ClusterInner, handler: &CacheHandler, key: &str) -> Result<(Lease, LeaseStatus)> {
        let members = handler.context().membership.snapshot();
        let now = handler.context().now();
        let mut lease = handler.ensure_lease(key).snapshot();
        lease.validate(&members, now);
        let status = lease.status(&members, now);
        match status {
            LeaseStatus::Unissued => {
                lease.issuer_id = if cluster.dependencies.mobile_issues {
                    self.member
                } else {
                    members.oldest().unwrap_or(self.member)
                };
                lease.increment_lease_version();
            }
            LeaseStatus::Locked if lease.issuer_id.is_none() => lease.issuer_id = self.member,
            LeaseStatus::Dirty => {
                return Err(Error::concurrent_modification(
                    handler.cache_name().unwrap_or_default(),
                    format!("{key} is locked by member {}", lease.holder_id),
                ))
            }
            LeaseStatus::Available | LeaseStatus::Locked => {}
        }
        Ok((lease, status))
    }

    /// Call the lease callbacks of every member: issuer first, origin last.
    fn deliver(&self, cluster: &ClusterInner, handler: &CacheHandler, lease: &Lease, delivery: &Delivery) -> Result<()> {
        let issuer = lease.issuer_id;
        let mut order = vec![issuer];
        order.extend(
            cluster
                .live_members()
                .into_iter()
                .filter(|m| *m != issuer && *m != self.member),
        );
        if issuer != self.member {
            order.push(self.member);
        }

        let _thread = ServiceThreadGuard::enter();
        for member in order {
            let outcome = if member == self.member {
                apply(handler, lease, delivery, true)
            } else {
                let Some(node) = cluster.node(member) else {
                    continue;
                };
                apply(&node.registry.prime_handler(handler.cache_index()), lease, delivery, false)
            };
            trace!(%member, key = %lease.resource_key, ?outcome, "delivered lease");
            if member == issuer && outcome == UpdateOutcome::Rejected {
                return Err(Error::concurrent_modification(
                    handler.cache_name().unwrap_or_default(),
                    format!("issuer {issuer} rejected {}", lease.resource_key),
                ));
            }
        }
        Ok(())
    }
}

fn apply(handler: &CacheHandler, lease: &Lease, delivery: &Delivery, origin: bool) -> UpdateOutcome {
    match delivery {
        Delivery::Value { value, bin, expiry } => {
            let value = if origin {
                Resource::object(value.clone())
            } else {
                Resource::Binary(bin.clone())
            };
            handler.on_lease_update(lease, LeaseUpdate::Resource { value, expiry: *expiry })
        }
        Delivery::LeaseOnly => handler.on_lease_update(lease, LeaseUpdate::LeaseOnly),
        Delivery::Remove => handler.on_lease_remove(lease),
    }
}

#[async_trait]
impl CacheService for LoopbackService {
    async fn update_resource(
        &self,
        handler: &CacheHandler,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
        unlock: bool,
        want_old: bool,
    ) -> Result<Option<Value>> {
        let cluster = self.cluster()?;
        let _service = cluster.service_thread.lock().await;
        cluster.admit(handler, key)?;

        let (mut lease, status) = self.prepare(&cluster, handler, key)?;
        if unlock && status == LeaseStatus::Locked {
            lease.unlock(handler.context().now());
            lease.increment_lease_version();
        }
        let old = if want_old { handler.get(key)? } else { None };

        let bin = match handler.loader() {
            Some(loader) => loader.serializer().serialize(&value),
            None => JsonSerializer.serialize(&value),
        }
        .map_err(|source| Error::Serialization {
            cache: handler.cache_name().unwrap_or_default(),
            key: key.to_owned(),
            source,
        })?;
        lease.resource_size = i32::try_from(bin.len()).unwrap_or(i32::MAX);
        lease.increment_resource_version();

        self.deliver(&cluster, handler, &lease, &Delivery::Value { value, bin, expiry })?;
        Ok(old)
    }

    async fn remove_resource(&self, handler: &CacheHandler, key: &str, want_old: bool) -> Result<Option<Value>> {
        let cluster = self.cluster()?;
        let _service = cluster.service_thread.lock().await;
        cluster.admit(handler, key)?;

        if !handler.contains_key(key)? {
            return Ok(None);
        }
        let (mut lease, _) = self.prepare(&cluster, handler, key)?;
        let old = if want_old { handler.get(key)? } else { None };
        lease.increment_resource_version();

        self.deliver(&cluster, handler, &lease, &Delivery::Remove)?;
        Ok(old)
    }

    async fn lock_resource(&self, handler: &CacheHandler, key: &str, lease_millis: i64, wait: Duration) -> Result<bool> {
        let cluster = self.cluster()?;
        let deadline = tokio::time::Instant::now() + wait;
        let cell = handler.ensure_lease(key);
        loop {
            let changed = cell.changed();
            {
                let _service = cluster.service_thread.lock().await;
                cluster.admit(handler, key)?;
                match self.prepare(&cluster, handler, key) {
                    Ok((mut lease, _)) => {
                        lease.lock(self.member, handler.context().now(), lease_millis);
                        lease.increment_lease_version();
                        self.deliver(&cluster, handler, &lease, &Delivery::LeaseOnly)?;
                        return Ok(true);
                    }
                    Err(err) if err.is_retryable() => {}
                    Err(err) => return Err(err),
                }
            }
            if wait.is_zero() || tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn unlock_resource(&self, handler: &CacheHandler, key: &str) -> Result<bool> {
        let cluster = self.cluster()?;
        let _service = cluster.service_thread.lock().await;
        cluster.admit(handler, key)?;

        let Some(mut lease) = handler.lease(key) else {
            return Ok(false);
        };
        if lease.holder_id != self.member {
            return Ok(false);
        }
        lease.unlock(handler.context().now());
        lease.increment_lease_version();
        self.deliver(&cluster, handler, &lease, &Delivery::LeaseOnly)?;
        Ok(true)
    }
}

// ----- config map transport -----

type Envelope = (MemberId, MemberId, ConfigMessage);

#[derive(Default)]
struct BusQueue {
    queue: Mutex<VecDeque<Envelope>>,
}

impl ConfigTransport for BusQueue {
    fn send(&self, from: MemberId, to: MemberId, message: ConfigMessage) {
        trace!(%from, %to, %message, "queued config message");
        self.queue.lock().push_back((from, to, message));
    }
}

/// Config maps of several members joined by an explicitly pumped queue.
pub struct ConfigBus {
    queue: Arc<BusQueue>,
    maps: RwLock<BTreeMap<MemberId, (Arc<Membership>, Arc<ConfigMap>)>>,
}

impl ConfigBus {
    /// Members 1..=n, oldest first.
    pub fn new(members: u16) -> Self {
        let ids: Vec<u16> = (1..=members).collect();
        Self::with_members(&ids)
    }

    /// Members in the given order of seniority.
    pub fn with_members(ids: &[u16]) -> Self {
        let queue = Arc::new(BusQueue::default());
        let all: Vec<MemberId> = ids.iter().copied().map(MemberId).collect();
        let mut maps = BTreeMap::new();
        for &id in &all {
            let membership = Arc::new(Membership::new(id, all.clone()));
            let transport: Arc<dyn ConfigTransport> = queue.clone();
            let map = Arc::new(ConfigMap::new("ServiceConfig", membership.clone(), transport));
            maps.insert(id, (membership, map));
        }
        Self {
            queue,
            maps: RwLock::new(maps),
        }
    }

    pub fn map(&self, member: u16) -> Arc<ConfigMap> {
        self.maps
            .read()
            .get(&MemberId(member))
            .map(|(_, map)| map.clone())
            .unwrap_or_else(|| panic!("member {member} is not on the bus"))
    }

    pub fn queued(&self) -> usize {
        self.queue.queue.lock().len()
    }

    /// Deliver the oldest queued message. Messages to departed members are
    /// dropped. Returns false when the queue is empty.
    pub fn deliver_next(&self) -> bool {
        let Some((from, to, message)) = self.queue.queue.lock().pop_front() else {
            return false;
        };
        let target = self.maps.read().get(&to).map(|(_, map)| map.clone());
        match target {
            Some(map) => map.on_message(from, message),
            None => trace!(%from, %to, %message, "dropped message to departed member"),
        }
        true
    }

    /// Deliver until the queue is empty; returns how many were handled.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// Remove a member and tell every survivor.
    pub fn depart(&self, member: u16) {
        let departed = MemberId(member);
        self.maps.write().remove(&departed);
        let survivors: Vec<_> = self.maps.read().values().cloned().collect();
        for (membership, map) in survivors {
            let was_coordinator = map.coordinator() == Some(departed);
            membership.leave(departed);
            map.on_service_left(departed, was_coordinator);
        }
    }
}
