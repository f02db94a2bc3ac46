use bytes::Bytes;
use replcache::cache::{CacheEvent, LeaseUpdate, MapListener, Resource, UpdateOutcome};
use replcache::config::ServiceDependencies;
use replcache::lease::Lease;
use replcache::test_utils::LoopbackCluster;
use replcache::{Error, MemberId};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Tally {
    inserted: AtomicUsize,
    updated: AtomicUsize,
    deleted: AtomicUsize,
    with_values: AtomicUsize,
}

impl Tally {
    fn total(&self) -> usize {
        self.inserted.load(Ordering::SeqCst) + self.updated.load(Ordering::SeqCst) + self.deleted.load(Ordering::SeqCst)
    }

    fn saw(&self, event: &CacheEvent) {
        if matches!(event.new_value(), Ok(Some(_))) || matches!(event.old_value(), Ok(Some(_))) {
            self.with_values.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MapListener for Tally {
    fn entry_inserted(&self, event: &CacheEvent) {
        self.inserted.fetch_add(1, Ordering::SeqCst);
        self.saw(event);
    }

    fn entry_updated(&self, event: &CacheEvent) {
        self.updated.fetch_add(1, Ordering::SeqCst);
        self.saw(event);
    }

    fn entry_deleted(&self, event: &CacheEvent) {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        self.saw(event);
    }
}

fn remote_lease(cache_index: u32, key: &str, resource_version: u8) -> Lease {
    let mut lease = Lease::new(cache_index, key);
    lease.issuer_id = MemberId(1);
    lease.lease_version = 1;
    lease.resource_version = resource_version;
    lease
}

fn binary(value: serde_json::Value) -> LeaseUpdate {
    LeaseUpdate::Resource {
        value: Resource::Binary(Bytes::from(serde_json::to_vec(&value).unwrap())),
        expiry: None,
    }
}

#[tokio::test]
async fn test_stale_replication_is_rejected_without_event() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(2, "orders");
    handler.set_use_event_daemon(false);
    let tally = Arc::new(Tally::default());
    handler.add_map_listener(tally.clone(), false).unwrap();

    let index = handler.cache_index();
    let newer = remote_lease(index, "k", 6);
    let older = remote_lease(index, "k", 5);

    assert_eq!(handler.on_lease_update(&newer, binary(json!("six"))), UpdateOutcome::Applied);
    assert_eq!(handler.on_lease_update(&older, binary(json!("five"))), UpdateOutcome::Rejected);

    assert_eq!(handler.get("k").unwrap(), Some(json!("six")));
    assert_eq!(handler.lease("k").unwrap().resource_version, 6);
    assert_eq!(tally.inserted.load(Ordering::SeqCst), 1);
    assert_eq!(tally.total(), 1);

    // same version again is not newer either
    assert_eq!(handler.on_lease_remove(&newer), UpdateOutcome::Rejected);
    assert!(handler.contains_key("k").unwrap());
}

#[tokio::test]
async fn test_read_your_own_write() {
    let cluster = LoopbackCluster::new(3);
    let handler = cluster.handler(3, "orders");
    for i in 0..10 {
        handler.put("k", json!(i)).await.unwrap();
        assert_eq!(handler.get("k").unwrap(), Some(json!(i)));
    }
    assert_eq!(cluster.handler(1, "orders").get("k").unwrap(), Some(json!(9)));
}

#[tokio::test]
async fn test_each_accepted_mutation_yields_one_event() {
    let cluster = LoopbackCluster::new(2);
    let writer = cluster.handler(1, "orders");
    let watcher = cluster.handler(2, "orders");
    let tally = Arc::new(Tally::default());
    watcher.add_map_listener(tally.clone(), false).unwrap();

    writer.put("a", json!(1)).await.unwrap();
    writer.put("a", json!(2)).await.unwrap();
    writer.remove("a").await.unwrap();
    writer.remove("a").await.unwrap();
    cluster.drain_events().await;

    assert_eq!(tally.inserted.load(Ordering::SeqCst), 1);
    assert_eq!(tally.updated.load(Ordering::SeqCst), 1);
    assert_eq!(tally.deleted.load(Ordering::SeqCst), 1);
    assert_eq!(tally.with_values.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_lite_listener_gets_no_values() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "orders");
    handler.set_use_event_daemon(false);
    let tally = Arc::new(Tally::default());
    handler.add_key_listener(tally.clone(), "a", true).unwrap();

    handler.put("a", json!(1)).await.unwrap();
    handler.put("b", json!(1)).await.unwrap();

    assert_eq!(tally.inserted.load(Ordering::SeqCst), 1);
    assert_eq!(tally.with_values.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_graveyard_is_bounded_lru() {
    let deps = ServiceDependencies {
        graveyard_size: 2,
        ..ServiceDependencies::default()
    };
    let cluster = LoopbackCluster::with_dependencies(1, deps);
    let handler = cluster.handler(1, "orders");

    for key in ["a", "b", "c"] {
        handler.put(key, json!(key)).await.unwrap();
    }
    for key in ["a", "b", "c"] {
        handler.remove(key).await.unwrap();
    }

    let leases = handler.store().leases();
    assert_eq!(leases.live_len(), 0);
    assert_eq!(leases.graveyard_len(), 2);
    assert!(!leases.is_buried("a"));
    assert!(leases.is_buried("b") && leases.is_buried("c"));

    // a buried lease keeps counting versions when revived
    let buried = handler.lease("c").unwrap();
    handler.put("c", json!("again")).await.unwrap();
    assert!(handler.lease("c").unwrap().is_newer_than(&buried));
    assert_eq!(leases.graveyard_len(), 1);
}

#[tokio::test]
async fn test_without_graveyard_leases_are_dropped() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "orders");
    handler.put("a", json!(1)).await.unwrap();
    handler.remove("a").await.unwrap();
    assert!(handler.lease("a").is_none());
    assert_eq!(handler.store().leases().graveyard_len(), 0);
}

#[tokio::test]
async fn test_external_eviction_prunes_lease() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "orders");
    handler.put("a", json!(1)).await.unwrap();
    assert!(handler.lease("a").is_some());

    handler.store().resources().remove("a", None);
    assert!(handler.lease("a").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_after_bounded_attempts() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(2, "orders");
    cluster.inject_conflicts(u32::MAX);

    let start = tokio::time::Instant::now();
    let err = handler.put("k", json!(1)).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_retryable());
    assert_eq!(cluster.service_calls(), 32);
    let expected: u64 = (1..=32).map(|i| i * 16).sum();
    assert!(elapsed >= Duration::from_millis(expected));
    assert!(elapsed < Duration::from_millis(expected + 50));
    assert_eq!(handler.get("k").unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_lock_excludes_other_members() {
    let cluster = LoopbackCluster::new(2);
    let owner = cluster.handler(1, "orders");
    let other = cluster.handler(2, "orders");
    owner.put("k", json!(1)).await.unwrap();

    assert!(owner.lock("k").await.unwrap());
    assert!(!other.lock("k").await.unwrap());
    assert!(matches!(
        other.put("k", json!(2)).await,
        Err(Error::ConcurrentModification { .. })
    ));

    // the lock holder may still write
    owner.put("k", json!(3)).await.unwrap();
    assert!(!other.unlock("k").await.unwrap());

    let waiter = {
        let other = other.clone();
        tokio::spawn(async move { other.lock_with_wait("k", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(owner.unlock("k").await.unwrap());
    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(other.get("k").unwrap(), Some(json!(3)));
}

#[tokio::test]
async fn test_put_final_releases_lock() {
    let cluster = LoopbackCluster::new(2);
    let owner = cluster.handler(1, "orders");
    let other = cluster.handler(2, "orders");

    assert!(owner.lock("k").await.unwrap());
    owner.put_final("k", json!("done")).await.unwrap();
    assert!(other.lock("k").await.unwrap());
    assert_eq!(other.get_locked_resource("k").await.unwrap(), Some(json!("done")));
}

#[tokio::test]
async fn test_departed_issuer_is_replaced_by_oldest_survivor() {
    let cluster = LoopbackCluster::new(3);
    cluster.handler(2, "orders").put("k", json!(1)).await.unwrap();
    assert_eq!(cluster.handler(3, "orders").lease("k").unwrap().issuer_id, MemberId(1));

    cluster.depart(1);
    for member in [2, 3] {
        assert_eq!(cluster.handler(member, "orders").lease("k").unwrap().issuer_id, MemberId(2));
    }
    cluster.handler(3, "orders").put("k", json!(2)).await.unwrap();
    assert_eq!(cluster.handler(2, "orders").get("k").unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_departed_holder_releases_lock() {
    let cluster = LoopbackCluster::new(3);
    cluster.handler(1, "orders").put("k", json!(1)).await.unwrap();
    assert!(cluster.handler(3, "orders").lock("k").await.unwrap());
    assert!(!cluster.handler(2, "orders").lock("k").await.unwrap());

    cluster.depart(3);
    assert!(cluster.handler(2, "orders").lock("k").await.unwrap());
}

#[tokio::test]
async fn test_unnamed_cache_receives_replication_before_naming() {
    let cluster = LoopbackCluster::new(2);
    let writer = cluster.handler(1, "late");
    writer.put("k", json!({"v": 1})).await.unwrap();

    let prime = cluster.registry(2).prime_handler(writer.cache_index());
    assert_eq!(prime.cache_name(), None);
    assert!(prime.contains_key("k").unwrap());

    let named = cluster.handler(2, "late");
    assert_eq!(named.cache_name().as_deref(), Some("late"));
    assert_eq!(named.get("k").unwrap(), Some(json!({"v": 1})));
}

#[test]
fn test_events_reach_listeners_when_cluster_is_built_before_the_runtime() {
    let cluster = LoopbackCluster::new(2);
    let writer = cluster.handler(1, "orders");
    let watcher = cluster.handler(2, "orders");
    let tally = Arc::new(Tally::default());
    watcher.add_map_listener(tally.clone(), false).unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        writer.put("a", json!(1)).await.unwrap();
        writer.put("a", json!(2)).await.unwrap();
        tokio::time::timeout(Duration::from_millis(500), cluster.drain_events())
            .await
            .expect("draining events must not hang");
    });

    assert_eq!(tally.inserted.load(Ordering::SeqCst), 1);
    assert_eq!(tally.updated.load(Ordering::SeqCst), 1);
}

#[test]
fn test_events_fire_on_the_caller_outside_a_runtime() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(2, "orders");
    let tally = Arc::new(Tally::default());
    handler.add_map_listener(tally.clone(), false).unwrap();

    let lease = remote_lease(handler.cache_index(), "k", 1);
    assert_eq!(handler.on_lease_update(&lease, binary(json!("one"))), UpdateOutcome::Applied);
    assert_eq!(tally.inserted.load(Ordering::SeqCst), 1);
    assert_eq!(tally.with_values.load(Ordering::SeqCst), 1);
}
