use replcache::cache::CacheHandler;
use replcache::test_utils::LoopbackCluster;
use replcache::txn::{ConflictSets, LeaseValidator, TransactionValidator, TransactionView};
use replcache::{Error, OptimisticTransaction};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

fn conflicts(result: replcache::Result<()>) -> ConflictSets {
    match result {
        Err(Error::ValidationFailed { conflicts }) => conflicts,
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_commit_applies_buffered_writes() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(1, "accounts");
    handler.put("alice", json!(10)).await.unwrap();
    handler.put("bob", json!(5)).await.unwrap();

    let mut txn = OptimisticTransaction::new(handler.clone());
    let alice = txn.get("alice").unwrap().unwrap();
    txn.put("alice", json!(alice.as_i64().unwrap() - 3)).unwrap();
    txn.put("carol", json!(3)).unwrap();
    txn.remove("bob").unwrap();
    assert_eq!(txn.get("alice").unwrap(), Some(json!(7)));
    // nothing is visible before commit
    assert_eq!(handler.get("alice").unwrap(), Some(json!(10)));

    assert_ok!(txn.commit().await);
    let remote = cluster.handler(2, "accounts");
    assert_eq!(remote.get("alice").unwrap(), Some(json!(7)));
    assert_eq!(remote.get("carol").unwrap(), Some(json!(3)));
    assert_eq!(remote.get("bob").unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_change_to_read_key_fails() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(1, "accounts");
    handler.put("rate", json!(1)).await.unwrap();

    let mut txn = OptimisticTransaction::from(handler.clone());
    txn.get("rate").unwrap();
    txn.put("total", json!(100)).unwrap();
    cluster.handler(2, "accounts").put("rate", json!(2)).await.unwrap();

    let sets = conflicts(txn.commit().await);
    assert!(sets.reads.contains("rate"));
    assert!(sets.inserts.is_empty());
    assert_eq!(handler.get("total").unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_update_fails_and_leaves_cache_alone() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(1, "accounts");
    handler.put("k", json!(1)).await.unwrap();

    let mut txn = OptimisticTransaction::new(handler.clone());
    txn.put("k", json!(5)).unwrap();
    cluster.handler(2, "accounts").put("k", json!(2)).await.unwrap();

    let sets = conflicts(txn.commit().await);
    assert_eq!(sets.updates.iter().collect::<Vec<_>>(), vec!["k"]);
    assert_eq!(handler.get("k").unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_concurrent_insert_of_same_key_fails() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(1, "accounts");

    let mut txn = OptimisticTransaction::new(handler.clone());
    txn.put("fresh", json!("mine")).unwrap();
    txn.put("also-fresh", json!("mine")).unwrap();
    cluster.handler(2, "accounts").put("fresh", json!("theirs")).await.unwrap();

    let sets = conflicts(txn.commit().await);
    assert_eq!(sets.inserts.iter().collect::<Vec<_>>(), vec!["fresh"]);
    assert_eq!(handler.get("fresh").unwrap(), Some(json!("theirs")));
}

#[tokio::test]
async fn test_unrelated_writes_do_not_conflict() {
    let cluster = LoopbackCluster::new(2);
    let handler = cluster.handler(1, "accounts");
    handler.put("a", json!(1)).await.unwrap();

    let mut txn = OptimisticTransaction::new(handler.clone());
    txn.get("a").unwrap();
    txn.put("a", json!(2)).unwrap();
    cluster.handler(2, "accounts").put("b", json!(1)).await.unwrap();

    assert_ok!(txn.commit().await);
    assert_eq!(handler.get("a").unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_insert_then_remove_leaves_nothing_to_validate() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "accounts");

    let mut txn = OptimisticTransaction::new(handler.clone());
    txn.put("tmp", json!(1)).unwrap();
    txn.remove("tmp").unwrap();
    assert!(txn.conflict_sets().is_empty());
    txn.commit().await.unwrap();
    assert_eq!(handler.get("tmp").unwrap(), None);
}

#[tokio::test]
async fn test_phantom_reads_always_fail() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "accounts");

    let mut txn = OptimisticTransaction::new(handler);
    txn.record_phantom("prefix:*");
    let err = txn.commit().await.unwrap_err();
    assert!(err.to_string().contains("phantoms=[prefix:*]"));
}

struct Snapshot {
    handler: CacheHandler,
}

impl TransactionView for Snapshot {
    fn base(&self) -> &CacheHandler {
        &self.handler
    }

    fn original(&self, _key: &str) -> Option<Value> {
        None
    }
}

#[tokio::test]
async fn test_validator_accepts_unchanged_keys_repeatedly() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "accounts");
    handler.put("k", json!(1)).await.unwrap();

    let view = Snapshot {
        handler: handler.clone(),
    };
    let mut validator = LeaseValidator::new(handler.clone());
    validator.enlist(&view, "k");
    assert!(validator.is_enlisted("k"));

    for _ in 0..2 {
        let mut sets = ConflictSets::default();
        sets.updates.insert("k".into());
        validator.validate(&view, &mut sets).unwrap();
        assert!(sets.is_empty());
    }

    handler.put("k", json!(2)).await.unwrap();
    let mut sets = ConflictSets::default();
    sets.updates.insert("k".into());
    assert_err!(validator.validate(&view, &mut sets));
}

#[tokio::test]
async fn test_validator_rejects_keys_without_a_lease() {
    let cluster = LoopbackCluster::new(1);
    let handler = cluster.handler(1, "accounts");
    let view = Snapshot {
        handler: handler.clone(),
    };
    let mut validator = LeaseValidator::new(handler.clone());
    validator.enlist(&view, "missing");
    assert!(validator.is_enlisted("missing"));

    let mut sets = ConflictSets::default();
    sets.deletes.insert("missing".into());
    sets.updates.insert("missing".into());
    let sets = conflicts(validator.validate(&view, &mut sets));
    assert_eq!(sets.deletes.iter().collect::<Vec<_>>(), vec!["missing"]);
    assert_eq!(sets.updates.iter().collect::<Vec<_>>(), vec!["missing"]);

    // never enlisted either
    let mut sets = ConflictSets::default();
    sets.updates.insert("unseen".into());
    assert_err!(validator.validate(&view, &mut sets));
}
