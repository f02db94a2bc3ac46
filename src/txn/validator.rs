use crate::cache::CacheHandler;
use crate::lease::Lease;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Keys touched by a transaction, split by kind of access. After validation
/// only the genuinely conflicting keys remain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSets {
    pub inserts: BTreeSet<String>,
    pub updates: BTreeSet<String>,
    pub deletes: BTreeSet<String>,
    pub reads: BTreeSet<String>,
    pub phantoms: BTreeSet<String>,
}

impl ConflictSets {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.reads.is_empty()
            && self.phantoms.is_empty()
    }

    fn named(&self) -> [(&'static str, &BTreeSet<String>); 5] {
        [
            ("inserts", &self.inserts),
            ("updates", &self.updates),
            ("deletes", &self.deletes),
            ("reads", &self.reads),
            ("phantoms", &self.phantoms),
        ]
    }
}

impl fmt::Display for ConflictSets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, keys) in self.named() {
            if keys.is_empty() {
                continue;
            }
            let joined: Vec<&str> = keys.iter().map(String::as_str).collect();
            write!(f, "\n{name}=[{}]", joined.join(", "))?;
        }
        Ok(())
    }
}

/// What the validator needs from a transaction: the cache underneath and
/// the values the transaction originally read.
pub trait TransactionView {
    fn base(&self) -> &CacheHandler;

    /// Value of a key as first seen by the transaction.
    fn original(&self, key: &str) -> Option<Value>;
}

pub trait TransactionValidator {
    /// Record the state a key had when the transaction first touched it.
    fn enlist(&mut self, view: &dyn TransactionView, key: &str);

    /// Drop the keys that did not change underneath the transaction. Fails
    /// when anything is left.
    fn validate(&mut self, view: &dyn TransactionView, sets: &mut ConflictSets) -> Result<()>;
}

/// Validates by comparing resource versions of the leases snapshotted at
/// enlistment against the current ones. Provides no phantom protection:
/// any phantom key is a conflict.
#[derive(Debug)]
pub struct LeaseValidator {
    handler: CacheHandler,
    enlisted: HashMap<String, Option<Lease>>,
}

impl LeaseValidator {
    pub fn new(handler: CacheHandler) -> Self {
        Self {
            handler,
            enlisted: HashMap::new(),
        }
    }

    pub fn handler(&self) -> &CacheHandler {
        &self.handler
    }

    pub fn is_enlisted(&self, key: &str) -> bool {
        self.enlisted.contains_key(key)
    }

    /// A key is unchanged only if it had a lease when enlisted and still
    /// has one at the same resource version. A key without a lease on
    /// either side cannot be vouched for and counts as changed.
    fn unchanged(&self, key: &str) -> bool {
        let current = self.handler.lease(key);
        match (self.enlisted.get(key).and_then(Option::as_ref), current) {
            (Some(then), Some(now)) => then.resource_version == now.resource_version,
            _ => false,
        }
    }
}

impl TransactionValidator for LeaseValidator {
    fn enlist(&mut self, _view: &dyn TransactionView, key: &str) {
        if !self.enlisted.contains_key(key) {
            let lease = self.handler.lease(key);
            self.enlisted.insert(key.to_owned(), lease);
        }
    }

    fn validate(&mut self, view: &dyn TransactionView, sets: &mut ConflictSets) -> Result<()> {
        let base = view.base();

        // concurrently deleted before our insert landed
        let mut absent = Vec::new();
        for key in &sets.inserts {
            if !base.contains_key(key)? {
                absent.push(key.clone());
            }
        }
        for key in absent {
            sets.inserts.remove(&key);
        }

        sets.updates.retain(|key| !self.unchanged(key));
        sets.deletes.retain(|key| !self.unchanged(key));

        let mut equal = Vec::new();
        for key in &sets.reads {
            if base.get(key)? == view.original(key) {
                equal.push(key.clone());
            }
        }
        for key in equal {
            sets.reads.remove(&key);
        }

        if sets.is_empty() {
            Ok(())
        } else {
            Err(Error::ValidationFailed {
                conflicts: sets.clone(),
            })
        }
    }
}
