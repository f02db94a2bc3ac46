use super::validator::{ConflictSets, TransactionValidator, TransactionView};
use crate::cache::CacheHandler;
use crate::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

struct TxState {
    handler: CacheHandler,
    originals: HashMap<String, Option<Value>>,
}

impl TransactionView for TxState {
    fn base(&self) -> &CacheHandler {
        &self.handler
    }

    fn original(&self, key: &str) -> Option<Value> {
        self.originals.get(key).cloned().flatten()
    }
}

/// Transactional map over one cache. Writes are buffered and applied at
/// commit, after the validator confirmed nothing changed underneath.
pub struct OptimisticTransaction {
    state: TxState,
    validator: Box<dyn TransactionValidator + Send>,
    writes: BTreeMap<String, Option<Value>>,
    sets: ConflictSets,
}

impl OptimisticTransaction {
    pub fn new(handler: CacheHandler) -> Self {
        let validator = Box::new(handler.validator());
        Self::with_validator(handler, validator)
    }

    pub fn with_validator(handler: CacheHandler, validator: Box<dyn TransactionValidator + Send>) -> Self {
        Self {
            state: TxState {
                handler,
                originals: HashMap::new(),
            },
            validator,
            writes: BTreeMap::new(),
            sets: ConflictSets::default(),
        }
    }

    fn enlist(&mut self, key: &str) -> Result<Option<Value>> {
        if let Some(original) = self.state.originals.get(key) {
            return Ok(original.clone());
        }
        self.validator.enlist(&self.state, key);
        let value = self.state.handler.get(key)?;
        self.state.originals.insert(key.to_owned(), value.clone());
        Ok(value)
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let value = self.enlist(key)?;
        self.sets.reads.insert(key.to_owned());
        Ok(value)
    }

    pub fn put(&mut self, key: &str, value: Value) -> Result<()> {
        let original = self.enlist(key)?;
        if original.is_some() {
            self.sets.deletes.remove(key);
            self.sets.updates.insert(key.to_owned());
        } else {
            self.sets.inserts.insert(key.to_owned());
        }
        self.writes.insert(key.to_owned(), Some(value));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        let original = self.enlist(key)?;
        if original.is_some() {
            self.sets.updates.remove(key);
            self.sets.deletes.insert(key.to_owned());
            self.writes.insert(key.to_owned(), None);
        } else {
            // never existed outside this transaction
            self.sets.inserts.remove(key);
            self.writes.remove(key);
        }
        Ok(())
    }

    /// Mark a key as read through a predicate. This validator cannot
    /// protect such reads, so any phantom fails the commit.
    pub fn record_phantom(&mut self, key: &str) {
        self.sets.phantoms.insert(key.to_owned());
    }

    pub fn conflict_sets(&self) -> &ConflictSets {
        &self.sets
    }

    /// Validate, then apply the buffered writes in key order.
    pub async fn commit(mut self) -> Result<()> {
        self.validator.validate(&self.state, &mut self.sets)?;
        let handler = &self.state.handler;
        for (key, write) in &self.writes {
            match write {
                Some(value) => {
                    handler.put(key, value.clone()).await?;
                }
                None => {
                    handler.remove(key).await?;
                }
            }
        }
        debug!(cache = ?handler.cache_name(), writes = self.writes.len(), "committed transaction");
        Ok(())
    }
}

impl From<CacheHandler> for OptimisticTransaction {
    fn from(handler: CacheHandler) -> Self {
        Self::new(handler)
    }
}
