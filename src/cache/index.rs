// Secondary indexes over materialized cache values

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Derives the indexed attribute from a value.
pub trait ValueExtractor: Send + Sync + fmt::Debug {
    /// Identity of the extractor; one index per id.
    fn id(&self) -> String;
    fn extract(&self, value: &Value) -> Option<Value>;
}

/// Extracts the value at a JSON pointer such as `/customer/id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerExtractor(pub String);

impl ValueExtractor for PointerExtractor {
    fn id(&self) -> String {
        format!("pointer:{}", self.0)
    }

    fn extract(&self, value: &Value) -> Option<Value> {
        value.pointer(&self.0).cloned()
    }
}

#[derive(Debug)]
struct SecondaryIndex {
    extractor: Arc<dyn ValueExtractor>,
    forward: HashMap<String, String>,
    inverse: HashMap<String, HashSet<String>>,
}

impl SecondaryIndex {
    fn new(extractor: Arc<dyn ValueExtractor>) -> Self {
        Self {
            extractor,
            forward: HashMap::new(),
            inverse: HashMap::new(),
        }
    }

    fn update(&mut self, key: &str, value: Option<&Value>) {
        if let Some(old) = self.forward.remove(key) {
            if let Some(keys) = self.inverse.get_mut(&old) {
                keys.remove(key);
                if keys.is_empty() {
                    self.inverse.remove(&old);
                }
            }
        }
        if let Some(attr) = value.and_then(|v| self.extractor.extract(v)) {
            let attr = attr.to_string();
            self.inverse.entry(attr.clone()).or_default().insert(key.to_owned());
            self.forward.insert(key.to_owned(), attr);
        }
    }
}

/// The indexes of one cache.
#[derive(Debug, Default)]
pub struct IndexMap {
    indexes: RwLock<HashMap<String, SecondaryIndex>>,
}

impl IndexMap {
    /// Create an index and populate it from the given entries. Adding an
    /// extractor that is already indexed is a no-op.
    pub fn add<'a>(
        &self,
        extractor: Arc<dyn ValueExtractor>,
        entries: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> bool {
        let id = extractor.id();
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&id) {
            return false;
        }
        let mut index = SecondaryIndex::new(extractor);
        for (key, value) in entries {
            index.update(key, Some(&value));
        }
        indexes.insert(id, index);
        true
    }

    pub fn remove(&self, extractor: &dyn ValueExtractor) -> bool {
        self.indexes.write().remove(&extractor.id()).is_some()
    }

    pub fn clear(&self) {
        self.indexes.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }

    /// Record the new value of a key (`None` on removal) in every index.
    pub fn update(&self, key: &str, value: Option<&Value>) {
        for index in self.indexes.write().values_mut() {
            index.update(key, value);
        }
    }

    /// Keys whose extracted attribute equals `attr`. `None` when the
    /// extractor is not indexed.
    pub fn lookup(&self, extractor: &dyn ValueExtractor, attr: &Value) -> Option<HashSet<String>> {
        let indexes = self.indexes.read();
        let index = indexes.get(&extractor.id())?;
        Some(index.inverse.get(&attr.to_string()).cloned().unwrap_or_default())
    }
}
