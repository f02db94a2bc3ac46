use super::map::ConfigMap;
use serde_json::Value;

/// Observes local changes to a config map. Called synchronously while the
/// map's write lock is held; listeners may write to the map again.
pub trait ConfigListener: Send + Sync {
    fn entry_inserted(&self, _map: &ConfigMap, _key: &str, _value: &Value) {}
    fn entry_updated(&self, _map: &ConfigMap, _key: &str, _old: &Value, _new: &Value) {}
    fn entry_deleted(&self, _map: &ConfigMap, _key: &str, _old: &Value) {}
}
