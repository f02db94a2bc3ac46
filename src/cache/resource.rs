// Cached resource values and the loaders that materialize them

use crate::error::BoxError;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A cached value, either still in its serialized form or materialized by
/// one of the cache's loaders.
#[derive(Debug, Clone)]
pub enum Resource {
    Binary(Bytes),
    Object(Arc<Value>),
}

impl Resource {
    pub fn object(value: Value) -> Self {
        Resource::Object(Arc::new(value))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Resource::Binary(_))
    }

    /// True when both are the very same serialized buffer, not merely equal
    /// bytes.
    pub fn is_same_binary(&self, bin: &Bytes) -> bool {
        match self {
            Resource::Binary(own) => own.as_ptr() == bin.as_ptr() && own.len() == bin.len(),
            Resource::Object(_) => false,
        }
    }

    pub fn to_binary(&self, serializer: &dyn Serializer) -> Result<Bytes, BoxError> {
        match self {
            Resource::Binary(bin) => Ok(bin.clone()),
            Resource::Object(value) => serializer.serialize(value),
        }
    }

    pub fn to_value(&self, serializer: &dyn Serializer) -> Result<Value, BoxError> {
        match self {
            Resource::Binary(bin) => serializer.deserialize(bin),
            Resource::Object(value) => Ok(value.as_ref().clone()),
        }
    }
}

/// Serialized/deserialized conversion for cached values.
pub trait Serializer: Send + Sync + fmt::Debug {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, BoxError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, BoxError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Deserialization context of a cache view. Values materialized under one
/// loader are never handed out through another.
#[derive(Debug)]
pub struct Loader {
    id: Uuid,
    name: String,
    serializer: Arc<dyn Serializer>,
}

impl Loader {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_serializer(name, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(name: impl Into<String>, serializer: Arc<dyn Serializer>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            serializer,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }
}

impl fmt::Display for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}
