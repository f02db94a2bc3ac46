use crate::txn::ConflictSets;
use thiserror::Error;

/// Boxed error produced by pluggable serializers and backing stores.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Concurrent modification of cache {cache:?}: {reason}")]
    ConcurrentModification { cache: String, reason: String },

    #[error("validation failed: {conflicts}")]
    ValidationFailed { conflicts: ConflictSets },

    #[error("No configuration coordinator for {map:?}")]
    MissingCoordinator { map: String },

    #[error("Unsupported listener registration: {0}")]
    UnsupportedListener(String),

    #[error("Cache handler is not active: {0}")]
    InvalidHandler(String),

    #[error("Serialization failed (CacheName={cache}, Key={key}): {source}")]
    Serialization {
        cache: String,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Backing map error: {0}")]
    BackingMap(String),

    #[error("Snapshot checksum mismatch for cache index {cache_index}")]
    SnapshotChecksum { cache_index: u32 },

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn concurrent_modification(cache: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            cache: cache.into(),
            reason: reason.into(),
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrent_modification_is_retryable() {
        assert!(Error::concurrent_modification("c", "locked").is_retryable());
        assert!(!Error::MissingCoordinator { map: "m".into() }.is_retryable());
        assert!(!Error::ValidationFailed {
            conflicts: ConflictSets::default()
        }
        .is_retryable());
    }

    #[test]
    fn test_serialization_error_carries_context() {
        let source: BoxError = "bad bytes".into();
        let err = Error::Serialization {
            cache: "orders".into(),
            key: "k1".into(),
            source,
        };
        let text = err.to_string();
        assert!(text.contains("CacheName=orders"));
        assert!(text.contains("Key=k1"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
