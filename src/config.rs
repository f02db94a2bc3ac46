// Service tuning knobs.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Dependencies of a replicated cache service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDependencies {
    /// Capacity of the LRU lease graveyard; zero keeps terminated leases
    /// out of memory entirely.
    pub graveyard_size: usize,
    /// Lease duration used by lock requests.
    pub standard_lease_millis: i64,
    /// Optimistically treat this member as issuer of unissued leases.
    pub mobile_issues: bool,
    /// Deliver map events on the dispatcher task instead of the caller.
    pub use_event_daemon: bool,
    pub max_map_retries: u32,
    pub retry_backoff_millis: u64,
}

impl Default for ServiceDependencies {
    fn default() -> Self {
        Self {
            graveyard_size: 0,
            standard_lease_millis: 20_000,
            mobile_issues: false,
            use_event_daemon: true,
            max_map_retries: 32,
            retry_backoff_millis: 16,
        }
    }
}

impl ServiceDependencies {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Backoff slept after the given (1-based) failed attempt.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_millis * u64::from(attempt))
    }
}
