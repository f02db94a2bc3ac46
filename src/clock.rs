// Cluster time source for lease effective and expiration times.
//
// Lease arithmetic is done in signed milliseconds since the Unix epoch so
// that "expires at" and "effective at" values can be compared and shipped
// between members without conversion.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of cluster time in milliseconds since the Unix epoch.
pub trait ClusterClock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time that never goes backwards.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn physical_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

impl ClusterClock for SystemClock {
    fn now_millis(&self) -> i64 {
        let physical = Self::physical_now();
        let previous = self.last.fetch_max(physical, Ordering::SeqCst);
        previous.max(physical)
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) -> i64 {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl ClusterClock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
