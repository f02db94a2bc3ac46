use crate::{Error, Result};
use std::fmt::Debug;
use tracing::warn;

/// Decides what a write does when no coordinator is known.
pub trait MissingCoordinatorPolicy: Send + Sync + Debug {
    /// `Ok` lets the write proceed locally; an error aborts it.
    fn on_missing_coordinator(&self, map: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl MissingCoordinatorPolicy for FailFast {
    fn on_missing_coordinator(&self, map: &str) -> Result<()> {
        Err(Error::MissingCoordinator { map: map.to_owned() })
    }
}

/// Apply writes to the local copy only; they will be overwritten by the
/// next coordinator's sync.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyLocally;

impl MissingCoordinatorPolicy for ApplyLocally {
    fn on_missing_coordinator(&self, map: &str) -> Result<()> {
        warn!(map, "no configuration coordinator; applying locally");
        Ok(())
    }
}
