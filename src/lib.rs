#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod config_map;
pub mod error;
pub mod lease;
pub mod membership;
pub mod txn;

pub mod test_utils;

pub use cache::{CacheHandler, CacheService, HandlerRegistry, Loader};
pub use config::ServiceDependencies;
pub use config_map::ConfigMap;
pub use error::{Error, Result};
pub use lease::{Lease, LeaseStatus};
pub use membership::{MemberId, MemberSnapshot, Membership};
pub use txn::OptimisticTransaction;
