// Per-key leases for replicated caches
//
// A lease is the ownership and version token of one resource key:
// - circular 8-bit lease and resource versions decide which update wins
// - issuer/holder members and an expiration time model short-lived locks
// - terminated leases can be kept in a bounded LRU graveyard

#[allow(clippy::module_inception)]
pub mod lease;
pub mod table;

pub use lease::{next_version, Lease, LeaseStatus, NO_VERSION, UNKNOWN_SIZE};
pub use table::{Graveyard, LeaseCell, LeaseTable};
