// Core lease data structure and its conflict ordering

use crate::membership::{MemberId, MemberSnapshot};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Version value meaning "no such lease or resource".
pub const NO_VERSION: u8 = 0;

/// Resource size value meaning "not known".
pub const UNKNOWN_SIZE: i32 = -1;

/// The holder considers its own lease expired this much earlier than
/// everyone else, compensating for clock variance between members.
pub const HOLDER_EXPIRY_MARGIN_MILLIS: i64 = 10;

/// Versions closer than this are compared directly; further apart they are
/// assumed to have wrapped.
const VERSION_WINDOW: u8 = 128;

/// Status of a lease as seen by the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseStatus {
    /// No live issuer is known.
    Unissued,
    /// Issued and not held by anyone.
    Available,
    /// Held by this member.
    Locked,
    /// Held by another member.
    Dirty,
}

impl LeaseStatus {
    pub fn name(self) -> &'static str {
        match self {
            LeaseStatus::Unissued => "LEASE_UNISSUED",
            LeaseStatus::Available => "LEASE_AVAILABLE",
            LeaseStatus::Locked => "LEASE_LOCKED",
            LeaseStatus::Dirty => "LEASE_DIRTY",
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Next value of a circular 8-bit version: 1..=255, wrapping to 2.
pub fn next_version(version: u8) -> u8 {
    if version == u8::MAX {
        2
    } else {
        version + 1
    }
}

/// Ownership and version token for one resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub cache_index: u32,
    pub resource_key: String,
    pub issuer_id: MemberId,
    pub holder_id: MemberId,
    pub effective_time: i64,
    pub expiration_time: i64,
    pub lease_version: u8,
    pub resource_version: u8,
    pub resource_size: i32,
    /// Loader whose deserialized form of the resource is cached locally.
    /// Never shipped to other members.
    #[serde(skip)]
    pub loader: Option<Uuid>,
}

impl Lease {
    pub fn new(cache_index: u32, resource_key: impl Into<String>) -> Self {
        Self {
            cache_index,
            resource_key: resource_key.into(),
            issuer_id: MemberId::NONE,
            holder_id: MemberId::NONE,
            effective_time: 0,
            expiration_time: 0,
            lease_version: NO_VERSION,
            resource_version: NO_VERSION,
            resource_size: UNKNOWN_SIZE,
            loader: None,
        }
    }

    /// Compare how up to date two leases for the same key are.
    ///
    /// Lease versions decide first, then resource versions, then the
    /// effective time. Versions are circular: a difference of 128 or more
    /// means the numerically smaller one has wrapped and is newer. A zero
    /// version always loses.
    pub fn freshness_cmp(&self, other: &Lease) -> Ordering {
        let (mut this, mut that) = (self.lease_version, other.lease_version);
        if this == that {
            this = self.resource_version;
            that = other.resource_version;
            if this == that {
                return self.effective_time.cmp(&other.effective_time);
            }
        }

        if this > that {
            if that == NO_VERSION || this - that < VERSION_WINDOW {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        } else if this == NO_VERSION || that - this < VERSION_WINDOW {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    pub fn is_newer_than(&self, other: &Lease) -> bool {
        self.freshness_cmp(other) == Ordering::Greater
    }

    pub fn status(&self, members: &MemberSnapshot, now: i64) -> LeaseStatus {
        let this = members.this_member();
        let holder = self.holder_id;

        let mut available = holder.is_none() || !members.contains(holder);
        if !available {
            let mut expiration = self.expiration_time;
            if holder == this {
                expiration -= HOLDER_EXPIRY_MARGIN_MILLIS;
            }
            available = expiration <= now;
        }

        if available {
            if self.issuer_id.is_none() || !members.contains(self.issuer_id) {
                LeaseStatus::Unissued
            } else {
                LeaseStatus::Available
            }
        } else if holder == this {
            LeaseStatus::Locked
        } else {
            LeaseStatus::Dirty
        }
    }

    /// Drop references to departed members and expired holds.
    pub fn validate(&mut self, members: &MemberSnapshot, now: i64) {
        let holder = self.holder_id;
        if !holder.is_none() && (!members.contains(holder) || self.expiration_time <= now) {
            self.unlock(now);
        }
        if !self.issuer_id.is_none() && !members.contains(self.issuer_id) {
            self.issuer_id = MemberId::NONE;
        }
    }

    pub fn lock(&mut self, holder: MemberId, now: i64, lease_millis: i64) {
        self.holder_id = holder;
        self.effective_time = now;
        self.expiration_time = now.saturating_add(lease_millis);
    }

    pub fn unlock(&mut self, now: i64) {
        self.holder_id = MemberId::NONE;
        self.expiration_time = now;
    }

    /// Take over ownership data and any known versions from another lease.
    pub fn copy_from(&mut self, other: &Lease) {
        debug_assert_eq!(self.resource_key, other.resource_key);
        debug_assert_eq!(self.cache_index, other.cache_index);

        self.issuer_id = other.issuer_id;
        self.holder_id = other.holder_id;
        self.effective_time = other.effective_time;
        self.expiration_time = other.expiration_time;
        if other.resource_size >= 0 {
            self.resource_size = other.resource_size;
        }
        self.copy_version(other);
    }

    pub fn copy_version(&mut self, other: &Lease) {
        if other.lease_version != NO_VERSION {
            self.lease_version = other.lease_version;
        }
        if other.resource_version != NO_VERSION {
            self.resource_version = other.resource_version;
        }
    }

    pub fn increment_lease_version(&mut self) {
        self.lease_version = next_version(self.lease_version);
    }

    pub fn increment_resource_version(&mut self) {
        self.resource_version = next_version(self.resource_version);
    }

    /// Human readable rendering relative to a membership view and time.
    pub fn describe<'a>(&'a self, members: &'a MemberSnapshot, now: i64) -> LeaseDisplay<'a> {
        LeaseDisplay {
            lease: self,
            members,
            now,
        }
    }
}

pub struct LeaseDisplay<'a> {
    lease: &'a Lease,
    members: &'a MemberSnapshot,
    now: i64,
}

fn format_time(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map_or_else(|| millis.to_string(), |t| t.to_rfc3339())
}

impl fmt::Display for LeaseDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lease = self.lease;
        let status = lease.status(self.members, self.now);

        write!(f, "Lease: {} (Cache={}, Size=", lease.resource_key, lease.cache_index)?;
        if lease.resource_size == UNKNOWN_SIZE {
            f.write_str("Unknown")?;
        } else {
            write!(f, "{}", lease.resource_size)?;
        }
        write!(
            f,
            ", Version={}/{}, IssuerId={}, HolderId={}, Status={}",
            lease.lease_version, lease.resource_version, lease.issuer_id, lease.holder_id, status
        )?;

        match status {
            LeaseStatus::Locked | LeaseStatus::Dirty => write!(
                f,
                ", Locked at {}, Expires in {} millis",
                format_time(lease.effective_time),
                lease.expiration_time - self.now
            )?,
            _ if lease.holder_id.is_none() => {
                write!(f, ", Last locked at {}", format_time(lease.effective_time))?;
            }
            _ => write!(
                f,
                ", Last held by member {} from {} to {}",
                lease.holder_id,
                format_time(lease.effective_time),
                format_time(lease.expiration_time)
            )?,
        }
        f.write_str(")")
    }
}
