// Cache snapshots for members joining a service
//
// A snapshot frame carries the leases this member issues together with the
// serialized resources, bincode encoded and protected by a blake3 checksum.
// Large caches are shipped in several frames; the cursor names the keys that
// did not fit the byte budget.

use super::handler::CacheHandler;
use super::resource::Resource;
use super::store::{LeaseUpdate, UpdateOutcome};
use crate::lease::{Lease, LeaseStatus};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    lease: Lease,
    resource: Option<Vec<u8>>,
}

/// One encoded snapshot frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub cache_index: u32,
    pub lease_count: usize,
    pub payload: Vec<u8>,
    pub checksum: [u8; 32],
}

impl CacheSnapshot {
    pub fn verify(&self) -> bool {
        blake3::hash(&self.payload).as_bytes() == &self.checksum
    }
}

/// Keys still to be shipped after a budget-limited frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotCursor {
    remaining: VecDeque<String>,
}

impl SnapshotCursor {
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl CacheHandler {
    /// Encode the leases issued by this member, stopping once the encoded
    /// size exceeds `budget` bytes. Unissued leases are first handed to the
    /// oldest member.
    pub fn populate_update_message(
        &self,
        budget: usize,
        cursor: Option<SnapshotCursor>,
    ) -> Result<(CacheSnapshot, Option<SnapshotCursor>)> {
        let store = self.store();
        let members = store.members();
        let now = store.context().now();
        let this = members.this_member();
        let oldest = members.oldest().unwrap_or(this);
        let resources = store.resources();

        let mut keys = match cursor {
            Some(cursor) => cursor.remaining,
            None => store.leases().keys().into(),
        };
        let mut entries = Vec::new();
        let mut size = 0u64;
        while let Some(key) = keys.pop_front() {
            let Some(cell) = store.leases().get(&key) else {
                continue;
            };
            let lease = {
                let mut lease = cell.lock();
                lease.validate(&members, now);
                if lease.status(&members, now) == LeaseStatus::Unissued {
                    lease.issuer_id = oldest;
                }
                lease.clone()
            };
            if lease.issuer_id != this {
                continue;
            }

            let resource = match resources.get(&key) {
                Some(resource) => match store.with_serializer(lease.loader, |s| resource.to_binary(s)) {
                    Ok(bin) => Some(bin.to_vec()),
                    Err(err) => {
                        warn!(cache = %store.display_name(), key = %key, error = %err, "skipping unserializable resource");
                        continue;
                    }
                },
                None => None,
            };
            let entry = SnapshotEntry { lease, resource };
            size += bincode::serialized_size(&entry)?;
            entries.push(entry);
            if size > budget as u64 {
                break;
            }
        }

        let payload = bincode::serialize(&entries)?;
        let checksum = *blake3::hash(&payload).as_bytes();
        let snapshot = CacheSnapshot {
            cache_index: store.cache_index(),
            lease_count: entries.len(),
            payload,
            checksum,
        };
        let cursor = (!keys.is_empty()).then_some(SnapshotCursor { remaining: keys });
        Ok((snapshot, cursor))
    }

    /// Apply a snapshot frame. Entries older than the local state are
    /// skipped; returns how many were applied.
    pub fn populate_cache(&self, snapshot: &CacheSnapshot) -> Result<usize> {
        if !snapshot.verify() {
            return Err(Error::SnapshotChecksum {
                cache_index: snapshot.cache_index,
            });
        }
        let entries: Vec<SnapshotEntry> = bincode::deserialize(&snapshot.payload)?;
        let mut applied = 0;
        for SnapshotEntry { mut lease, resource } in entries {
            let update = match resource {
                Some(bin) => {
                    lease.resource_size = i32::try_from(bin.len()).unwrap_or(i32::MAX);
                    LeaseUpdate::Resource {
                        value: Resource::Binary(Bytes::from(bin)),
                        expiry: None,
                    }
                }
                None => LeaseUpdate::LeaseOnly,
            };
            if self.on_lease_update(&lease, update) == UpdateOutcome::Applied {
                applied += 1;
            }
        }
        debug!(cache_index = snapshot.cache_index, applied, total = snapshot.lease_count, "applied cache snapshot");
        Ok(applied)
    }
}
