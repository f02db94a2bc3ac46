use proptest::prelude::*;
use replcache::lease::{next_version, Lease, NO_VERSION};
use replcache::membership::{MemberId, MemberSnapshot};
use replcache::LeaseStatus;
use std::cmp::Ordering;

fn lease(lease_version: u8, resource_version: u8, effective_time: i64) -> Lease {
    let mut lease = Lease::new(0, "k");
    lease.lease_version = lease_version;
    lease.resource_version = resource_version;
    lease.effective_time = effective_time;
    lease
}

proptest! {
    #[test]
    fn prop_ordering_is_antisymmetric(
        a in (any::<u8>(), any::<u8>(), 0i64..1_000),
        b in (any::<u8>(), any::<u8>(), 0i64..1_000),
    ) {
        let (a, b) = (lease(a.0, a.1, a.2), lease(b.0, b.1, b.2));
        prop_assert_eq!(a.freshness_cmp(&b), b.freshness_cmp(&a).reverse());
    }

    #[test]
    fn prop_next_version_is_always_newer(v in any::<u8>(), r in any::<u8>()) {
        let current = lease(v, r, 0);
        let next = lease(next_version(v), r, 0);
        prop_assert!(next.is_newer_than(&current));
    }

    #[test]
    fn prop_resource_version_decides_equal_lease_versions(l in 1u8.., r in 1u8..) {
        let current = lease(l, r, 500);
        let next = lease(l, next_version(r), 0);
        prop_assert!(next.is_newer_than(&current));
    }

    #[test]
    fn prop_zero_version_always_loses(v in 1u8.., r in any::<u8>(), t in 0i64..1_000) {
        let known = lease(v, r, 0);
        let unknown = lease(NO_VERSION, r, t);
        prop_assert_eq!(unknown.freshness_cmp(&known), Ordering::Less);
    }
}

#[test]
fn test_versions_wrap_past_255_to_2() {
    assert_eq!(next_version(1), 2);
    assert_eq!(next_version(254), 255);
    assert_eq!(next_version(255), 2);
    assert!(lease(2, 1, 0).is_newer_than(&lease(255, 1, 0)));
    assert!(lease(3, 1, 0).is_newer_than(&lease(200, 1, 0)));
    assert!(lease(100, 1, 0).is_newer_than(&lease(3, 1, 0)));
}

#[test]
fn test_effective_time_breaks_ties() {
    assert!(lease(4, 4, 11).is_newer_than(&lease(4, 4, 10)));
    assert_eq!(lease(4, 4, 10).freshness_cmp(&lease(4, 4, 10)), Ordering::Equal);
}

#[test]
fn test_status_follows_holder_and_issuer() {
    let members = MemberSnapshot::new(1, MemberId(1), vec![MemberId(1), MemberId(2)]);
    let mut l = lease(1, 1, 0);
    assert_eq!(l.status(&members, 100), LeaseStatus::Unissued);

    l.issuer_id = MemberId(2);
    assert_eq!(l.status(&members, 100), LeaseStatus::Available);

    l.lock(MemberId(1), 100, 1_000);
    assert_eq!(l.status(&members, 500), LeaseStatus::Locked);
    // the holder treats its own lease as expired a little early
    assert_eq!(l.status(&members, 1_095), LeaseStatus::Available);

    l.lock(MemberId(2), 100, 1_000);
    assert_eq!(l.status(&members, 1_095), LeaseStatus::Dirty);
    assert_eq!(l.status(&members, 1_100), LeaseStatus::Available);

    l.issuer_id = MemberId(3);
    l.validate(&members, 500);
    assert_eq!(l.issuer_id, MemberId::NONE);
    assert_eq!(l.status(&members, 500), LeaseStatus::Dirty);
}
