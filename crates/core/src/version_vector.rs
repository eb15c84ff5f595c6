//! Version vectors
//!
//! A version vector maps replica ids to monotonically increasing per-replica
//! counters. Comparing two vectors yields the partial order used by
//! replication to tell strictly-newer, strictly-older and concurrent edits
//! apart.
//!
//! The vector also carries `updated_at`, the wall-clock time (milliseconds
//! since epoch) of the latest increment it has observed. It plays no part in
//! ordering; conflict policies use it as a tie breaker between concurrent
//! edits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-replica logical clock
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionVector {
    #[serde(default)]
    value: BTreeMap<u64, u64>,
    #[serde(default)]
    updated_at: i64,
}

impl VersionVector {
    /// Create an empty vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a vector holding the pointwise maximum of `vectors`
    pub fn from_vectors<'a>(vectors: impl IntoIterator<Item = &'a VersionVector>) -> Self {
        let mut v = Self::new();
        for o in vectors {
            v.update(o);
        }
        v
    }

    /// Create a vector from explicit `(replica, counter)` pairs
    pub fn from_entries(entries: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            value: entries.into_iter().collect(),
            updated_at: 0,
        }
    }

    /// Counter of `replica`, zero when unseen
    pub fn get(&self, replica: u64) -> u64 {
        self.value.get(&replica).copied().unwrap_or(0)
    }

    /// Counter of `replica` if the vector has an entry for it
    pub fn entry(&self, replica: u64) -> Option<u64> {
        self.value.get(&replica).copied()
    }

    /// Number of replicas with an entry
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// True when no replica has an entry
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Iterate `(replica, counter)` pairs in replica order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.value.iter().map(|(k, v)| (*k, *v))
    }

    /// Time of the latest observed increment, milliseconds since epoch
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Override the observed update time
    pub fn set_updated_at(&mut self, updated_at: i64) {
        self.updated_at = updated_at;
    }

    /// Record one more local edit by `replica`
    pub fn increment(&mut self, replica: u64) {
        *self.value.entry(replica).or_insert(0) += 1;
        self.updated_at = self.updated_at.max(chrono::Utc::now().timestamp_millis());
    }

    /// Pointwise maximum merge with `other`
    ///
    /// Commutative, associative and idempotent.
    pub fn update(&mut self, other: &VersionVector) {
        for (replica, counter) in &other.value {
            let e = self.value.entry(*replica).or_insert(0);
            if *e < *counter {
                *e = *counter;
            }
        }
        self.updated_at = self.updated_at.max(other.updated_at);
    }

    /// Pointwise minimum with `other`
    ///
    /// Replicas missing from either side are dropped: an absent entry means
    /// "nothing known", which is below every counter.
    pub fn downgrade(&mut self, other: &VersionVector) {
        self.value.retain(|replica, counter| match other.value.get(replica) {
            Some(o) => {
                if *o < *counter {
                    *counter = *o;
                }
                true
            }
            None => false,
        });
        self.updated_at = self.updated_at.min(other.updated_at);
    }

    /// True iff `other` has observed everything `self` has
    pub fn precedes(&self, other: &VersionVector) -> bool {
        self.value
            .iter()
            .all(|(replica, counter)| other.get(*replica) >= *counter)
    }

    /// True iff neither vector precedes the other
    pub fn conflicts(&self, other: &VersionVector) -> bool {
        !self.precedes(other) && !other.precedes(self)
    }

    /// Compare `self` against `other`
    ///
    /// Returns the summed per-replica difference `self - other` and whether
    /// the two vectors are ordered. When `ordered` is true a negative delta
    /// means `self` is strictly older, a positive delta strictly newer and
    /// zero equal. When `ordered` is false the edits are concurrent and the
    /// delta carries no meaning.
    pub fn compare(&self, other: &VersionVector) -> (i64, bool) {
        let mut delta: i64 = 0;
        let mut newer = false;
        let mut older = false;

        for (replica, counter) in &self.value {
            let d = *counter as i64 - other.get(*replica) as i64;
            newer |= d > 0;
            older |= d < 0;
            delta += d;
        }
        for (replica, counter) in &other.value {
            if !self.value.contains_key(replica) && *counter > 0 {
                older = true;
                delta -= *counter as i64;
            }
        }

        (delta, !(newer && older))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vv(entries: &[(u64, u64)]) -> VersionVector {
        VersionVector::from_entries(entries.iter().copied())
    }

    #[test]
    fn test_increment() {
        let mut v = VersionVector::new();
        v.increment(1);
        v.increment(1);
        v.increment(2);
        assert_eq!(v.get(1), 2);
        assert_eq!(v.get(2), 1);
        assert_eq!(v.get(3), 0);
        assert!(v.updated_at() > 0);
    }

    #[test]
    fn test_from_vectors_is_union_of_maxima() {
        let v = VersionVector::from_vectors([&vv(&[(1, 3), (2, 1)]), &vv(&[(2, 4), (3, 1)])]);
        assert_eq!(v, vv(&[(1, 3), (2, 4), (3, 1)]));
    }

    #[test]
    fn test_precedes() {
        let a = vv(&[(1, 1)]);
        let b = vv(&[(1, 1), (2, 1)]);
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));
        assert!(a.precedes(&a));
        assert!(VersionVector::new().precedes(&a));
    }

    #[test]
    fn test_conflicts() {
        let a = vv(&[(1, 1), (2, 0)]);
        let b = vv(&[(1, 0), (2, 1)]);
        assert!(a.conflicts(&b));
        assert!(b.conflicts(&a));
        assert!(!a.conflicts(&vv(&[(1, 2), (2, 1)])));
    }

    #[test]
    fn test_compare_cases() {
        let base = vv(&[(1, 1)]);
        let newer = vv(&[(1, 2)]);
        let other = vv(&[(2, 1)]);

        assert_eq!(base.compare(&newer), (-1, true));
        assert_eq!(newer.compare(&base), (1, true));
        assert_eq!(base.compare(&base), (0, true));
        assert!(!base.compare(&other).1);
    }

    #[test]
    fn test_compare_missing_zero_entries_are_equal() {
        let a = vv(&[(1, 1), (2, 0)]);
        let b = vv(&[(1, 1)]);
        assert_eq!(a.compare(&b), (0, true));
        assert_eq!(b.compare(&a), (0, true));
    }

    #[test]
    fn test_downgrade() {
        let mut a = vv(&[(1, 5), (2, 2), (3, 1)]);
        a.downgrade(&vv(&[(1, 3), (2, 7)]));
        assert_eq!(a, vv(&[(1, 3), (2, 2)]));
    }

    #[test]
    fn test_update_keeps_latest_timestamp() {
        let mut a = vv(&[(1, 1)]);
        a.set_updated_at(10);
        let mut b = vv(&[(2, 1)]);
        b.set_updated_at(20);
        a.update(&b);
        assert_eq!(a.updated_at(), 20);
    }

    fn arb_vv() -> impl Strategy<Value = VersionVector> {
        (
            prop::collection::btree_map(0u64..6, 0u64..20, 0..6),
            0i64..1_000,
        )
            .prop_map(|(value, updated_at)| VersionVector { value, updated_at })
    }

    proptest! {
        #[test]
        fn prop_update_commutative(a in arb_vv(), b in arb_vv()) {
            let mut ab = a.clone();
            ab.update(&b);
            let mut ba = b.clone();
            ba.update(&a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_update_idempotent(a in arb_vv(), b in arb_vv()) {
            let mut once = a.clone();
            once.update(&b);
            let mut twice = once.clone();
            twice.update(&b);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_update_associative(a in arb_vv(), b in arb_vv(), c in arb_vv()) {
            let mut left = a.clone();
            left.update(&b);
            left.update(&c);
            let mut bc = b.clone();
            bc.update(&c);
            let mut right = a.clone();
            right.update(&bc);
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_precedes_merge(a in arb_vv(), b in arb_vv()) {
            let mut merged = a.clone();
            merged.update(&b);
            prop_assert!(a.precedes(&merged));
            prop_assert!(b.precedes(&merged));
        }

        #[test]
        fn prop_compare_agrees_with_precedes(a in arb_vv(), b in arb_vv()) {
            let (delta, ordered) = a.compare(&b);
            prop_assert_eq!(ordered, !a.conflicts(&b));
            if ordered && delta < 0 {
                prop_assert!(a.precedes(&b));
            }
            if ordered && delta > 0 {
                prop_assert!(b.precedes(&a));
            }
        }
    }
}
