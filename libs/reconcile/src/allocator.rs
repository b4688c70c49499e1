//! Router id allocation.
//!
//! VRRP carries the router id in an 8-bit field, so a group can hold at most
//! 255 instances (id 0 is reserved). The allocator keeps every assignment
//! whose member is still present, frees the ids of members that left, and
//! hands each new member the lowest id that is neither blacklisted nor taken.

use std::collections::{BTreeMap, BTreeSet};

use crate::AllocationError;

/// Lowest assignable router id.
pub const MIN_ROUTER_ID: i32 = 1;

/// Highest assignable router id.
pub const MAX_ROUTER_ID: i32 = 255;

/// Presence bitmap over the router id space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterIdSet {
    words: [u64; 4],
}

impl RouterIdSet {
    /// Create an empty set.
    pub const fn new() -> Self {
        Self { words: [0; 4] }
    }

    /// Insert an id. Returns false if it was already present.
    pub fn insert(&mut self, id: u8) -> bool {
        let (word, bit) = Self::slot(id);
        let present = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !present
    }

    /// Check whether an id is present.
    pub fn contains(&self, id: u8) -> bool {
        let (word, bit) = Self::slot(id);
        self.words[word] & bit != 0
    }

    /// Number of ids present.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Lowest id in `1..=255` not present in the set.
    pub fn first_free(&self) -> Option<u8> {
        for (index, word) in self.words.iter().enumerate() {
            let mut free = !word;
            if index == 0 {
                free &= !1;
            }
            if free != 0 {
                return Some((index as u32 * 64 + free.trailing_zeros()) as u8);
            }
        }
        None
    }

    fn slot(id: u8) -> (usize, u64) {
        (usize::from(id / 64), 1u64 << (id % 64))
    }
}

impl FromIterator<u8> for RouterIdSet {
    fn from_iter<T: IntoIterator<Item = u8>>(iter: T) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// Converts a persisted id into the router id space.
fn router_id(value: i32) -> Option<u8> {
    if (MIN_ROUTER_ID..=MAX_ROUTER_ID).contains(&value) {
        u8::try_from(value).ok()
    } else {
        None
    }
}

/// Result of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// The complete new mapping.
    pub router_ids: BTreeMap<String, i32>,

    /// Members that lost their id, with the id they held.
    pub released: BTreeMap<String, i32>,

    /// Members that received a new id.
    pub assigned: BTreeMap<String, i32>,

    /// True if `router_ids` differs from the mapping passed in.
    pub changed: bool,
}

/// Compute the next router id mapping for a group.
///
/// `current` is the persisted mapping, `blacklist` the ids that must never
/// be handed out, and `members` the live membership. Inputs are borrowed and
/// never mutated, so on error the caller's mapping is still authoritative.
///
/// Entries of `current` are released when their id is blacklisted or outside
/// `1..=255`, when their member is gone, or when an earlier member (in key
/// order) already holds the same id. New members are served in key order and
/// each gets the lowest free id.
pub fn allocate(
    current: &BTreeMap<String, i32>,
    blacklist: &BTreeSet<i32>,
    members: &BTreeSet<String>,
) -> Result<Allocation, AllocationError> {
    let blocked: RouterIdSet = blacklist.iter().copied().filter_map(router_id).collect();

    let mut used = blocked;
    let mut router_ids = BTreeMap::new();
    let mut released = BTreeMap::new();

    for (member, &id) in current {
        let keep = match router_id(id) {
            Some(rid) => members.contains(member) && !blocked.contains(rid) && used.insert(rid),
            None => false,
        };

        if keep {
            router_ids.insert(member.clone(), id);
        } else {
            released.insert(member.clone(), id);
        }
    }

    let mut assigned = BTreeMap::new();
    for member in members {
        if router_ids.contains_key(member) {
            continue;
        }

        let id = used.first_free().ok_or_else(|| AllocationError::Exhausted {
            member: member.clone(),
        })?;
        used.insert(id);

        router_ids.insert(member.clone(), i32::from(id));
        assigned.insert(member.clone(), i32::from(id));
    }

    let changed = !released.is_empty() || !assigned.is_empty();

    Ok(Allocation {
        router_ids,
        released,
        assigned,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn ids(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn members(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn blacklist(values: &[i32]) -> BTreeSet<i32> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_router_id_set_first_free() {
        let mut set = RouterIdSet::new();
        assert_eq!(set.first_free(), Some(1));

        set.insert(1);
        set.insert(2);
        assert_eq!(set.first_free(), Some(3));

        let full: RouterIdSet = (1..=255u8).collect();
        assert_eq!(full.len(), 255);
        assert_eq!(full.first_free(), None);

        let mut crossing: RouterIdSet = (1..=64u8).collect();
        assert_eq!(crossing.first_free(), Some(65));
        assert!(!crossing.insert(64));
        assert!(crossing.insert(65));
        assert!(crossing.contains(65));
    }

    #[test]
    fn test_scenarios_a_to_d() {
        let bl = blacklist(&[1, 2, 4, 5]);

        // A: first member skips blacklisted 1 and 2.
        let a = allocate(&BTreeMap::new(), &bl, &members(&["ns/svc1"])).unwrap();
        assert_eq!(a.router_ids, ids(&[("ns/svc1", 3)]));
        assert!(a.changed);

        // B: next member skips blacklisted 4 and 5.
        let b = allocate(&a.router_ids, &bl, &members(&["ns/svc1", "ns/svc2"])).unwrap();
        assert_eq!(b.router_ids, ids(&[("ns/svc1", 3), ("ns/svc2", 6)]));
        assert_eq!(b.assigned, ids(&[("ns/svc2", 6)]));

        // C: svc1 leaves.
        let c = allocate(&b.router_ids, &bl, &members(&["ns/svc2"])).unwrap();
        assert_eq!(c.router_ids, ids(&[("ns/svc2", 6)]));
        assert_eq!(c.released, ids(&[("ns/svc1", 3)]));
        assert!(c.changed);

        // D: the freed id 3 is reused.
        let d = allocate(&c.router_ids, &bl, &members(&["ns/svc2", "ns/svc3"])).unwrap();
        assert_eq!(d.router_ids, ids(&[("ns/svc2", 6), ("ns/svc3", 3)]));
    }

    #[test]
    fn test_idempotent_when_membership_unchanged() {
        let bl = blacklist(&[2]);
        let m = members(&["a/x", "a/y", "b/z"]);
        let first = allocate(&BTreeMap::new(), &bl, &m).unwrap();
        let second = allocate(&first.router_ids, &bl, &m).unwrap();

        assert!(!second.changed);
        assert_eq!(second.router_ids, first.router_ids);
        assert!(second.released.is_empty());
        assert!(second.assigned.is_empty());
    }

    #[test]
    fn test_new_members_served_in_key_order() {
        let result = allocate(
            &BTreeMap::new(),
            &BTreeSet::new(),
            &members(&["ns/c", "ns/a", "ns/b"]),
        )
        .unwrap();
        assert_eq!(result.router_ids, ids(&[("ns/a", 1), ("ns/b", 2), ("ns/c", 3)]));
    }

    #[test]
    fn test_swap_reuses_vacated_id() {
        let current = ids(&[("ns/old", 1), ("ns/stay", 2)]);
        let result = allocate(&current, &BTreeSet::new(), &members(&["ns/new", "ns/stay"])).unwrap();
        assert_eq!(result.router_ids, ids(&[("ns/new", 1), ("ns/stay", 2)]));
        assert!(result.changed);
    }

    #[test]
    fn test_blacklisting_assigned_id_moves_member() {
        let current = ids(&[("ns/a", 1), ("ns/b", 2)]);
        let result = allocate(&current, &blacklist(&[1]), &members(&["ns/a", "ns/b"])).unwrap();

        assert_eq!(result.router_ids, ids(&[("ns/a", 3), ("ns/b", 2)]));
        assert_eq!(result.released, ids(&[("ns/a", 1)]));
        assert_eq!(result.assigned, ids(&[("ns/a", 3)]));
        assert!(result.changed);
    }

    #[test]
    fn test_blacklist_release_of_departed_member_counts_as_change() {
        let current = ids(&[("ns/gone", 7)]);
        let result = allocate(&current, &blacklist(&[7]), &BTreeSet::new()).unwrap();
        assert!(result.router_ids.is_empty());
        assert!(result.changed);
    }

    #[rstest]
    #[case(0)]
    #[case(256)]
    #[case(-1)]
    fn test_out_of_range_persisted_id_is_replaced(#[case] bogus: i32) {
        let current = ids(&[("ns/a", bogus)]);
        let result = allocate(&current, &BTreeSet::new(), &members(&["ns/a"])).unwrap();
        assert_eq!(result.router_ids, ids(&[("ns/a", 1)]));
    }

    #[test]
    fn test_duplicate_persisted_ids_are_repaired() {
        let current = ids(&[("ns/a", 4), ("ns/b", 4)]);
        let result = allocate(&current, &BTreeSet::new(), &members(&["ns/a", "ns/b"])).unwrap();
        assert_eq!(result.router_ids, ids(&[("ns/a", 4), ("ns/b", 1)]));
    }

    #[test]
    fn test_exhaustion_fails_without_touching_input() {
        let current: BTreeMap<String, i32> = (1..=255).map(|i| (format!("ns/svc{i:03}"), i)).collect();
        let mut live: BTreeSet<String> = current.keys().cloned().collect();
        live.insert("ns/svc999".to_string());

        let snapshot = current.clone();
        let err = allocate(&current, &BTreeSet::new(), &live).unwrap_err();

        assert_eq!(
            err,
            AllocationError::Exhausted {
                member: "ns/svc999".to_string()
            }
        );
        assert_eq!(current, snapshot);
    }

    #[test]
    fn test_blacklist_shrinks_capacity() {
        let live: BTreeSet<String> = (0..254).map(|i| format!("ns/svc{i:03}")).collect();
        assert!(allocate(&BTreeMap::new(), &blacklist(&[10]), &live).is_ok());
        assert!(allocate(&BTreeMap::new(), &blacklist(&[10, 11]), &live).is_err());
    }

    fn arb_state() -> impl Strategy<Value = (BTreeMap<String, i32>, BTreeSet<i32>, BTreeSet<String>)> {
        (
            prop::collection::btree_map("[a-d]/[a-f]{1,2}", 1..=255i32, 0..40),
            prop::collection::btree_set(1..=255i32, 0..40),
            prop::collection::btree_set("[a-d]/[a-f]{1,2}", 0..60),
        )
    }

    proptest! {
        #[test]
        fn prop_mapping_invariants((current, bl, live) in arb_state()) {
            let result = allocate(&current, &bl, &live).unwrap();

            let keys: BTreeSet<String> = result.router_ids.keys().cloned().collect();
            prop_assert_eq!(&keys, &live);

            let values: BTreeSet<i32> = result.router_ids.values().copied().collect();
            prop_assert_eq!(values.len(), result.router_ids.len());

            for id in result.router_ids.values() {
                prop_assert!((MIN_ROUTER_ID..=MAX_ROUTER_ID).contains(id));
                prop_assert!(!bl.contains(id));
            }

            prop_assert_eq!(result.changed, result.router_ids != current);
        }

        #[test]
        fn prop_survivors_keep_their_ids((current, bl, live) in arb_state()) {
            let result = allocate(&current, &bl, &live).unwrap();
            let mut seen = BTreeSet::new();

            for (member, id) in &current {
                if live.contains(member) && !bl.contains(id) && seen.insert(*id) {
                    prop_assert_eq!(result.router_ids.get(member), Some(id));
                }
            }
        }

        #[test]
        fn prop_new_ids_are_lowest_free((current, bl, live) in arb_state()) {
            let result = allocate(&current, &bl, &live).unwrap();

            let mut used: BTreeSet<i32> = bl.clone();
            for (member, id) in &result.router_ids {
                if !result.assigned.contains_key(member) {
                    used.insert(*id);
                }
            }

            for id in result.assigned.values() {
                let lowest = (MIN_ROUTER_ID..=MAX_ROUTER_ID).find(|i| !used.contains(i));
                prop_assert_eq!(Some(*id), lowest);
                used.insert(*id);
            }
        }

        #[test]
        fn prop_second_pass_is_noop((current, bl, live) in arb_state()) {
            let first = allocate(&current, &bl, &live).unwrap();
            let second = allocate(&first.router_ids, &bl, &live).unwrap();
            prop_assert!(!second.changed);
            prop_assert_eq!(second.router_ids, first.router_ids);
        }
    }
}
