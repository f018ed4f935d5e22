//! Proptest generators for property-based testing.

use proptest::prelude::*;

use namesync_core::{Component, Keypair, Name, StateVector, SyncUpdate};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a generic name component.
pub fn component() -> impl Strategy<Value = Component> {
    "[a-z][a-z0-9-]{0,11}".prop_map(|s| Component::generic(&s))
}

/// Generate a name with 1 to `max_len` generic components.
pub fn name(max_len: usize) -> impl Strategy<Value = Name> {
    prop::collection::vec(component(), 1..=max_len.max(1)).prop_map(Name::from_components)
}

/// Generate a node id under `/app`.
pub fn node_id() -> impl Strategy<Value = Name> {
    "[a-z]{1,8}".prop_map(|s| {
        Name::from_components(vec![Component::generic("app"), Component::generic(&s)])
    })
}

/// Generate a valid sequence number (1-indexed).
pub fn seq() -> impl Strategy<Value = u64> {
    1u64..=1_000_000
}

/// Generate a state vector over up to `max_nodes` producers.
pub fn state_vector(max_nodes: usize) -> impl Strategy<Value = StateVector> {
    prop::collection::vec((node_id(), seq()), 0..=max_nodes)
        .prop_map(|entries| entries.into_iter().collect())
}

/// Generate a pair `(older, newer)` where `newer` dominates `older`.
pub fn dominating_pair(max_nodes: usize) -> impl Strategy<Value = (StateVector, StateVector)> {
    prop::collection::vec((node_id(), 0u64..100, 0u64..100), 0..=max_nodes).prop_map(|entries| {
        let mut older = StateVector::new();
        let mut newer = StateVector::new();
        for (id, base, extra) in entries {
            older.raise(&id, base);
            newer.raise(&id, base + extra);
        }
        (older, newer)
    })
}

/// Generate a shuffled partition of `1..=total` into contiguous update
/// ranges for one producer, as overlapping gossip rounds would report them.
pub fn update_ranges(id: Name, total: u64) -> impl Strategy<Value = Vec<SyncUpdate>> {
    let total = total.max(1);
    prop::collection::vec(1u64..=total, 0..total as usize)
        .prop_flat_map(move |mut cuts| {
            cuts.sort_unstable();
            cuts.dedup();
            let mut ranges = Vec::new();
            let mut lo = 1;
            for cut in cuts {
                if cut >= lo && cut < total {
                    ranges.push((lo, cut));
                    lo = cut + 1;
                }
            }
            ranges.push((lo, total));
            Just(ranges).prop_shuffle()
        })
        .prop_map(move |ranges| {
            ranges
                .into_iter()
                .map(|(lo, hi)| SyncUpdate::new(id.clone(), lo, hi))
                .collect()
        })
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a topic name.
pub fn topic() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}".prop_map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn dominating_pair_diff_is_consistent((older, newer) in dominating_pair(6)) {
            for update in newer.diff_ranges(&older) {
                prop_assert_eq!(update.lo, older.get(&update.id) + 1);
                prop_assert_eq!(update.hi, newer.get(&update.id));
            }
            prop_assert!(older.diff_ranges(&newer).is_empty());
        }

        #[test]
        fn update_ranges_cover_everything_once(
            ranges in update_ranges(Name::parse("/app/a").unwrap(), 20)
        ) {
            let mut covered: Vec<u64> = ranges.iter().flat_map(|u| u.lo..=u.hi).collect();
            covered.sort_unstable();
            prop_assert_eq!(covered, (1..=20).collect::<Vec<_>>());
        }
    }
}
