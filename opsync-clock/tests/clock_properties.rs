//! Property-based tests for the clock algebra.
//!
//! - Commutativity: merge(A, B) == merge(B, A)
//! - Idempotence: merge(merge(A, B), B) == merge(A, B)
//! - Reflexivity: compare(A, A) == Equal
//! - Increment touches only its own entry
//! - merge_and_increment dominates every input
//! - Pruning never evicts current/protected ids and respects the cap

use opsync_clock::{merge_and_increment, CausalOrder, VectorClock};
use opsync_types::ClientId;
use proptest::prelude::*;
use std::collections::BTreeSet;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn client_strategy() -> impl Strategy<Value = ClientId> {
    prop::string::string_regex("[a-h]{1,2}")
        .unwrap()
        .prop_map(ClientId::from)
}

fn clock_strategy() -> impl Strategy<Value = VectorClock> {
    prop::collection::btree_map(client_strategy(), 1u64..1000, 0..12)
        .prop_map(VectorClock::from_entries)
}

// =============================================================================
// MERGE / COMPARE PROPERTIES
// =============================================================================

mod algebra_properties {
    use super::*;

    proptest! {
        #[test]
        fn compare_is_reflexive(a in clock_strategy()) {
            prop_assert_eq!(a.compare(&a), CausalOrder::Equal);
        }

        #[test]
        fn merge_is_commutative(a in clock_strategy(), b in clock_strategy()) {
            prop_assert_eq!(a.merged(&b), b.merged(&a));
        }

        #[test]
        fn merge_is_idempotent(a in clock_strategy(), b in clock_strategy()) {
            let ab = a.merged(&b);
            prop_assert_eq!(ab.merged(&b), ab);
        }

        #[test]
        fn merge_is_associative(a in clock_strategy(), b in clock_strategy(), c in clock_strategy()) {
            prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
        }

        #[test]
        fn compare_is_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
            prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
        }

        #[test]
        fn increment_touches_only_own_entry(a in clock_strategy(), id in client_strategy()) {
            let next = a.incremented(&id);
            prop_assert_eq!(next.get(&id), a.get(&id) + 1);
            for (k, v) in a.entries() {
                if *k != id {
                    prop_assert_eq!(next.get(k), *v);
                }
            }
        }

        #[test]
        fn merge_and_increment_dominates(
            clocks in prop::collection::vec(clock_strategy(), 1..6),
            id in client_strategy(),
        ) {
            let result = merge_and_increment(clocks.iter(), &id);
            for c in &clocks {
                prop_assert!(result.dominates(c));
                prop_assert_eq!(result.compare(c), CausalOrder::GreaterThan);
            }
        }
    }
}

// =============================================================================
// PRUNING PROPERTIES
// =============================================================================

mod pruning_properties {
    use super::*;

    proptest! {
        #[test]
        fn pruning_keeps_current_and_protected(
            a in clock_strategy(),
            me in client_strategy(),
            protected in prop::collection::btree_set(client_strategy(), 0..3),
            max in 4usize..10,
        ) {
            let a = a.incremented(&me);
            let pruned = a.limit_size(&me, &protected, max);

            prop_assert!(pruned.contains(&me));
            for p in &protected {
                if a.contains(p) {
                    prop_assert!(pruned.contains(p));
                }
            }
            prop_assert!(pruned.len() <= max);
            prop_assert!(a.dominates(&pruned));
        }

        #[test]
        fn pruning_keeps_values_unchanged(a in clock_strategy(), me in client_strategy()) {
            let pruned = a.limit_size(&me, &BTreeSet::new(), 3);
            for (k, v) in pruned.entries() {
                prop_assert_eq!(a.get(k), *v);
            }
        }
    }
}
