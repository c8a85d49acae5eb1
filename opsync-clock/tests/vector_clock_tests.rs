use opsync_clock::{
    merge_and_increment, CausalOrder, VectorClock, COUNTER_RESET_THRESHOLD, MAX_COUNTER,
};
use opsync_types::ClientId;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

fn id(s: &str) -> ClientId {
    ClientId::from(s)
}

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    VectorClock::from_entries(entries.iter().map(|(k, v)| (*k, *v)))
}

#[test]
fn new_clock_is_empty() {
    let c = VectorClock::new();
    assert!(c.is_empty());
    assert_eq!(c.len(), 0);
}

#[test]
fn initial_starts_at_one() {
    let c = VectorClock::initial(id("a"));
    assert_eq!(c.len(), 1);
    assert_eq!(c.get(&id("a")), 1);
}

#[test]
fn get_unknown_client_returns_zero() {
    assert_eq!(VectorClock::new().get(&id("nobody")), 0);
}

// ── Increment ─────────────────────────────────────────────────────

#[test]
fn increment_increases_time() {
    let mut c = VectorClock::new();
    assert_eq!(c.increment(&id("a")), 1);
    assert_eq!(c.increment(&id("a")), 2);
    assert_eq!(c.get(&id("a")), 2);
}

#[test]
fn incremented_leaves_other_entries_alone() {
    let c = clock(&[("a", 3), ("b", 7)]);
    let next = c.incremented(&id("a"));
    assert_eq!(next.get(&id("a")), 4);
    assert_eq!(next.get(&id("b")), 7);
    assert_eq!(c.get(&id("a")), 3);
}

#[test]
fn increment_saturates_at_max_counter() {
    let mut c = clock(&[("a", MAX_COUNTER)]);
    assert_eq!(c.increment(&id("a")), MAX_COUNTER);
}

#[test]
fn counter_reset_flag() {
    assert!(!clock(&[("a", 10)]).needs_counter_reset(&id("a")));
    assert!(clock(&[("a", COUNTER_RESET_THRESHOLD)]).needs_counter_reset(&id("a")));
}

#[test]
fn validate_rejects_unsafe_counters() {
    assert!(clock(&[("a", MAX_COUNTER)]).validate().is_ok());
    assert!(clock(&[("a", MAX_COUNTER + 1)]).validate().is_err());
}

// ── Merge ─────────────────────────────────────────────────────────

#[test]
fn merge_takes_elementwise_max() {
    let merged = clock(&[("a", 3), ("b", 1)]).merged(&clock(&[("b", 4), ("c", 2)]));
    assert_eq!(merged, clock(&[("a", 3), ("b", 4), ("c", 2)]));
}

#[test]
fn update_lower_value_is_noop() {
    let mut c = VectorClock::new();
    c.update(&id("a"), 10);
    c.update(&id("a"), 3);
    assert_eq!(c.get(&id("a")), 10);
}

#[test]
fn merge_and_increment_dominates_all_inputs() {
    let inputs = [clock(&[("a", 2), ("b", 1)]), clock(&[("a", 1), ("b", 5)]), clock(&[("c", 9)])];
    let result = merge_and_increment(inputs.iter(), &id("a"));
    assert_eq!(result, clock(&[("a", 3), ("b", 5), ("c", 9)]));
    for input in &inputs {
        assert!(result.dominates(input));
        assert_eq!(result.compare(input), CausalOrder::GreaterThan);
    }
}

// ── Compare ───────────────────────────────────────────────────────

#[test]
fn compare_equal() {
    let a = clock(&[("a", 1), ("b", 2)]);
    assert_eq!(a.compare(&a.clone()), CausalOrder::Equal);
}

#[test]
fn compare_superset_is_greater() {
    let a = clock(&[("A", 1)]);
    let b = clock(&[("A", 1), ("B", 1)]);
    assert_eq!(b.compare(&a), CausalOrder::GreaterThan);
    assert_eq!(a.compare(&b), CausalOrder::LessThan);
}

#[test]
fn compare_crossed_is_concurrent() {
    let a = clock(&[("A", 2), ("B", 1)]);
    let b = clock(&[("A", 1), ("B", 2)]);
    assert_eq!(a.compare(&b), CausalOrder::Concurrent);
    assert!(a.is_concurrent(&b));
}

#[test]
fn reverse_flips_direction() {
    assert_eq!(CausalOrder::LessThan.reverse(), CausalOrder::GreaterThan);
    assert_eq!(CausalOrder::Concurrent.reverse(), CausalOrder::Concurrent);
}

#[test]
fn full_clocks_compare_on_shared_keys_only() {
    // Each side pruned a different key; the shared keys say b is newer.
    let a = clock(&[("x", 1), ("y", 1), ("only-a", 5)]);
    let b = clock(&[("x", 2), ("y", 1), ("only-b", 5)]);
    assert_eq!(a.compare_with_limit(&b, 3), CausalOrder::LessThan);
    assert_eq!(b.compare_with_limit(&a, 3), CausalOrder::GreaterThan);
    // Below the cap the union is used and the pruned keys matter.
    assert_eq!(a.compare_with_limit(&b, 4), CausalOrder::Concurrent);
}

#[test]
fn full_clocks_without_shared_keys_are_concurrent() {
    let a = clock(&[("a1", 1), ("a2", 1)]);
    let b = clock(&[("b1", 1), ("b2", 1)]);
    assert_eq!(a.compare_with_limit(&b, 2), CausalOrder::Concurrent);
}

#[test]
fn one_side_below_cap_uses_union() {
    let a = clock(&[("x", 1), ("y", 1)]);
    let b = clock(&[("x", 1)]);
    assert_eq!(a.compare_with_limit(&b, 2), CausalOrder::GreaterThan);
}

// ── Pruning ───────────────────────────────────────────────────────

#[test]
fn limit_size_noop_when_within_cap() {
    let c = clock(&[("a", 1), ("b", 2)]);
    assert_eq!(c.limit_size(&id("a"), &BTreeSet::new(), 5), c);
}

#[test]
fn limit_size_drops_lowest_counters() {
    let c = clock(&[("me", 1), ("hi", 50), ("mid", 20), ("lo", 2)]);
    let pruned = c.limit_size(&id("me"), &BTreeSet::new(), 3);
    assert_eq!(pruned, clock(&[("me", 1), ("hi", 50), ("mid", 20)]));
}

#[test]
fn limit_size_keeps_protected_even_with_low_counter() {
    let c = clock(&[("me", 9), ("import", 1), ("a", 5), ("b", 6)]);
    let protected: BTreeSet<ClientId> = [id("import")].into_iter().collect();
    let pruned = c.limit_size(&id("me"), &protected, 3);
    assert!(pruned.contains(&id("import")));
    assert!(pruned.contains(&id("me")));
    assert!(pruned.contains(&id("b")));
    assert_eq!(pruned.len(), 3);
}

#[test]
fn limit_size_tie_break_is_deterministic() {
    let c = clock(&[("me", 1), ("z", 4), ("y", 4), ("x", 4)]);
    let pruned = c.limit_size(&id("me"), &BTreeSet::new(), 3);
    assert_eq!(pruned, clock(&[("me", 1), ("x", 4), ("y", 4)]));
}

#[test]
fn limit_size_degenerate_keeps_all_protected() {
    let c = clock(&[("me", 1), ("p1", 1), ("p2", 1), ("other", 10)]);
    let protected: BTreeSet<ClientId> = [id("p1"), id("p2")].into_iter().collect();
    let pruned = c.limit_size(&id("me"), &protected, 2);
    assert_eq!(pruned, clock(&[("me", 1), ("p1", 1), ("p2", 1)]));
}

#[test]
fn pruned_clock_still_dominates_import() {
    // 91 clients; the import client holds counter 1 and is protected.
    let mut c = VectorClock::initial(id("import"));
    for i in 0..89 {
        c.update(&id(&format!("peer-{i:02}")), 10 + i);
    }
    let me = id("me");
    c.update(&me, 3);
    assert_eq!(c.len(), 91);

    let import_clock = VectorClock::initial(id("import"));
    let protected: BTreeSet<ClientId> = [id("import")].into_iter().collect();

    let next = c.incremented(&me).limit_size(&me, &protected, 50);
    assert_eq!(next.len(), 50);
    assert_eq!(next.get(&id("import")), 1);
    assert_eq!(next.get(&me), 4);
    assert_eq!(next.compare(&import_clock), CausalOrder::GreaterThan);
}

// ── Serialization ─────────────────────────────────────────────────

#[test]
fn serializes_with_sorted_keys() {
    let c = clock(&[("zeta", 1), ("alpha", 2), ("mid", 3)]);
    let json = serde_json::to_string(&c).unwrap();
    assert_eq!(json, r#"{"alpha":2,"mid":3,"zeta":1}"#);
}

#[test]
fn causal_order_wire_names() {
    let json = serde_json::to_string(&CausalOrder::GreaterThan).unwrap();
    assert_eq!(json, "\"GREATER_THAN\"");
}
