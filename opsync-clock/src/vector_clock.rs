//! Vector Clock for causality tracking.
//!
//! A vector clock tracks logical time across every client that has touched
//! the shared state, enabling determination of causality (happens-before
//! relationships) between operations.
//!
//! Use cases:
//! - Detecting concurrent edits of the same entity
//! - Recognising stale remote operations that need not be applied
//! - Building merge operations that dominate every input

use crate::{Error, Result};
use opsync_types::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Default number of client entries a clock may carry before pruning.
pub const DEFAULT_MAX_CLOCK_SIZE: usize = 50;

/// Largest counter value that survives a round trip through a JSON number
/// on every client (2^53 - 1).
pub const MAX_COUNTER: u64 = (1 << 53) - 1;

/// Local counters at or above this value trigger an identity rotation
/// before the next operation is stamped.
pub const COUNTER_RESET_THRESHOLD: u64 = MAX_COUNTER - 1_000_000;

/// Causality relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CausalOrder {
    /// Clocks are identical.
    Equal,
    /// First clock happened before second.
    LessThan,
    /// First clock happened after second.
    GreaterThan,
    /// Clocks are concurrent (neither happened before the other).
    Concurrent,
}

impl CausalOrder {
    /// The same relationship seen from the other clock.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::LessThan => Self::GreaterThan,
            Self::GreaterThan => Self::LessThan,
            other => other,
        }
    }
}

/// A Vector Clock for tracking causality across clients.
///
/// Each client has a logical counter that it alone increments when it
/// stamps a new operation. Entries are kept sorted by client id so the
/// serialized form is identical on every device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The first clock of a freshly minted identity: `{client: 1}`.
    #[must_use]
    pub fn initial(client: ClientId) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(client, 1);
        Self { entries }
    }

    /// Builds a clock from `(client, counter)` pairs.
    ///
    /// Later duplicates win over earlier ones.
    #[must_use]
    pub fn from_entries<I, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (C, u64)>,
        C: Into<ClientId>,
    {
        Self {
            entries: entries.into_iter().map(|(c, v)| (c.into(), v)).collect(),
        }
    }

    /// Rejects counters outside the JSON-safe integer range.
    pub fn validate(&self) -> Result<()> {
        match self.entries.iter().find(|(_, v)| **v > MAX_COUNTER) {
            Some((client, value)) => Err(Error::CounterOutOfRange {
                client: client.to_string(),
                value: *value,
            }),
            None => Ok(()),
        }
    }

    /// Returns the logical time for a client (0 if not present).
    #[must_use]
    pub fn get(&self, client: &ClientId) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Returns true if the client has an entry in this clock.
    #[must_use]
    pub fn contains(&self, client: &ClientId) -> bool {
        self.entries.contains_key(client)
    }

    /// Returns all clients and their times, ordered by client id.
    pub fn entries(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.entries.iter()
    }

    /// Returns the client ids present in this clock.
    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.entries.keys()
    }

    /// Returns the number of clients in the clock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the clock has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Increments the clock for a client and returns the new time.
    ///
    /// Saturates at [`MAX_COUNTER`]; callers are expected to rotate the
    /// identity long before that via [`Self::needs_counter_reset`].
    pub fn increment(&mut self, client: &ClientId) -> u64 {
        let entry = self.entries.entry(client.clone()).or_insert(0);
        *entry = entry.saturating_add(1).min(MAX_COUNTER);
        *entry
    }

    /// Returns a copy with the client's entry incremented.
    #[must_use]
    pub fn incremented(&self, client: &ClientId) -> Self {
        let mut result = self.clone();
        result.increment(client);
        result
    }

    /// Updates the clock for a client to a specific time.
    ///
    /// Only updates if the new time is greater than the current time.
    pub fn update(&mut self, client: &ClientId, time: u64) {
        let entry = self.entries.entry(client.clone()).or_insert(0);
        if time > *entry {
            *entry = time;
        }
    }

    /// Merges another vector clock into this one.
    ///
    /// For each client, takes the maximum of the two times.
    pub fn merge(&mut self, other: &Self) {
        for (client, &time) in &other.entries {
            let entry = self.entries.entry(client.clone()).or_insert(0);
            if time > *entry {
                *entry = time;
            }
        }
    }

    /// Creates a new clock that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares this clock with another using [`DEFAULT_MAX_CLOCK_SIZE`].
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        self.compare_with_limit(other, DEFAULT_MAX_CLOCK_SIZE)
    }

    /// Compares this clock with another to determine causal ordering.
    ///
    /// When both clocks are at (or, in the degenerate protected-id case,
    /// above) `max_size` entries, only keys present in both are compared:
    /// each side may have pruned entries the other kept. Two such clocks
    /// with no shared key compare as [`CausalOrder::Concurrent`]. If either
    /// clock is below the cap the full union of keys is used.
    #[must_use]
    pub fn compare_with_limit(&self, other: &Self, max_size: usize) -> CausalOrder {
        if self.len() >= max_size && other.len() >= max_size {
            let shared: Vec<&ClientId> = self
                .entries
                .keys()
                .filter(|k| other.entries.contains_key(*k))
                .collect();
            if shared.is_empty() {
                return CausalOrder::Concurrent;
            }
            return order_over(shared.into_iter(), self, other);
        }

        let all: BTreeSet<&ClientId> = self.entries.keys().chain(other.entries.keys()).collect();
        order_over(all.into_iter(), self, other)
    }

    /// Returns true if this clock is causally before the other.
    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::LessThan
    }

    /// Returns true if this clock is causally after the other.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::GreaterThan
    }

    /// Returns true if this clock is concurrent with the other.
    #[must_use]
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Returns true if every entry of `other` is <= the same entry here.
    ///
    /// Unlike [`Self::compare`] this always checks the full key set.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        other.entries.iter().all(|(k, v)| self.get(k) >= *v)
    }

    /// Bounds the clock to `max_size` entries.
    ///
    /// `current` and every id in `protected` are always retained. Remaining
    /// entries are kept highest-counter first (ties broken by client id) until
    /// the size cap is met. If `current` plus the protected ids alone exceed
    /// the cap, they are all kept and the result is larger than `max_size`.
    #[must_use]
    pub fn limit_size(
        &self,
        current: &ClientId,
        protected: &BTreeSet<ClientId>,
        max_size: usize,
    ) -> Self {
        if self.len() <= max_size {
            return self.clone();
        }

        let mut kept: BTreeMap<ClientId, u64> = self
            .entries
            .iter()
            .filter(|(k, _)| *k == current || protected.contains(*k))
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        if kept.len() > max_size {
            warn!(
                "Clock pruning kept {} current/protected entries, above the cap of {}",
                kept.len(),
                max_size
            );
            return Self { entries: kept };
        }

        let mut rest: Vec<(&ClientId, &u64)> = self
            .entries
            .iter()
            .filter(|(k, _)| !kept.contains_key(*k))
            .collect();
        rest.sort_by(|(ka, va), (kb, vb)| vb.cmp(va).then_with(|| ka.cmp(kb)));

        let slots = max_size - kept.len();
        for (k, v) in rest.into_iter().take(slots) {
            kept.insert(k.clone(), *v);
        }

        Self { entries: kept }
    }

    /// Returns true when the client's counter is close enough to
    /// [`MAX_COUNTER`] that its identity should be rotated.
    #[must_use]
    pub fn needs_counter_reset(&self, client: &ClientId) -> bool {
        self.get(client) >= COUNTER_RESET_THRESHOLD
    }
}

/// Merges every clock then increments `client`'s own entry.
///
/// The result dominates each input, so an operation stamped with it is a
/// valid convergence point no matter the order inputs were delivered in.
#[must_use]
pub fn merge_and_increment<'a, I>(clocks: I, client: &ClientId) -> VectorClock
where
    I: IntoIterator<Item = &'a VectorClock>,
{
    let mut merged = VectorClock::new();
    for clock in clocks {
        merged.merge(clock);
    }
    merged.increment(client);
    merged
}

fn order_over<'a>(
    keys: impl Iterator<Item = &'a ClientId>,
    a: &VectorClock,
    b: &VectorClock,
) -> CausalOrder {
    let mut a_ge = true;
    let mut b_ge = true;

    for key in keys {
        let (x, y) = (a.get(key), b.get(key));
        if x < y {
            a_ge = false;
        }
        if y < x {
            b_ge = false;
        }
        if !a_ge && !b_ge {
            return CausalOrder::Concurrent;
        }
    }

    match (a_ge, b_ge) {
        (true, true) => CausalOrder::Equal,
        (true, false) => CausalOrder::GreaterThan,
        (false, true) => CausalOrder::LessThan,
        (false, false) => CausalOrder::Concurrent,
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        let all: BTreeSet<&ClientId> = self.entries.keys().chain(other.entries.keys()).collect();
        order_over(all.into_iter(), self, other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}
