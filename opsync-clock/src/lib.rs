//! Vector clocks for the operation log sync engine.
//!
//! Every operation carries a [`VectorClock`] mapping client ids to counters.
//! Comparing two clocks yields exactly one [`CausalOrder`]; that answer is
//! what decides whether a remote change is stale, newer, or in conflict.
//!
//! The clock algebra satisfies:
//! - **Commutative**: merge(a, b) == merge(b, a)
//! - **Associative**: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - **Idempotent**: merge(a, a) == a
//!
//! Clocks are bounded in size by [`VectorClock::limit_size`], which never
//! evicts the local client or protected ids. Because two independently
//! pruned clocks can disagree on which keys they kept, comparison of two
//! clocks that are both at the size cap only looks at their shared keys.

mod vector_clock;

pub use vector_clock::{
    merge_and_increment, CausalOrder, VectorClock, COUNTER_RESET_THRESHOLD,
    DEFAULT_MAX_CLOCK_SIZE, MAX_COUNTER,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised when building clocks from untrusted input.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("counter {value} for client {client} exceeds the safe integer range")]
    CounterOutOfRange { client: String, value: u64 },
}
