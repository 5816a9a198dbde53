//! Write clocks for last-writer-wins merges.

use serde::{Deserialize, Serialize};

/// A totally ordered write clock.
///
/// Ordering is lexicographic over `(ms, counter, actor)`: wall-clock
/// milliseconds first, then a per-document lamport counter to order
/// same-millisecond writes from one host, then the actor id as the final
/// deterministic tie-break across hosts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Clock {
    /// Milliseconds since epoch at write time.
    pub ms: i64,
    /// Lamport counter, advanced on every local mutation and raised to the
    /// maximum seen when merging remote writes.
    pub counter: u64,
    /// Writer's node id.
    pub actor: String,
}

impl Clock {
    #[must_use]
    pub fn new(ms: i64, counter: u64, actor: impl Into<String>) -> Self {
        Self {
            ms,
            counter,
            actor: actor.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_ms_then_counter_then_actor() {
        let a = Clock::new(1, 5, "z");
        let b = Clock::new(2, 0, "a");
        assert!(a < b);

        let c = Clock::new(2, 1, "a");
        assert!(b < c);

        let d = Clock::new(2, 1, "b");
        assert!(c < d);
    }

    #[test]
    fn equal_clocks_compare_equal() {
        let a = Clock::new(7, 7, "n1");
        let b = Clock::new(7, 7, "n1");
        assert_eq!(a, b);
    }
}
