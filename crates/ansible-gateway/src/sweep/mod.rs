//! Periodic sweepers.
//!
//! Two are coordinator-gated (retention prune, SLA sweep): their periodic
//! bodies re-read `coordination["coordinator"]` and no-op when it is not
//! this node, which makes role handoffs eventually consistent and safe —
//! a brief two-coordinator window is harmless because every mutation here
//! is idempotent at CRDT granularity. The stale-lock reaper is a per-host
//! reliability guard and runs everywhere.

pub mod locks;
pub mod retention;
pub mod sla;

pub use locks::{sweep_locks, LockSweepReport};
pub use retention::{retention_tick, PruneOutcome};
pub use sla::{sla_sweep, SlaBreach, SlaSweepOptions, SlaSweepReport};
