//! Replicated state for the ansible coordination plane.
//!
//! The shared document is a set of named maps. Each map key holds either a
//! scalar register or a record whose fields are individual registers; both
//! merge by last-writer-wins on a `(millis, lamport counter, actor)` clock,
//! with designated membership fields merging by set union instead. Entry
//! deletion is a tombstone that a later write resurrects past.
//!
//! The document is multi-writer across the mesh but single-process within a
//! host: every mutation produces an [`Op`] batch for the sync transport and
//! a [`DocEvent`] for local observers (the dispatcher, the snapshot
//! debouncer).

pub mod clock;
pub mod doc;
pub mod error;
pub mod snapshot;

pub use clock::Clock;
pub use doc::{ChangeOrigin, DocEvent, Document, Entry, EntryValue, FieldSlot, Op, UpdateBatch};
pub use error::{StateError, StateResult};
pub use snapshot::SnapshotStore;

/// Update batches with this origin were produced by local mutations.
pub const LOCAL_ORIGIN: u64 = 0;
