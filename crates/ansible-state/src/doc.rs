//! The named-map LWW document.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::Clock;
use crate::error::{StateError, StateResult};
use crate::LOCAL_ORIGIN;

/// Channel capacity for change and update subscriptions.
const CHANNEL_CAPACITY: usize = 1024;

/// Fields that merge by set union instead of last-writer-wins.
///
/// Union fields only ever grow; writers union locally before writing, and
/// the merge unions across replicas so a read marker is never lost to a
/// concurrent overwrite.
const UNION_FIELDS: &[&str] = &["readBy_agents"];

/// One field register inside a record entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub value: Value,
    pub clock: Clock,
}

/// The value half of an entry: a whole-value register or a per-field record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryValue {
    Scalar(FieldSlot),
    Record(BTreeMap<String, FieldSlot>),
}

impl EntryValue {
    /// Greatest write clock anywhere in the value.
    fn max_clock(&self) -> Option<&Clock> {
        match self {
            Self::Scalar(slot) => Some(&slot.clock),
            Self::Record(fields) => fields.values().map(|s| &s.clock).max_by(|a, b| a.cmp(b)),
        }
    }
}

/// One key's state inside a map: its value plus an optional tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: EntryValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Clock>,
}

impl Entry {
    /// An entry is live when some write is newer than the tombstone.
    #[must_use]
    pub fn is_live(&self) -> bool {
        match &self.tombstone {
            None => true,
            Some(t) => self.value.max_clock().is_some_and(|c| c > t),
        }
    }

    /// Materialize the entry into plain JSON (`None` when tombstoned).
    #[must_use]
    pub fn materialize(&self) -> Option<Value> {
        if !self.is_live() {
            return None;
        }
        Some(match &self.value {
            EntryValue::Scalar(slot) => slot.value.clone(),
            EntryValue::Record(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, slot)| (k.clone(), slot.value.clone()))
                    .collect(),
            ),
        })
    }
}

/// A replicable mutation: the merged entry state for one `(map, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub map: String,
    pub key: String,
    pub entry: Entry,
}

/// A batch of ops tagged with the connection it arrived on.
///
/// `origin` is [`LOCAL_ORIGIN`] for local mutations; the sync layer tags
/// remote batches with its connection id so relays can skip the source.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub origin: u64,
    pub ops: Arc<Vec<Op>>,
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// A map-granularity change notification.
#[derive(Debug, Clone)]
pub struct DocEvent {
    pub map: String,
    pub origin: ChangeOrigin,
}

struct Inner {
    maps: BTreeMap<String, BTreeMap<String, Entry>>,
    counter: u64,
}

/// Shared handle to the replicated document.
///
/// Cloning is cheap and every clone observes the same state. All reads
/// materialize plain JSON so callers never see clocks or tombstones.
#[derive(Clone)]
pub struct Document {
    inner: Arc<RwLock<Inner>>,
    actor: String,
    changes: broadcast::Sender<DocEvent>,
    updates: broadcast::Sender<UpdateBatch>,
}

impl Document {
    /// Create an empty document owned by `actor` (the local node id).
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                maps: BTreeMap::new(),
                counter: 0,
            })),
            actor: actor.into(),
            changes,
            updates,
        }
    }

    /// The local actor id stamped on this document's writes.
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    // ── Observation ──────────────────────────────────────────

    /// Subscribe to map-granularity change notifications.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DocEvent> {
        self.changes.subscribe()
    }

    /// Subscribe to replicable update batches (for the sync transport).
    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<UpdateBatch> {
        self.updates.subscribe()
    }

    // ── Reads ────────────────────────────────────────────────

    /// Materialized value for `key` in `map`.
    #[must_use]
    pub fn get(&self, map: &str, key: &str) -> Option<Value> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner.maps.get(map)?.get(key)?.materialize()
    }

    /// Materialized and deserialized value for `key` in `map`.
    #[must_use]
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, map: &str, key: &str) -> Option<T> {
        serde_json::from_value(self.get(map, key)?).ok()
    }

    /// All live `(key, value)` pairs of a map, key-sorted.
    #[must_use]
    pub fn entries(&self, map: &str) -> Vec<(String, Value)> {
        let inner = self.inner.read().expect("state lock poisoned");
        let Some(m) = inner.maps.get(map) else {
            return Vec::new();
        };
        m.iter()
            .filter_map(|(k, e)| e.materialize().map(|v| (k.clone(), v)))
            .collect()
    }

    /// All live entries of a map deserialized to `T`, skipping any record
    /// that does not parse (dead state is ignored, not fatal).
    #[must_use]
    pub fn entries_as<T: serde::de::DeserializeOwned>(&self, map: &str) -> Vec<(String, T)> {
        self.entries(map)
            .into_iter()
            .filter_map(|(k, v)| serde_json::from_value(v).ok().map(|t| (k, t)))
            .collect()
    }

    /// Number of live entries in a map.
    #[must_use]
    pub fn len(&self, map: &str) -> usize {
        let inner = self.inner.read().expect("state lock poisoned");
        inner
            .maps
            .get(map)
            .map_or(0, |m| m.values().filter(|e| e.is_live()).count())
    }

    /// Whether a map has no live entries.
    #[must_use]
    pub fn is_empty(&self, map: &str) -> bool {
        self.len(map) == 0
    }

    /// Whether `key` is live in `map`.
    #[must_use]
    pub fn contains(&self, map: &str, key: &str) -> bool {
        self.get(map, key).is_some()
    }

    // ── Writes ───────────────────────────────────────────────

    /// Insert (or replace) a record at `key`.
    ///
    /// Object values become per-field records; anything else becomes a
    /// whole-value register. Every written field gets a fresh clock.
    pub fn insert<T: Serialize>(&self, map: &str, key: &str, value: &T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.insert_value(map, key, value);
    }

    /// Insert (or replace) a raw JSON value at `key`.
    pub fn insert_value(&self, map: &str, key: &str, value: Value) {
        let op = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let clock = next_clock(&mut inner, &self.actor);
            let entry_value = match value {
                Value::Object(obj) => EntryValue::Record(
                    obj.into_iter()
                        .map(|(k, v)| {
                            (
                                k,
                                FieldSlot {
                                    value: v,
                                    clock: clock.clone(),
                                },
                            )
                        })
                        .collect(),
                ),
                other => EntryValue::Scalar(FieldSlot {
                    value: other,
                    clock: clock.clone(),
                }),
            };
            let entry = Entry {
                value: entry_value,
                tombstone: existing_tombstone(&inner, map, key),
            };
            store_entry(&mut inner, map, key, entry)
        };
        self.publish_local(map, vec![op]);
    }

    /// Mutate a single field of a record entry in place.
    ///
    /// This is the pulse write path: repeated heartbeats touch one field
    /// register instead of replacing the whole record, so no tombstones
    /// accumulate. A scalar object entry written by an older peer is
    /// converted to a record first, keeping its clock on untouched fields.
    pub fn set_field(&self, map: &str, key: &str, field: &str, value: Value) {
        let op = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let clock = next_clock(&mut inner, &self.actor);
            let tombstone = existing_tombstone(&inner, map, key);
            let mut fields = match inner
                .maps
                .get(map)
                .and_then(|m| m.get(key))
                .map(|e| e.value.clone())
            {
                Some(EntryValue::Record(fields)) => fields,
                Some(EntryValue::Scalar(slot)) => scalar_to_fields(slot),
                None => BTreeMap::new(),
            };
            fields.insert(
                field.to_string(),
                FieldSlot {
                    value,
                    clock: clock.clone(),
                },
            );
            let entry = Entry {
                value: EntryValue::Record(fields),
                tombstone,
            };
            store_entry(&mut inner, map, key, entry)
        };
        self.publish_local(map, vec![op]);
    }

    /// Delete `key` from `map` (tombstone; a later write resurrects it).
    pub fn remove(&self, map: &str, key: &str) {
        let op = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let clock = next_clock(&mut inner, &self.actor);
            let Some(existing) = inner.maps.get(map).and_then(|m| m.get(key)).cloned() else {
                return;
            };
            let entry = Entry {
                value: existing.value,
                tombstone: Some(clock),
            };
            store_entry(&mut inner, map, key, entry)
        };
        self.publish_local(map, vec![op]);
    }

    // ── Replication ──────────────────────────────────────────

    /// Merge a batch of remote ops into the document.
    ///
    /// Only ops that changed local state are re-published (tagged with
    /// `origin`), which is what terminates relay cycles between hubs.
    /// Returns the maps that changed.
    pub fn apply_ops(&self, ops: &[Op], origin: u64) -> Vec<String> {
        let (changed_ops, changed_maps) = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let mut changed_ops = Vec::new();
            let mut changed_maps = Vec::new();
            for op in ops {
                raise_counter(&mut inner, &op.entry);
                let slot = inner
                    .maps
                    .entry(op.map.clone())
                    .or_default()
                    .entry(op.key.clone());
                let merged = match slot {
                    std::collections::btree_map::Entry::Occupied(mut occupied) => {
                        let merged = merge_entries(occupied.get(), &op.entry);
                        if merged == *occupied.get() {
                            continue;
                        }
                        occupied.insert(merged.clone());
                        merged
                    },
                    std::collections::btree_map::Entry::Vacant(vacant) => {
                        vacant.insert(op.entry.clone()).clone()
                    },
                };
                if !changed_maps.contains(&op.map) {
                    changed_maps.push(op.map.clone());
                }
                changed_ops.push(Op {
                    map: op.map.clone(),
                    key: op.key.clone(),
                    entry: merged,
                });
            }
            (changed_ops, changed_maps)
        };

        if !changed_ops.is_empty() {
            trace!(ops = changed_ops.len(), origin, "merged remote update");
            let _ = self.updates.send(UpdateBatch {
                origin,
                ops: Arc::new(changed_ops),
            });
            for map in &changed_maps {
                let _ = self.changes.send(DocEvent {
                    map: map.clone(),
                    origin: ChangeOrigin::Remote,
                });
            }
        }
        changed_maps
    }

    /// Decode and merge an encoded remote update.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Decode`] for a corrupt payload; nothing is
    /// applied in that case.
    pub fn apply_encoded_update(&self, bytes: &[u8], origin: u64) -> StateResult<Vec<String>> {
        let ops: Vec<Op> = rmp_serde::from_slice(bytes).map_err(StateError::Decode)?;
        Ok(self.apply_ops(&ops, origin))
    }

    /// Export every entry (tombstones included) as ops.
    #[must_use]
    pub fn export_ops(&self) -> Vec<Op> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner
            .maps
            .iter()
            .flat_map(|(map, entries)| {
                entries.iter().map(|(key, entry)| Op {
                    map: map.clone(),
                    key: key.clone(),
                    entry: entry.clone(),
                })
            })
            .collect()
    }

    /// Encode the full document state (tombstones included).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Encode`] if serialization fails.
    pub fn encode_state(&self) -> StateResult<Vec<u8>> {
        rmp_serde::to_vec_named(&self.export_ops()).map_err(StateError::Encode)
    }

    /// Compacted encoding: only live entries, re-encoded as if written into
    /// an empty document. Sheds every tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Encode`] if serialization fails.
    pub fn compact(&self) -> StateResult<Vec<u8>> {
        let live: Vec<Op> = {
            let inner = self.inner.read().expect("state lock poisoned");
            inner
                .maps
                .iter()
                .flat_map(|(map, entries)| {
                    entries
                        .iter()
                        .filter(|(_, e)| e.is_live())
                        .map(|(key, entry)| Op {
                            map: map.clone(),
                            key: key.clone(),
                            entry: Entry {
                                value: entry.value.clone(),
                                tombstone: None,
                            },
                        })
                })
                .collect()
        };
        rmp_serde::to_vec_named(&live).map_err(StateError::Encode)
    }

    /// Decode an encoded state and merge it in (hydration and sync both
    /// land here).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Decode`] for a corrupt payload.
    pub fn apply_encoded_state(&self, bytes: &[u8], origin: u64) -> StateResult<Vec<String>> {
        self.apply_encoded_update(bytes, origin)
    }

    /// Materialized view of a whole map, for equivalence comparisons.
    #[must_use]
    pub fn materialized(&self, map: &str) -> BTreeMap<String, Value> {
        self.entries(map).into_iter().collect()
    }

    fn publish_local(&self, map: &str, ops: Vec<Op>) {
        let _ = self.updates.send(UpdateBatch {
            origin: LOCAL_ORIGIN,
            ops: Arc::new(ops),
        });
        let _ = self.changes.send(DocEvent {
            map: map.to_string(),
            origin: ChangeOrigin::Local,
        });
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

// ── Merge helpers ────────────────────────────────────────────

fn next_clock(inner: &mut Inner, actor: &str) -> Clock {
    inner.counter = inner.counter.saturating_add(1);
    Clock::new(ansible_core::now_ms(), inner.counter, actor)
}

fn existing_tombstone(inner: &Inner, map: &str, key: &str) -> Option<Clock> {
    inner
        .maps
        .get(map)
        .and_then(|m| m.get(key))
        .and_then(|e| e.tombstone.clone())
}

fn store_entry(inner: &mut Inner, map: &str, key: &str, entry: Entry) -> Op {
    inner
        .maps
        .entry(map.to_string())
        .or_default()
        .insert(key.to_string(), entry.clone());
    Op {
        map: map.to_string(),
        key: key.to_string(),
        entry,
    }
}

fn raise_counter(inner: &mut Inner, entry: &Entry) {
    let incoming = match &entry.value {
        EntryValue::Scalar(slot) => slot.clock.counter,
        EntryValue::Record(fields) => fields.values().map(|s| s.clock.counter).max().unwrap_or(0),
    };
    let incoming = incoming.max(entry.tombstone.as_ref().map_or(0, |t| t.counter));
    inner.counter = inner.counter.max(incoming);
}

fn scalar_to_fields(slot: FieldSlot) -> BTreeMap<String, FieldSlot> {
    match slot.value {
        Value::Object(obj) => obj
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    FieldSlot {
                        value: v,
                        clock: slot.clock.clone(),
                    },
                )
            })
            .collect(),
        other => {
            // Non-object scalars keep their value under a synthetic field;
            // in practice only record-shaped values reach this path.
            let mut fields = BTreeMap::new();
            fields.insert(
                "value".to_string(),
                FieldSlot {
                    value: other,
                    clock: slot.clock,
                },
            );
            fields
        },
    }
}

/// Merge two entry states; commutative, associative, idempotent.
fn merge_entries(local: &Entry, incoming: &Entry) -> Entry {
    let tombstone = match (&local.tombstone, &incoming.tombstone) {
        (Some(a), Some(b)) => Some(a.clone().max(b.clone())),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    };
    let value = merge_values(&local.value, &incoming.value);
    Entry { value, tombstone }
}

fn merge_values(local: &EntryValue, incoming: &EntryValue) -> EntryValue {
    match (local, incoming) {
        (EntryValue::Scalar(a), EntryValue::Scalar(b)) => {
            EntryValue::Scalar(if b.clock > a.clock { b.clone() } else { a.clone() })
        },
        (EntryValue::Record(a), EntryValue::Record(b)) => {
            let mut merged = a.clone();
            for (field, slot) in b {
                match merged.get_mut(field) {
                    None => {
                        merged.insert(field.clone(), slot.clone());
                    },
                    Some(existing) => {
                        if UNION_FIELDS.contains(&field.as_str()) {
                            *existing = union_slots(existing, slot);
                        } else if slot.clock > existing.clock {
                            *existing = slot.clone();
                        }
                    },
                }
            }
            EntryValue::Record(merged)
        },
        // Shape conflict: the side written later wins wholesale.
        (a, b) => {
            let a_clock = a.max_clock();
            let b_clock = b.max_clock();
            if b_clock > a_clock { b.clone() } else { a.clone() }
        },
    }
}

/// Union two array registers, preserving first-seen order.
fn union_slots(a: &FieldSlot, b: &FieldSlot) -> FieldSlot {
    let mut items: Vec<Value> = match &a.value {
        Value::Array(v) => v.clone(),
        other => vec![other.clone()],
    };
    if let Value::Array(bv) = &b.value {
        for item in bv {
            if !items.contains(item) {
                items.push(item.clone());
            }
        }
    }
    FieldSlot {
        value: Value::Array(items),
        clock: a.clock.clone().max(b.clock.clone()),
    }
}
