//! Record sources: the raw storage substrate.
//!
//! [`RecordSource`] maps [`DataId`] to one of three states: a record, a
//! confirmed deletion, or nothing at all (never fetched). Sources are
//! copy-on-write at record granularity:
//!
//! - Writes land in a private layer owned by the instance.
//! - [`RecordSource::fork`] freezes that layer into a shared, immutable
//!   ancestor and returns a second handle onto it, in O(1).
//! - The first write to an inherited record copies only that record.
//!
//! Shared chains are flattened once they grow past [`MAX_LAYER_DEPTH`], so
//! lookups stay bounded.
//!
//! The [`RecordLookup`] trait is the read-only view every traversal takes.
//! Besides plain sources it is implemented by [`OverlayView`], which layers an
//! optimistic source over a base source field by field.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use relay_core::{DataId, Record};

/// Shared layers deeper than this are flattened on the next fork.
pub const MAX_LAYER_DEPTH: usize = 8;

/// Presence of an id in a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// A record is stored for the id.
    Existent,
    /// The id was fetched and is known not to exist.
    Nonexistent,
    /// Nothing is known about the id.
    Unknown,
}

#[derive(Debug, Clone)]
enum Slot {
    Present(Arc<Record>),
    Deleted,
    /// Hides an inherited entry after `remove`.
    Removed,
}

#[derive(Debug)]
struct Layer {
    slots: HashMap<DataId, Slot>,
    parent: Option<Arc<Layer>>,
    depth: usize,
}

/// Read-only access to records, implemented by every source-like view.
pub trait RecordLookup {
    fn record_status(&self, id: &DataId) -> RecordState;

    /// The record for `id`, or `None` when it is deleted or unknown.
    fn record(&self, id: &DataId) -> Option<Cow<'_, Record>>;
}

/// An in-memory, copy-on-write record source.
#[derive(Debug, Clone, Default)]
pub struct RecordSource {
    shared: Option<Arc<Layer>>,
    local: HashMap<DataId, Slot>,
}

impl RecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a source holding exactly `records`.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut source = Self::new();
        for record in records {
            source.set(record);
        }
        source
    }

    fn slot(&self, id: &DataId) -> Option<&Slot> {
        if let Some(slot) = self.local.get(id) {
            return Some(slot);
        }
        self.shared_slot(id)
    }

    fn shared_slot(&self, id: &DataId) -> Option<&Slot> {
        let mut layer = self.shared.as_deref();
        while let Some(current) = layer {
            if let Some(slot) = current.slots.get(id) {
                return Some(slot);
            }
            layer = current.parent.as_deref();
        }
        None
    }

    /// The record for `id`, if one is stored.
    pub fn get(&self, id: &DataId) -> Option<&Record> {
        match self.slot(id) {
            Some(Slot::Present(record)) => Some(record),
            _ => None,
        }
    }

    /// The shared handle of the stored record, for cheap copies between sources.
    pub fn get_shared(&self, id: &DataId) -> Option<Arc<Record>> {
        match self.slot(id) {
            Some(Slot::Present(record)) => Some(Arc::clone(record)),
            _ => None,
        }
    }

    pub fn status(&self, id: &DataId) -> RecordState {
        match self.slot(id) {
            Some(Slot::Present(_)) => RecordState::Existent,
            Some(Slot::Deleted) => RecordState::Nonexistent,
            Some(Slot::Removed) | None => RecordState::Unknown,
        }
    }

    /// True when the id is either stored or known-deleted.
    pub fn has(&self, id: &DataId) -> bool {
        self.status(id) != RecordState::Unknown
    }

    /// Stores `record` under its own id, replacing any previous entry.
    pub fn set(&mut self, record: Record) {
        let id = record.id().clone();
        self.local.insert(id, Slot::Present(Arc::new(record)));
    }

    pub fn set_shared(&mut self, record: Arc<Record>) {
        let id = record.id().clone();
        self.local.insert(id, Slot::Present(record));
    }

    /// Marks `id` as fetched and known not to exist.
    pub fn delete(&mut self, id: &DataId) {
        self.local.insert(id.clone(), Slot::Deleted);
    }

    /// Forgets `id` entirely, returning it to the unknown state.
    pub fn remove(&mut self, id: &DataId) {
        if self.shared_slot(id).is_some() {
            self.local.insert(id.clone(), Slot::Removed);
        } else {
            self.local.remove(id);
        }
    }

    /// Mutable access to a stored record. An inherited record is copied into
    /// the private layer first; no other record is touched.
    pub fn get_mut(&mut self, id: &DataId) -> Option<&mut Record> {
        if !self.local.contains_key(id) {
            let inherited = match self.shared_slot(id) {
                Some(Slot::Present(record)) => Arc::clone(record),
                _ => return None,
            };
            self.local.insert(id.clone(), Slot::Present(inherited));
        }
        match self.local.get_mut(id) {
            Some(Slot::Present(record)) => Some(Arc::make_mut(record)),
            _ => None,
        }
    }

    /// Every id that is stored or known-deleted.
    pub fn record_ids(&self) -> Vec<DataId> {
        let mut seen: HashSet<&DataId> = HashSet::new();
        let mut ids = Vec::new();
        for (id, slot) in &self.local {
            if seen.insert(id) && !matches!(slot, Slot::Removed) {
                ids.push(id.clone());
            }
        }
        let mut layer = self.shared.as_deref();
        while let Some(current) = layer {
            for (id, slot) in &current.slots {
                if seen.insert(id) && !matches!(slot, Slot::Removed) {
                    ids.push(id.clone());
                }
            }
            layer = current.parent.as_deref();
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.record_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        self.shared = None;
        self.local.clear();
    }

    /// Returns an independent source sharing every current record.
    ///
    /// The private layer of `self` is frozen into a shared ancestor, so both
    /// sources start with empty private layers and diverge record by record.
    pub fn fork(&mut self) -> RecordSource {
        if !self.local.is_empty() {
            let parent = self.shared.take();
            let depth = parent.as_ref().map_or(1, |p| p.depth + 1);
            let layer = Layer {
                slots: std::mem::take(&mut self.local),
                parent,
                depth,
            };
            self.shared = Some(Arc::new(layer));
        }
        if self.shared.as_ref().is_some_and(|l| l.depth > MAX_LAYER_DEPTH) {
            self.compact();
        }
        RecordSource {
            shared: self.shared.clone(),
            local: HashMap::new(),
        }
    }

    /// Flattens the shared chain into a single layer.
    fn compact(&mut self) {
        let mut slots: HashMap<DataId, Slot> = HashMap::new();
        let mut layer = self.shared.as_deref();
        while let Some(current) = layer {
            for (id, slot) in &current.slots {
                slots.entry(id.clone()).or_insert_with(|| slot.clone());
            }
            layer = current.parent.as_deref();
        }
        slots.retain(|_, slot| !matches!(slot, Slot::Removed));
        self.shared = Some(Arc::new(Layer {
            slots,
            parent: None,
            depth: 1,
        }));
    }

    /// Copies every entry of `self` onto `target`, replacing whole records.
    pub fn copy_into(&self, target: &mut RecordSource) {
        for id in self.record_ids() {
            match self.slot(&id) {
                Some(Slot::Present(record)) => target.set_shared(Arc::clone(record)),
                Some(Slot::Deleted) => target.delete(&id),
                _ => {}
            }
        }
    }

    /// Entries ordered by id, `None` for known-deleted ids.
    pub fn to_map(&self) -> BTreeMap<DataId, Option<Record>> {
        self.record_ids()
            .into_iter()
            .map(|id| {
                let record = self.get(&id).cloned();
                (id, record)
            })
            .collect()
    }
}

impl PartialEq for RecordSource {
    fn eq(&self, other: &Self) -> bool {
        self.to_map() == other.to_map()
    }
}

impl RecordLookup for RecordSource {
    fn record_status(&self, id: &DataId) -> RecordState {
        self.status(id)
    }

    fn record(&self, id: &DataId) -> Option<Cow<'_, Record>> {
        self.get(id).map(Cow::Borrowed)
    }
}

impl Serialize for RecordSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecordSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<DataId, Option<Record>>::deserialize(deserializer)?;
        let mut source = RecordSource::new();
        for (id, record) in map {
            match record {
                Some(record) if record.id() == &id => source.set(record),
                Some(record) => {
                    return Err(serde::de::Error::custom(format!(
                        "record keyed '{id}' has id '{}'",
                        record.id()
                    )))
                }
                None => source.delete(&id),
            }
        }
        Ok(source)
    }
}

/// Reads `top` over `base`, merging per field where both hold a record.
pub fn layered_record<'a, B: RecordLookup + ?Sized>(
    top: &'a RecordSource,
    base: &'a B,
    id: &DataId,
) -> Option<Cow<'a, Record>> {
    match top.status(id) {
        RecordState::Existent => {
            let upper = top.get(id)?;
            match base.record(id) {
                Some(lower) => {
                    let mut merged = lower.into_owned();
                    merged.copy_fields_from(upper);
                    if let Some(epoch) = upper.invalidated_at() {
                        if merged.invalidated_at() < Some(epoch) {
                            merged.set_invalidated_at(epoch);
                        }
                    }
                    Some(Cow::Owned(merged))
                }
                None => Some(Cow::Borrowed(upper)),
            }
        }
        RecordState::Nonexistent => None,
        RecordState::Unknown => base.record(id),
    }
}

/// Status of `id` when `top` is layered over `base`.
pub fn layered_status<B: RecordLookup + ?Sized>(
    top: &RecordSource,
    base: &B,
    id: &DataId,
) -> RecordState {
    match top.status(id) {
        RecordState::Unknown => base.record_status(id),
        state => state,
    }
}

/// An optimistic overlay read on top of the canonical source.
#[derive(Debug, Clone, Copy)]
pub struct OverlayView<'a> {
    pub base: &'a RecordSource,
    pub overlay: Option<&'a RecordSource>,
}

impl<'a> OverlayView<'a> {
    pub fn new(base: &'a RecordSource, overlay: Option<&'a RecordSource>) -> Self {
        OverlayView { base, overlay }
    }
}

impl RecordLookup for OverlayView<'_> {
    fn record_status(&self, id: &DataId) -> RecordState {
        match self.overlay {
            Some(overlay) => layered_status(overlay, self.base, id),
            None => self.base.status(id),
        }
    }

    fn record(&self, id: &DataId) -> Option<Cow<'_, Record>> {
        match self.overlay {
            Some(overlay) => layered_record(overlay, self.base, id),
            None => self.base.record(id),
        }
    }
}
