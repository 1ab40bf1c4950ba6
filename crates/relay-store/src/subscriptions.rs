//! Subscription bookkeeping shared by the store.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use relay_core::DataId;

use crate::reader::Snapshot;

/// Handle returned by `subscribe`, `retain` and `hold_gc`.
///
/// Disposing runs the release action once. Dropping the handle without
/// disposing it leaves the subscription (or retain, or hold) in place.
#[must_use = "the subscription stays active until `dispose` is called"]
pub struct Disposable {
    action: Box<dyn FnOnce()>,
}

impl Disposable {
    pub(crate) fn new(action: impl FnOnce() + 'static) -> Self {
        Disposable {
            action: Box::new(action),
        }
    }

    pub fn dispose(self) {
        (self.action)()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposable")
    }
}

pub(crate) type SnapshotCallback = Rc<RefCell<dyn FnMut(&Snapshot)>>;
pub(crate) type InvalidationCallback = Rc<RefCell<dyn FnMut()>>;

pub(crate) struct Subscription {
    pub snapshot: Snapshot,
    pub callback: SnapshotCallback,
}

pub(crate) struct InvalidationSubscription {
    pub state: InvalidationState,
    pub callback: InvalidationCallback,
}

/// Invalidation epochs of a set of records, as of one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationState {
    pub data_ids: Vec<DataId>,
    /// Invalidation epoch per record (`None`: never invalidated or absent).
    pub invalidations: BTreeMap<DataId, Option<u64>>,
    /// Epoch of the last whole-store invalidation.
    pub global_invalidation_epoch: Option<u64>,
}

impl InvalidationState {
    /// True when `newer` reports an invalidation `self` has not seen.
    pub fn is_invalidated_by(&self, newer: &InvalidationState) -> bool {
        if newer.global_invalidation_epoch != self.global_invalidation_epoch {
            return true;
        }
        self.data_ids
            .iter()
            .any(|id| newer.invalidations.get(id) != self.invalidations.get(id))
    }
}

/// Subscriptions keyed by registration order.
pub(crate) struct Registry<T> {
    next_id: u64,
    entries: BTreeMap<u64, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            next_id: 0,
            entries: BTreeMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn insert(&mut self, entry: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, entry);
        id
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut T)> {
        self.entries.iter_mut().map(|(id, entry)| (*id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
