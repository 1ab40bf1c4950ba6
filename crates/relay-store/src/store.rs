//! The normalized store.
//!
//! [`Store`] owns the canonical [`RecordSource`], an optional optimistic
//! overlay on top of it, and the bookkeeping that drives reads:
//!
//! - subscriptions, re-read on `notify` when a write touches a record they saw
//! - retained operations, the roots of garbage collection
//! - record and store invalidation, consulted by `check`
//!
//! The store is single-threaded. A `Store` value is a cheap handle; clones
//! share state. Callbacks run after the store has released its internal
//! borrow, so they may call back into the store. Publishes and notifies made
//! from inside a callback are queued and applied once the current notify
//! cycle has invoked every callback.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use relay_core::selection::OperationKind;
use relay_core::{DataId, OperationDescriptor, Record, RequestIdentifier, SingularReaderSelector};

use crate::checker;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::gc::{GarbageCollector, GcProgress};
use crate::reader::{self, Snapshot, TypeMembership};
use crate::source::{layered_record, OverlayView, RecordLookup, RecordSource, RecordState};
use crate::subscriptions::{
    Disposable, InvalidationState, InvalidationSubscription, Registry, Subscription,
};

/// Result of [`Store::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationAvailability {
    /// Everything is present; `fetch_time` is when the operation's data was
    /// last written, in milliseconds since the Unix epoch.
    Available { fetch_time: Option<u64> },
    /// Everything is present but older than the configured cache TTL.
    Stale,
    /// Some data is unfetched or invalidated.
    Missing,
}

struct RootEntry {
    operation: OperationDescriptor,
    refcount: usize,
    /// Write epoch of the last notify for this operation.
    epoch: Option<u64>,
    fetch_time: Option<u64>,
}

enum Deferred {
    Publish {
        source: RecordSource,
        invalidated: Vec<DataId>,
    },
    Notify {
        source_operation: Option<OperationDescriptor>,
        invalidate_store: bool,
    },
}

type Clock = Box<dyn Fn() -> u64>;

struct StoreInner {
    config: StoreConfig,
    source: RecordSource,
    optimistic: Option<RecordSource>,
    membership: Option<TypeMembership>,
    updated_ids: HashSet<DataId>,
    invalidated_ids: HashSet<DataId>,
    subscriptions: Registry<Subscription>,
    invalidation_subscriptions: Registry<InvalidationSubscription>,
    roots: HashMap<RequestIdentifier, RootEntry>,
    release_buffer: VecDeque<RequestIdentifier>,
    write_epoch: u64,
    global_invalidation_epoch: Option<u64>,
    gc: GarbageCollector,
    gc_holds: usize,
    gc_scheduled: bool,
    notifying: bool,
    deferred: Vec<Deferred>,
    clock: Clock,
}

/// A shared handle to a normalized record store.
#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<StoreInner>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Store")
            .field("records", &inner.source.len())
            .field("optimistic", &inner.optimistic.is_some())
            .field("subscriptions", &inner.subscriptions.len())
            .field("roots", &inner.roots.len())
            .field("write_epoch", &inner.write_epoch)
            .finish()
    }
}

fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl StoreInner {
    fn view(&self) -> OverlayView<'_> {
        OverlayView::new(&self.source, self.optimistic.as_ref())
    }

    fn root_selectors(&self) -> Vec<relay_core::NormalizationSelector> {
        self.roots.values().map(|entry| entry.operation.root.clone()).collect()
    }

    fn schedule_gc(&mut self) {
        self.gc_scheduled = true;
        if self.gc_holds == 0 && !self.gc.is_running() {
            let roots = self.root_selectors();
            self.gc.start(&roots, self.write_epoch);
        }
    }

    /// Merges `delta` into the overlay (in optimistic mode) or the base.
    /// Nothing is written when any record fails to merge.
    fn publish(&mut self, delta: &RecordSource, invalidated: &[DataId]) -> Result<(), StoreError> {
        enum Write {
            Set(Record),
            Delete(DataId),
        }

        let mut writes = Vec::new();
        {
            let view = self.view();
            for id in delta.record_ids() {
                match delta.get(&id) {
                    None => {
                        if view.record_status(&id) != RecordState::Nonexistent {
                            writes.push(Write::Delete(id));
                        }
                    }
                    Some(next) => match view.record(&id) {
                        Some(current) => {
                            if let (Some(old), Some(new)) = (current.typename(), next.typename()) {
                                if old != new {
                                    tracing::warn!(record = %id, old, new, "record typename changed");
                                }
                            }
                            if let Some(merged) = current.update(next)? {
                                writes.push(Write::Set(merged));
                            }
                        }
                        None => writes.push(Write::Set(next.clone())),
                    },
                }
            }
        }

        let target = match &mut self.optimistic {
            Some(overlay) => overlay,
            None => &mut self.source,
        };
        let changed = !writes.is_empty() || !invalidated.is_empty();
        for write in writes {
            match write {
                Write::Set(record) => {
                    self.updated_ids.insert(record.id().clone());
                    target.set(record);
                }
                Write::Delete(id) => {
                    target.delete(&id);
                    self.updated_ids.insert(id);
                }
            }
        }
        if !changed {
            return Ok(());
        }
        self.write_epoch += 1;

        for id in invalidated {
            let record = match &self.optimistic {
                Some(overlay) => layered_record(overlay, &self.source, id).map(|r| r.into_owned()),
                None => self.source.get(id).cloned(),
            };
            let Some(mut record) = record else {
                continue;
            };
            record.set_invalidated_at(self.write_epoch);
            match &mut self.optimistic {
                Some(overlay) => overlay.set(record),
                None => self.source.set(record),
            }
            self.updated_ids.insert(id.clone());
            self.invalidated_ids.insert(id.clone());
        }
        tracing::debug!(
            epoch = self.write_epoch,
            updated = self.updated_ids.len(),
            optimistic = self.optimistic.is_some(),
            "published records"
        );
        Ok(())
    }

    fn record_write(&mut self, operation: &OperationDescriptor) {
        let now = (self.clock)();
        let identifier = operation.identifier().clone();
        if let Some(entry) = self.roots.get_mut(&identifier) {
            entry.epoch = Some(self.write_epoch);
            entry.fetch_time = Some(now);
            return;
        }
        // Unretained queries are kept in the release buffer while there is room.
        let buffer_size = self.config.gc_release_buffer_size;
        if operation.request.node.params.operation_kind == OperationKind::Query
            && buffer_size > 0
            && self.release_buffer.len() < buffer_size
        {
            self.roots.insert(
                identifier.clone(),
                RootEntry {
                    operation: operation.clone(),
                    refcount: 0,
                    epoch: Some(self.write_epoch),
                    fetch_time: Some(now),
                },
            );
            self.release_buffer.push_back(identifier);
        }
    }

    fn invalidation_state(&self, ids: &[DataId]) -> InvalidationState {
        let view = self.view();
        InvalidationState {
            data_ids: ids.to_vec(),
            invalidations: ids
                .iter()
                .map(|id| (id.clone(), view.record(id).and_then(|r| r.invalidated_at())))
                .collect(),
            global_invalidation_epoch: self.global_invalidation_epoch,
        }
    }

    fn release(&mut self, identifier: &RequestIdentifier) -> Result<(), StoreError> {
        let entry = match self.roots.get_mut(identifier) {
            Some(entry) if entry.refcount > 0 => entry,
            _ => return Err(StoreError::RetainUnderflow(identifier.clone())),
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(());
        }
        let buffer_size = self.config.gc_release_buffer_size;
        if buffer_size == 0 {
            self.roots.remove(identifier);
            self.schedule_gc();
            return Ok(());
        }
        self.release_buffer.push_back(identifier.clone());
        let mut evicted = false;
        while self.release_buffer.len() > buffer_size {
            if let Some(oldest) = self.release_buffer.pop_front() {
                if self.roots.get(&oldest).is_some_and(|e| e.refcount == 0) {
                    self.roots.remove(&oldest);
                    evicted = true;
                }
            }
        }
        if evicted {
            self.schedule_gc();
        }
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new(RecordSource::new(), StoreConfig::default())
    }
}

impl Store {
    pub fn new(source: RecordSource, config: StoreConfig) -> Self {
        Self::with_clock(source, config, system_clock)
    }

    /// A store whose fetch times come from `clock` (milliseconds).
    pub fn with_clock(source: RecordSource, config: StoreConfig, clock: impl Fn() -> u64 + 'static) -> Self {
        let inner = StoreInner {
            config,
            source,
            optimistic: None,
            membership: None,
            updated_ids: HashSet::new(),
            invalidated_ids: HashSet::new(),
            subscriptions: Registry::default(),
            invalidation_subscriptions: Registry::default(),
            roots: HashMap::new(),
            release_buffer: VecDeque::new(),
            write_epoch: 0,
            global_invalidation_epoch: None,
            gc: GarbageCollector::new(),
            gc_holds: 0,
            gc_scheduled: false,
            notifying: false,
            deferred: Vec::new(),
            clock: Box::new(clock),
        };
        Store {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    fn weak(&self) -> Weak<RefCell<StoreInner>> {
        Rc::downgrade(&self.inner)
    }

    pub fn config(&self) -> StoreConfig {
        self.inner.borrow().config.clone()
    }

    /// Supplemental abstract-type membership used by reads.
    pub fn set_type_membership(&self, membership: Option<TypeMembership>) {
        self.inner.borrow_mut().membership = membership;
    }

    /// A copy of the canonical source, without optimistic changes.
    pub fn get_source(&self) -> RecordSource {
        self.inner.borrow_mut().source.fork()
    }

    /// A copy of the visible source, optimistic changes included.
    pub fn fork_source(&self) -> RecordSource {
        let mut inner = self.inner.borrow_mut();
        let mut forked = inner.source.fork();
        if let Some(overlay) = &inner.optimistic {
            for id in overlay.record_ids() {
                match layered_record(overlay, &inner.source, &id) {
                    Some(record) => forked.set(record.into_owned()),
                    None => forked.delete(&id),
                }
            }
        }
        forked
    }

    /// The canonical source in its persisted JSON form.
    pub fn to_json(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(&self.inner.borrow().source)?)
    }

    pub fn current_write_epoch(&self) -> u64 {
        self.inner.borrow().write_epoch
    }

    pub fn is_optimistic(&self) -> bool {
        self.inner.borrow().optimistic.is_some()
    }

    // ---- Reads ----

    pub fn lookup(&self, selector: &SingularReaderSelector) -> Snapshot {
        let inner = self.inner.borrow();
        reader::read_with_membership(&inner.view(), selector, inner.membership.as_ref())
    }

    /// Availability of `operation`'s data, accounting for invalidation and
    /// the query cache TTL.
    pub fn check(&self, operation: &OperationDescriptor) -> OperationAvailability {
        let inner = self.inner.borrow();
        let root = inner.roots.get(operation.identifier());
        let last_write = root.and_then(|r| r.epoch);
        let fetch_time = root.and_then(|r| r.fetch_time);

        if let Some(global) = inner.global_invalidation_epoch {
            if last_write.map_or(true, |written| written <= global) {
                return OperationAvailability::Missing;
            }
        }
        let result = checker::check(&inner.view(), &operation.root);
        // Without a recorded write, any invalidation in the closure counts.
        if let Some(invalidated) = result.most_recent_invalidation {
            if last_write.map_or(true, |written| invalidated >= written) {
                return OperationAvailability::Missing;
            }
        }
        if !result.is_available {
            return OperationAvailability::Missing;
        }
        if let (Some(ttl), Some(fetched)) = (inner.config.query_cache_expiration_ms, fetch_time) {
            if (inner.clock)().saturating_sub(fetched) >= ttl {
                return OperationAvailability::Stale;
            }
        }
        OperationAvailability::Available { fetch_time }
    }

    // ---- Writes ----

    /// Merges `source` into the store field by field and marks
    /// `invalidated` records as invalidated at the resulting write epoch.
    ///
    /// Subscribers are not called until [`Store::notify`].
    pub fn publish(&self, source: &RecordSource, invalidated: &[DataId]) -> Result<(), StoreError> {
        let mut inner = self.inner.borrow_mut();
        if inner.notifying {
            inner.deferred.push(Deferred::Publish {
                source: source.clone(),
                invalidated: invalidated.to_vec(),
            });
            return Ok(());
        }
        inner.publish(source, invalidated)
    }

    /// Re-reads every subscription that saw a record written since the last
    /// notify and calls back those whose result changed. Returns the
    /// selectors whose callbacks were due.
    ///
    /// `source_operation` records the write epoch and fetch time used by
    /// [`Store::check`]; `invalidate_store` invalidates every record.
    pub fn notify(
        &self,
        source_operation: Option<&OperationDescriptor>,
        invalidate_store: bool,
    ) -> Vec<SingularReaderSelector> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.notifying {
                inner.deferred.push(Deferred::Notify {
                    source_operation: source_operation.cloned(),
                    invalidate_store,
                });
                return Vec::new();
            }
        }

        let mut affected = Vec::new();
        let mut queue = VecDeque::from([(source_operation.cloned(), invalidate_store)]);
        while let Some((operation, invalidate)) = queue.pop_front() {
            self.notify_cycle(operation.as_ref(), invalidate, &mut affected);
            let deferred = {
                let mut inner = self.inner.borrow_mut();
                inner.notifying = false;
                std::mem::take(&mut inner.deferred)
            };
            for item in deferred {
                match item {
                    Deferred::Publish { source, invalidated } => {
                        if let Err(err) = self.publish(&source, &invalidated) {
                            tracing::error!(error = %err, "deferred publish failed");
                        }
                    }
                    Deferred::Notify {
                        source_operation,
                        invalidate_store,
                    } => queue.push_back((source_operation, invalidate_store)),
                }
            }
        }
        affected
    }

    fn notify_cycle(
        &self,
        source_operation: Option<&OperationDescriptor>,
        invalidate_store: bool,
        affected: &mut Vec<SingularReaderSelector>,
    ) {
        let mut snapshot_calls = Vec::new();
        let mut invalidation_calls = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            inner.notifying = true;
            if invalidate_store {
                inner.write_epoch += 1;
                inner.global_invalidation_epoch = Some(inner.write_epoch);
            }
            if let Some(operation) = source_operation {
                inner.record_write(operation);
            }

            let updated = std::mem::take(&mut inner.updated_ids);
            let invalidated = std::mem::take(&mut inner.invalidated_ids);
            let view = OverlayView::new(&inner.source, inner.optimistic.as_ref());

            // Phase one: recompute everything before any callback runs.
            if !updated.is_empty() {
                for (id, subscription) in inner.subscriptions.iter_mut() {
                    let touched = subscription
                        .snapshot
                        .seen_records
                        .iter()
                        .any(|seen| updated.contains(seen));
                    if !touched {
                        continue;
                    }
                    let next = reader::read_with_membership(
                        &view,
                        &subscription.snapshot.selector,
                        inner.membership.as_ref(),
                    );
                    let changed = !next.same_result(&subscription.snapshot);
                    // seen_records may grow even when the data is unchanged.
                    subscription.snapshot = next;
                    if changed {
                        snapshot_calls.push((id, subscription.callback.clone(), subscription.snapshot.clone()));
                    }
                }
            }

            if invalidate_store || !invalidated.is_empty() {
                let global = inner.global_invalidation_epoch;
                for (id, subscription) in inner.invalidation_subscriptions.iter_mut() {
                    let current = InvalidationState {
                        data_ids: subscription.state.data_ids.clone(),
                        invalidations: subscription
                            .state
                            .data_ids
                            .iter()
                            .map(|data_id| (data_id.clone(), view.record(data_id).and_then(|r| r.invalidated_at())))
                            .collect(),
                        global_invalidation_epoch: global,
                    };
                    if subscription.state.is_invalidated_by(&current) {
                        subscription.state = current;
                        invalidation_calls.push((id, subscription.callback.clone()));
                    }
                }
            }
            tracing::debug!(
                updated = updated.len(),
                callbacks = snapshot_calls.len() + invalidation_calls.len(),
                "notify"
            );
        }

        // Phase two: callbacks run with the store unborrowed.
        for (id, callback, snapshot) in snapshot_calls {
            affected.push(snapshot.selector.clone());
            if !self.inner.borrow().subscriptions.contains(id) {
                continue;
            }
            if let Ok(mut callback) = callback.try_borrow_mut() {
                (&mut *callback)(&snapshot);
            }
        }
        for (id, callback) in invalidation_calls {
            if !self.inner.borrow().invalidation_subscriptions.contains(id) {
                continue;
            }
            if let Ok(mut callback) = callback.try_borrow_mut() {
                (&mut *callback)();
            }
        }
    }

    // ---- Subscriptions ----

    /// Calls `callback` with the new snapshot whenever a notify changes the
    /// result of `snapshot`'s selector.
    pub fn subscribe(&self, snapshot: Snapshot, callback: impl FnMut(&Snapshot) + 'static) -> Disposable {
        let id = self.inner.borrow_mut().subscriptions.insert(Subscription {
            snapshot,
            callback: Rc::new(RefCell::new(callback)),
        });
        let store = self.weak();
        Disposable::new(move || {
            if let Some(inner) = store.upgrade() {
                inner.borrow_mut().subscriptions.remove(id);
            }
        })
    }

    // ---- Retain & GC ----

    /// Keeps `operation`'s data alive until the returned handle is disposed.
    pub fn retain(&self, operation: &OperationDescriptor) -> Disposable {
        let identifier = operation.identifier().clone();
        {
            let mut inner = self.inner.borrow_mut();
            inner.release_buffer.retain(|id| id != &identifier);
            inner
                .roots
                .entry(identifier.clone())
                .or_insert_with(|| RootEntry {
                    operation: operation.clone(),
                    refcount: 0,
                    epoch: None,
                    fetch_time: None,
                })
                .refcount += 1;
            // A cycle in flight marked from the old roots; restart it so the
            // new root's records are marked before any sweep.
            if inner.gc.is_running() {
                tracing::debug!("gc restarted after a retain");
                let roots = inner.root_selectors();
                let epoch = inner.write_epoch;
                inner.gc.start(&roots, epoch);
            }
        }
        let store = self.weak();
        Disposable::new(move || {
            if let Some(inner) = store.upgrade() {
                if let Err(err) = inner.borrow_mut().release(&identifier) {
                    tracing::error!(error = %err, "release failed");
                }
            }
        })
    }

    /// Drops one retain of `identifier`.
    pub fn release(&self, identifier: &RequestIdentifier) -> Result<(), StoreError> {
        self.inner.borrow_mut().release(identifier)
    }

    /// Retain count of an operation, zero when it is only buffered or unknown.
    pub fn retain_count(&self, identifier: &RequestIdentifier) -> usize {
        self.inner.borrow().roots.get(identifier).map_or(0, |e| e.refcount)
    }

    /// Starts a collection cycle, run by [`Store::run_gc_slice`].
    pub fn schedule_gc(&self) {
        self.inner.borrow_mut().schedule_gc();
    }

    /// Advances a scheduled collection by one budgeted slice.
    pub fn run_gc_slice(&self) -> GcProgress {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        if inner.gc_holds > 0 {
            return GcProgress::Idle;
        }
        if !inner.gc.is_running() {
            if !inner.gc_scheduled {
                return GcProgress::Idle;
            }
            let roots = inner.root_selectors();
            inner.gc.start(&roots, inner.write_epoch);
        }
        let budget = inner.config.gc_slice_budget;
        match inner.gc.step(&mut inner.source, inner.write_epoch, budget) {
            GcProgress::Interrupted => {
                tracing::debug!("gc restarted after a write");
                let roots = inner.root_selectors();
                inner.gc.start(&roots, inner.write_epoch);
                GcProgress::Pending
            }
            GcProgress::Finished { collected } => {
                inner.gc_scheduled = false;
                GcProgress::Finished { collected }
            }
            progress => progress,
        }
    }

    /// Runs a full collection now. Returns the number of removed records,
    /// or `None` when collection is held (it is then scheduled instead).
    pub fn garbage_collect(&self) -> Option<usize> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        if inner.gc_holds > 0 {
            tracing::debug!("gc held; scheduling instead");
            inner.gc_scheduled = true;
            return None;
        }
        let roots = inner.root_selectors();
        inner.gc.start(&roots, inner.write_epoch);
        loop {
            match inner.gc.step(&mut inner.source, inner.write_epoch, usize::MAX) {
                GcProgress::Finished { collected } => {
                    inner.gc_scheduled = false;
                    return Some(collected);
                }
                GcProgress::Pending => {}
                GcProgress::Idle | GcProgress::Interrupted => return Some(0),
            }
        }
    }

    /// Pauses garbage collection until the handle is disposed.
    pub fn hold_gc(&self) -> Disposable {
        {
            let mut inner = self.inner.borrow_mut();
            inner.gc_holds += 1;
            inner.gc.cancel();
        }
        let store = self.weak();
        Disposable::new(move || {
            if let Some(inner) = store.upgrade() {
                let mut inner = inner.borrow_mut();
                inner.gc_holds = inner.gc_holds.saturating_sub(1);
                if inner.gc_holds == 0 && inner.gc_scheduled {
                    inner.schedule_gc();
                }
            }
        })
    }

    // ---- Optimistic overlay ----

    /// Enters optimistic mode: later publishes land in an overlay that
    /// [`Store::restore`] discards.
    pub fn snapshot(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.optimistic.is_some() {
            tracing::warn!("store is already in optimistic mode");
            return;
        }
        inner.optimistic = Some(RecordSource::new());
    }

    /// Drops the optimistic overlay; every record it touched is marked
    /// updated for the next notify.
    pub fn restore(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(overlay) = inner.optimistic.take() {
            let ids = overlay.record_ids();
            inner.updated_ids.extend(ids);
        }
    }

    // ---- Invalidation ----

    pub fn lookup_invalidation_state(&self, ids: &[DataId]) -> InvalidationState {
        self.inner.borrow().invalidation_state(ids)
    }

    /// True when any of `previous`'s records (or the whole store) was
    /// invalidated since `previous` was taken.
    pub fn check_invalidation_state(&self, previous: &InvalidationState) -> bool {
        let current = self.inner.borrow().invalidation_state(&previous.data_ids);
        previous.is_invalidated_by(&current)
    }

    /// Calls `callback` on notify whenever one of `state`'s records is
    /// invalidated.
    pub fn subscribe_to_invalidation_state(
        &self,
        state: InvalidationState,
        callback: impl FnMut() + 'static,
    ) -> Disposable {
        let id = self
            .inner
            .borrow_mut()
            .invalidation_subscriptions
            .insert(InvalidationSubscription {
                state,
                callback: Rc::new(RefCell::new(callback)),
            });
        let store = self.weak();
        Disposable::new(move || {
            if let Some(inner) = store.upgrade() {
                inner.borrow_mut().invalidation_subscriptions.remove(id);
            }
        })
    }
}
