//! Ordering of server commits and optimistic updates.
//!
//! Optimistic updates live in the store's overlay. Whenever server data is
//! committed the queue rebases: it discards the overlay, writes the server
//! data to the base, then re-applies every optimistic update still in
//! flight, oldest first. Each [`PublishQueue::run`] ends with exactly one
//! notify, so subscribers never observe the intermediate states.

use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use relay_core::{GraphQLResponse, OperationDescriptor, SingularReaderSelector};

use crate::error::StoreError;
use crate::handlers::{apply_field_payloads, DefaultHandlerProvider, HandlerProvider};
use crate::mutator::{MutationResult, RecordSourceProxy};
use crate::normalizer::{self, IncrementalPlaceholder, NormalizeResult};
use crate::reader;
use crate::source::RecordSource;
use crate::store::Store;
use crate::subscriptions::Disposable;

/// An imperative store update. Payload updaters also receive the response
/// data as read through the operation's fragment.
pub type Updater = Rc<dyn Fn(&RecordSourceProxy, Option<&Value>)>;

/// Identifies an applied (or pending) optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpdateId(u64);

impl UpdateId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A change shown before the server confirms it.
#[derive(Clone)]
pub enum OptimisticUpdate {
    /// An optimistic response for `operation`, normalized on every apply.
    Payload {
        operation: OperationDescriptor,
        response: GraphQLResponse,
        updater: Option<Updater>,
    },
    Updater(Updater),
    Source(RecordSource),
}

impl std::fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimisticUpdate::Payload { operation, .. } => f
                .debug_struct("Payload")
                .field("operation", operation.identifier())
                .finish_non_exhaustive(),
            OptimisticUpdate::Updater(_) => f.write_str("Updater"),
            OptimisticUpdate::Source(source) => f.debug_tuple("Source").field(&source.len()).finish(),
        }
    }
}

enum PendingCommit {
    Payload {
        operation: Option<OperationDescriptor>,
        payload: NormalizeResult,
        updater: Option<Updater>,
    },
    Updater(Updater),
    Source(RecordSource),
}

/// Sequences writes into one [`Store`].
pub struct PublishQueue {
    store: Store,
    handlers: Box<dyn HandlerProvider>,
    next_update_id: u64,
    applied: IndexMap<UpdateId, OptimisticUpdate>,
    pending_updates: IndexMap<UpdateId, OptimisticUpdate>,
    pending_data: Vec<PendingCommit>,
    /// The overlay must be rebuilt on the next run.
    pending_backup_rebase: bool,
    has_store_snapshot: bool,
    gc_hold: Option<Disposable>,
}

impl std::fmt::Debug for PublishQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishQueue")
            .field("applied", &self.applied.len())
            .field("pending_updates", &self.pending_updates.len())
            .field("pending_data", &self.pending_data.len())
            .field("pending_backup_rebase", &self.pending_backup_rebase)
            .finish()
    }
}

impl PublishQueue {
    pub fn new(store: Store) -> Self {
        Self::with_handlers(store, Box::new(DefaultHandlerProvider::new()))
    }

    pub fn with_handlers(store: Store, handlers: Box<dyn HandlerProvider>) -> Self {
        PublishQueue {
            store,
            handlers,
            next_update_id: 0,
            applied: IndexMap::new(),
            pending_updates: IndexMap::new(),
            pending_data: Vec::new(),
            pending_backup_rebase: false,
            has_store_snapshot: false,
            gc_hold: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Number of optimistic updates currently shown.
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Schedules an optimistic update for the next run.
    pub fn apply_update(&mut self, update: OptimisticUpdate) -> UpdateId {
        let id = UpdateId(self.next_update_id);
        self.next_update_id += 1;
        self.pending_updates.insert(id, update);
        id
    }

    /// Withdraws an optimistic update; the next run rebuilds the overlay
    /// without it.
    pub fn revert_update(&mut self, id: UpdateId) -> Result<(), StoreError> {
        if self.pending_updates.shift_remove(&id).is_some() {
            return Ok(());
        }
        if self.applied.shift_remove(&id).is_some() {
            self.pending_backup_rebase = true;
            return Ok(());
        }
        Err(StoreError::UnknownOptimisticUpdate(id.get()))
    }

    pub fn revert_all(&mut self) {
        self.pending_backup_rebase = true;
        self.pending_updates.clear();
        self.applied.clear();
    }

    /// Normalizes a server response for `operation` and schedules it for
    /// commit. Returns the `@defer`/`@stream` work the response left open.
    pub fn commit_payload(
        &mut self,
        operation: &OperationDescriptor,
        response: &GraphQLResponse,
        updater: Option<Updater>,
    ) -> Result<Vec<IncrementalPlaceholder>, StoreError> {
        let options = self.store.config().normalization_options();
        let mut payload = normalizer::normalize(&operation.root, response, &options)?;
        log_normalization_errors(&payload);
        let placeholders = std::mem::take(&mut payload.incremental_placeholders);
        self.commit_normalized(Some(operation.clone()), payload, updater);
        Ok(placeholders)
    }

    /// Schedules an already normalized payload for commit.
    pub fn commit_normalized(
        &mut self,
        operation: Option<OperationDescriptor>,
        payload: NormalizeResult,
        updater: Option<Updater>,
    ) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingCommit::Payload {
            operation,
            payload,
            updater,
        });
    }

    /// Schedules a client-side updater for commit to the base.
    pub fn commit_update(&mut self, updater: Updater) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingCommit::Updater(updater));
    }

    /// Schedules a record delta for commit to the base.
    pub fn commit_source(&mut self, source: RecordSource) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingCommit::Source(source));
    }

    /// Applies everything scheduled, rebasing optimistic updates when server
    /// data was committed or an update was reverted, then notifies once.
    ///
    /// A failing commit or update does not stop the cycle; the first error
    /// is returned after the notify.
    pub fn run(
        &mut self,
        source_operation: Option<&OperationDescriptor>,
    ) -> Result<Vec<SingularReaderSelector>, StoreError> {
        if self.pending_backup_rebase && self.has_store_snapshot {
            self.store.restore();
            self.has_store_snapshot = false;
        }

        let mut failure = None;
        let invalidate_store = self.commit_data(&mut failure);

        if !self.pending_updates.is_empty() || (self.pending_backup_rebase && !self.applied.is_empty()) {
            if !self.has_store_snapshot {
                self.store.snapshot();
                self.has_store_snapshot = true;
            }
            self.apply_updates(&mut failure);
        }
        self.pending_backup_rebase = false;

        if self.applied.is_empty() {
            if let Some(hold) = self.gc_hold.take() {
                hold.dispose();
            }
        } else if self.gc_hold.is_none() {
            self.gc_hold = Some(self.store.hold_gc());
        }

        let affected = self.store.notify(source_operation, invalidate_store);
        tracing::debug!(
            applied = self.applied.len(),
            affected = affected.len(),
            "publish queue run"
        );
        match failure {
            Some(err) => Err(err),
            None => Ok(affected),
        }
    }

    fn commit_data(&mut self, failure: &mut Option<StoreError>) -> bool {
        let mut invalidate_store = false;
        for commit in std::mem::take(&mut self.pending_data) {
            let outcome = match &commit {
                PendingCommit::Payload {
                    operation,
                    payload,
                    updater,
                } => self.publish_through_proxy(Some(payload), operation.as_ref(), updater.as_ref()),
                PendingCommit::Updater(updater) => self.publish_through_proxy(None, None, Some(updater)),
                PendingCommit::Source(source) => self.store.publish(source, &[]).map(|()| false),
            };
            match outcome {
                Ok(invalidated) => invalidate_store |= invalidated,
                Err(err) => {
                    tracing::error!(error = %err, "commit failed");
                    failure.get_or_insert(err);
                }
            }
        }
        invalidate_store
    }

    fn apply_updates(&mut self, failure: &mut Option<StoreError>) {
        if self.pending_backup_rebase {
            for update in self.applied.values() {
                if let Err(err) = self.apply(update) {
                    tracing::error!(error = %err, "optimistic update failed");
                    failure.get_or_insert(err);
                }
            }
        }
        for (id, update) in std::mem::take(&mut self.pending_updates) {
            if let Err(err) = self.apply(&update) {
                tracing::error!(error = %err, "optimistic update failed");
                failure.get_or_insert(err);
            }
            self.applied.insert(id, update);
        }
    }

    fn apply(&self, update: &OptimisticUpdate) -> Result<(), StoreError> {
        match update {
            OptimisticUpdate::Payload {
                operation,
                response,
                updater,
            } => {
                let options = self.store.config().normalization_options();
                let payload = normalizer::normalize(&operation.root, response, &options)?;
                log_normalization_errors(&payload);
                self.publish_through_proxy(Some(&payload), Some(operation), updater.as_ref())?;
            }
            OptimisticUpdate::Updater(updater) => {
                self.publish_through_proxy(None, None, Some(updater))?;
            }
            OptimisticUpdate::Source(source) => self.store.publish(source, &[])?,
        }
        Ok(())
    }

    /// Merges `payload` into a proxy over the visible store, runs its
    /// handlers and the updater against the merged state, and publishes
    /// the result. Returns whether the whole store was invalidated.
    fn publish_through_proxy(
        &self,
        payload: Option<&NormalizeResult>,
        operation: Option<&OperationDescriptor>,
        updater: Option<&Updater>,
    ) -> Result<bool, StoreError> {
        let proxy = RecordSourceProxy::new(self.store.fork_source());
        if let Some(payload) = payload {
            proxy.publish_source(&payload.source);
            apply_field_payloads(self.handlers.as_ref(), &proxy, &payload.field_payloads);
        }
        if let Some(updater) = updater {
            let data = match (payload, operation) {
                (Some(payload), Some(operation)) => reader::read(&payload.source, &operation.fragment).data,
                _ => None,
            };
            updater(&proxy, data.as_ref());
        }
        let MutationResult {
            sink,
            invalidated,
            invalidate_store,
        } = proxy.into_result();
        self.store.publish(&sink, &invalidated)?;
        Ok(invalidate_store)
    }
}

fn log_normalization_errors(payload: &NormalizeResult) {
    for error in &payload.errors {
        tracing::warn!(path = error.path(), error = %error, "payload does not match its selection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use serde_json::json;

    use relay_core::DataId;

    use crate::config::StoreConfig;
    use crate::reader::Snapshot;
    use crate::test_utils::{me_query, operation, source};

    fn store() -> Store {
        Store::new(
            source(json!({
                "client:root": {"__id": "client:root", "__typename": "__Root", "me": {"__ref": "4"}},
                "4": {"__id": "4", "__typename": "User", "id": "4", "name": "Zuck"}
            })),
            StoreConfig::default(),
        )
    }

    fn name_of(store: &Store) -> Value {
        let op = operation(&me_query(), json!({}));
        store.lookup(&op.fragment).data.unwrap()["me"]["name"].clone()
    }

    fn rename(name: &'static str) -> Updater {
        Rc::new(move |proxy: &RecordSourceProxy, _: Option<&Value>| {
            if let Some(me) = proxy.get(&DataId::new("4")) {
                me.set_value(json!(name), "name", None);
            }
        })
    }

    #[test]
    fn optimistic_update_is_shown_then_reverted() {
        let store = store();
        let before = store.fork_source();
        let mut queue = PublishQueue::new(store.clone());

        let id = queue.apply_update(OptimisticUpdate::Updater(rename("Optimistic")));
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), json!("Optimistic"));
        assert_eq!(queue.applied_count(), 1);

        queue.revert_update(id).unwrap();
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), json!("Zuck"));
        assert!(!store.is_optimistic());
        assert_eq!(store.fork_source(), before);
    }

    #[test]
    fn reverting_an_unknown_update_fails() {
        let mut queue = PublishQueue::new(store());
        let id = queue.apply_update(OptimisticUpdate::Source(RecordSource::new()));
        queue.revert_update(id).unwrap();
        assert!(matches!(
            queue.revert_update(id),
            Err(StoreError::UnknownOptimisticUpdate(0))
        ));
    }

    #[test]
    fn committed_data_is_rebased_under_optimistic_updates() {
        let store = store();
        let mut queue = PublishQueue::new(store.clone());
        queue.apply_update(OptimisticUpdate::Updater(rename("Optimistic")));
        queue.run(None).unwrap();

        queue.commit_source(source(json!({"4": {"__id": "4", "name": "Mark", "age": 40}})));
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), json!("Optimistic"));
        let base = store.get_source();
        let me = base.get(&DataId::new("4")).unwrap();
        assert_eq!(me.get("name").unwrap().as_scalar(), Some(&json!("Mark")));

        queue.revert_all();
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), json!("Mark"));
    }

    #[test]
    fn each_run_notifies_once() {
        let store = store();
        let op = operation(&me_query(), json!({}));
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let _subscription = store.subscribe(store.lookup(&op.fragment), move |_: &Snapshot| {
            counter.set(counter.get() + 1)
        });
        let mut queue = PublishQueue::new(store.clone());
        queue.apply_update(OptimisticUpdate::Updater(rename("Optimistic")));
        queue.run(None).unwrap();
        assert_eq!(hits.get(), 1);

        queue.commit_update(rename("Server"));
        queue.run(None).unwrap();
        // Restore, commit and reapply happen inside one run; the visible
        // name stays "Optimistic", so the rebase itself is not reported.
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn gc_is_held_while_updates_are_applied() {
        let store = store();
        let mut queue = PublishQueue::new(store.clone());
        let id = queue.apply_update(OptimisticUpdate::Updater(rename("Optimistic")));
        queue.run(None).unwrap();
        assert_eq!(store.garbage_collect(), None);
        queue.revert_update(id).unwrap();
        queue.run(None).unwrap();
        assert_eq!(store.garbage_collect(), Some(2));
    }

    #[test]
    fn payload_updater_sees_response_data() {
        let store = store();
        let op = operation(&me_query(), json!({}));
        let mut queue = PublishQueue::new(store.clone());
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        let updater: Updater = Rc::new(move |proxy: &RecordSourceProxy, data: Option<&Value>| {
            let data = data.cloned().unwrap_or_default();
            flag.set(data["me"]["name"] == json!("Mark"));
            proxy.get_root().set_value(json!(1), "updates", None);
        });
        let response = GraphQLResponse::from_data(json!({"me": {"id": "4", "name": "Mark"}}));
        let placeholders = queue.commit_payload(&op, &response, Some(updater)).unwrap();
        assert!(placeholders.is_empty());
        queue.run(Some(&op)).unwrap();
        assert!(seen.get());
        assert_eq!(name_of(&store), json!("Mark"));
        let root = store.get_source();
        assert_eq!(
            root.get(&DataId::root()).unwrap().get("updates").unwrap().as_scalar(),
            Some(&json!(1))
        );
    }
}
