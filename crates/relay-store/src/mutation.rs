//! Mutation lifecycle.
//!
//! A [`Mutation`] drives one mutation through the publish queue with an
//! explicit state machine:
//! `Queued -> OptimisticApplied -> (Committed | Reverted)`.
//! A mutation without optimistic data may go straight from `Queued` to
//! `Committed` or `Reverted`. Every transition ends with one queue run, so
//! the store notifies once per transition.

use serde_json::Value;

use relay_core::{GraphQLResponse, OperationDescriptor, SingularReaderSelector};

use crate::error::StoreError;
use crate::normalizer::IncrementalPlaceholder;
use crate::publish_queue::{OptimisticUpdate, PublishQueue, UpdateId, Updater};

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Created, nothing shown yet.
    Queued,
    /// Optimistic data is shown on top of the store.
    OptimisticApplied,
    /// The server response was committed (terminal).
    Committed,
    /// The mutation failed and its optimistic data was withdrawn (terminal).
    Reverted,
}

impl MutationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationState::Queued => "queued",
            MutationState::OptimisticApplied => "optimistic-applied",
            MutationState::Committed => "committed",
            MutationState::Reverted => "reverted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MutationState::Committed | MutationState::Reverted)
    }
}

/// One mutation execution.
pub struct Mutation {
    operation: OperationDescriptor,
    optimistic_response: Option<Value>,
    optimistic_updater: Option<Updater>,
    updater: Option<Updater>,
    state: MutationState,
    optimistic_update: Option<UpdateId>,
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("operation", self.operation.identifier())
            .field("state", &self.state)
            .field("optimistic_update", &self.optimistic_update)
            .finish_non_exhaustive()
    }
}

impl Mutation {
    pub fn new(operation: OperationDescriptor) -> Self {
        Mutation {
            operation,
            optimistic_response: None,
            optimistic_updater: None,
            updater: None,
            state: MutationState::Queued,
            optimistic_update: None,
        }
    }

    /// Response data shown until the server answers.
    pub fn with_optimistic_response(mut self, data: Value) -> Self {
        self.optimistic_response = Some(data);
        self
    }

    /// Updater run on the optimistic state (after the optimistic response,
    /// if any).
    pub fn with_optimistic_updater(mut self, updater: Updater) -> Self {
        self.optimistic_updater = Some(updater);
        self
    }

    /// Updater run when the server response is committed.
    pub fn with_updater(mut self, updater: Updater) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    fn invalid(&self, event: &'static str) -> StoreError {
        StoreError::InvalidMutationTransition {
            state: self.state.as_str(),
            event,
        }
    }

    /// Shows the optimistic response and updater. `Queued` only.
    pub fn apply_optimistic(&mut self, queue: &mut PublishQueue) -> Result<Vec<SingularReaderSelector>, StoreError> {
        if self.state != MutationState::Queued {
            return Err(self.invalid("apply an optimistic update"));
        }
        let update = match (&self.optimistic_response, &self.optimistic_updater) {
            (Some(data), updater) => Some(OptimisticUpdate::Payload {
                operation: self.operation.clone(),
                response: GraphQLResponse::from_data(data.clone()),
                updater: updater.clone(),
            }),
            (None, Some(updater)) => Some(OptimisticUpdate::Updater(updater.clone())),
            (None, None) => None,
        };
        self.optimistic_update = update.map(|update| queue.apply_update(update));
        self.state = MutationState::OptimisticApplied;
        queue.run(None)
    }

    /// Withdraws the optimistic data and commits the server response in a
    /// single rebase. Returns the `@defer`/`@stream` work the response left
    /// open.
    pub fn commit(
        &mut self,
        queue: &mut PublishQueue,
        response: &GraphQLResponse,
    ) -> Result<Vec<IncrementalPlaceholder>, StoreError> {
        if self.state.is_terminal() {
            return Err(self.invalid("commit"));
        }
        // A payload that fails to normalize leaves the mutation untouched.
        let placeholders = queue.commit_payload(&self.operation, response, self.updater.clone())?;
        if let Some(id) = self.optimistic_update.take() {
            queue.revert_update(id)?;
        }
        self.state = MutationState::Committed;
        queue.run(Some(&self.operation))?;
        Ok(placeholders)
    }

    /// The request failed: withdraws the optimistic data.
    pub fn revert(&mut self, queue: &mut PublishQueue) -> Result<Vec<SingularReaderSelector>, StoreError> {
        if self.state.is_terminal() {
            return Err(self.invalid("revert"));
        }
        if let Some(id) = self.optimistic_update.take() {
            queue.revert_update(id)?;
        }
        self.state = MutationState::Reverted;
        queue.run(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use serde_json::json;

    use relay_core::DataId;

    use crate::config::StoreConfig;
    use crate::mutator::RecordSourceProxy;
    use crate::store::Store;
    use crate::test_utils::{me_query, operation, query, source};

    fn rename_mutation() -> OperationDescriptor {
        let request = query(
            "RenameMutation",
            json!([{
                "kind": "LinkedField", "name": "rename", "concreteType": "RenamePayload",
                "selections": [{
                    "kind": "LinkedField", "name": "user", "concreteType": "User",
                    "selections": [
                        {"kind": "ScalarField", "name": "id"},
                        {"kind": "ScalarField", "name": "name"}
                    ]
                }]
            }]),
        );
        operation(&request, json!({}))
    }

    fn setup() -> (Store, PublishQueue) {
        let store = Store::new(
            source(json!({
                "client:root": {"__id": "client:root", "__typename": "__Root", "me": {"__ref": "4"}},
                "4": {"__id": "4", "__typename": "User", "id": "4", "name": "Zuck"}
            })),
            StoreConfig::default(),
        );
        let queue = PublishQueue::new(store.clone());
        (store, queue)
    }

    fn name(store: &Store) -> Value {
        let op = operation(&me_query(), json!({}));
        store.lookup(&op.fragment).data.unwrap()["me"]["name"].clone()
    }

    fn response(name: &str) -> GraphQLResponse {
        GraphQLResponse::from_data(json!({"rename": {"user": {"id": "4", "name": name}}}))
    }

    #[test]
    fn optimistic_then_commit() {
        let (store, mut queue) = setup();
        let mut mutation = Mutation::new(rename_mutation()).with_optimistic_response(
            json!({"rename": {"user": {"id": "4", "name": "Optimistic"}}}),
        );
        mutation.apply_optimistic(&mut queue).unwrap();
        assert_eq!(mutation.state(), MutationState::OptimisticApplied);
        assert_eq!(name(&store), json!("Optimistic"));

        mutation.commit(&mut queue, &response("Server")).unwrap();
        assert_eq!(mutation.state(), MutationState::Committed);
        assert_eq!(name(&store), json!("Server"));
        assert!(!store.is_optimistic());
    }

    #[test]
    fn failed_commit_keeps_the_optimistic_update() {
        let (store, mut queue) = setup();
        let request = query(
            "RenameMutation",
            json!([{
                "kind": "LinkedField", "name": "rename", "concreteType": "RenamePayload",
                "selections": [
                    {
                        "kind": "LinkedField", "name": "user", "concreteType": "User",
                        "selections": [
                            {"kind": "ScalarField", "name": "id"},
                            {"kind": "ScalarField", "name": "name"}
                        ]
                    },
                    {"kind": "ScalarField", "alias": "userName", "name": "user"}
                ]
            }]),
        );
        let mut mutation = Mutation::new(operation(&request, json!({})))
            .with_optimistic_response(json!({"rename": {"user": {"id": "4", "name": "Optimistic"}}}));
        mutation.apply_optimistic(&mut queue).unwrap();
        assert_eq!(name(&store), json!("Optimistic"));

        let bad = GraphQLResponse::from_data(json!({
            "rename": {"user": {"id": "4", "name": "Server"}, "userName": "Server"}
        }));
        let err = mutation.commit(&mut queue, &bad).unwrap_err();
        assert!(matches!(err, StoreError::Core(relay_core::CoreError::StorageKeyCollision { .. })));
        assert_eq!(mutation.state(), MutationState::OptimisticApplied);
        assert_eq!(name(&store), json!("Optimistic"));

        mutation.revert(&mut queue).unwrap();
        assert_eq!(mutation.state(), MutationState::Reverted);
        assert_eq!(name(&store), json!("Zuck"));
        assert!(!store.is_optimistic());
    }

    #[test]
    fn revert_withdraws_optimistic_data() {
        let (store, mut queue) = setup();
        let updater: Updater = Rc::new(|proxy: &RecordSourceProxy, _: Option<&Value>| {
            if let Some(me) = proxy.get(&DataId::new("4")) {
                me.set_value(json!("Optimistic"), "name", None);
            }
        });
        let mut mutation = Mutation::new(rename_mutation()).with_optimistic_updater(updater);
        mutation.apply_optimistic(&mut queue).unwrap();
        assert_eq!(name(&store), json!("Optimistic"));
        mutation.revert(&mut queue).unwrap();
        assert_eq!(mutation.state(), MutationState::Reverted);
        assert_eq!(name(&store), json!("Zuck"));
    }

    #[test]
    fn terminal_states_reject_events() {
        let (_, mut queue) = setup();
        let mut mutation = Mutation::new(rename_mutation());
        mutation.commit(&mut queue, &response("Server")).unwrap();
        let err = mutation.revert(&mut queue).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidMutationTransition {
                state: "committed",
                event: "revert"
            }
        ));
        assert!(matches!(
            mutation.apply_optimistic(&mut queue),
            Err(StoreError::InvalidMutationTransition { .. })
        ));
    }

    #[test]
    fn commit_runs_server_updater() {
        let (store, mut queue) = setup();
        let updater: Updater = Rc::new(|proxy: &RecordSourceProxy, data: Option<&Value>| {
            let renamed = data.and_then(|d| d["rename"]["user"]["name"].as_str()).unwrap_or_default();
            proxy.get_root().set_value(json!(renamed), "lastRename", None);
        });
        let mut mutation = Mutation::new(rename_mutation()).with_updater(updater);
        mutation.commit(&mut queue, &response("Server")).unwrap();
        let source = store.get_source();
        assert_eq!(
            source.get(&DataId::root()).unwrap().get("lastRename").unwrap().as_scalar(),
            Some(&json!("Server"))
        );
    }
}
