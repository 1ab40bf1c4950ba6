//! Incremental execution of one operation.
//!
//! The network layer may answer an operation in several increments: the
//! initial response, then labelled follow-ups for `@defer` fragments and
//! `@stream` items. [`OperationExecutor`] keeps the placeholders each
//! increment leaves open, matches follow-ups to them by label and path, and
//! commits every increment through the publish queue.

use relay_core::payload::format_path;
use relay_core::{GraphQLResponse, OperationDescriptor, PathSegment, Selection, SingularReaderSelector};

use crate::error::StoreError;
use crate::normalizer::{self, IncrementalPlaceholder, NormalizeResult};
use crate::publish_queue::{PublishQueue, Updater};

/// Drives one operation's response increments into the store.
pub struct OperationExecutor {
    operation: OperationDescriptor,
    updater: Option<Updater>,
    placeholders: Vec<IncrementalPlaceholder>,
    complete: bool,
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("operation", self.operation.identifier())
            .field("placeholders", &self.placeholders.len())
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

impl OperationExecutor {
    pub fn new(operation: OperationDescriptor, updater: Option<Updater>) -> Self {
        OperationExecutor {
            operation,
            updater,
            placeholders: Vec::new(),
            complete: false,
        }
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    /// Deferred fragments and streams still waiting for data.
    pub fn pending(&self) -> &[IncrementalPlaceholder] {
        &self.placeholders
    }

    /// True once the server reported `hasNext: false` (or sent a plain,
    /// non-incremental response with nothing left open).
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Normalizes and commits one increment, then runs the queue.
    pub fn next(
        &mut self,
        queue: &mut PublishQueue,
        response: &GraphQLResponse,
    ) -> Result<Vec<SingularReaderSelector>, StoreError> {
        match (&response.label, &response.path) {
            (Some(label), Some(path)) => self.process_follow_up(queue, label, path, response)?,
            _ => {
                let opened = queue.commit_payload(&self.operation, response, self.updater.clone())?;
                self.placeholders.extend(opened);
            }
        }
        match response.has_next {
            Some(false) => self.finish(),
            None if self.placeholders.is_empty() => self.finish(),
            _ => {}
        }
        queue.run(Some(&self.operation))
    }

    fn finish(&mut self) {
        if !self.placeholders.is_empty() {
            tracing::debug!(
                open = self.placeholders.len(),
                "operation completed with unresolved incremental placeholders"
            );
        }
        self.placeholders.clear();
        self.complete = true;
    }

    fn process_follow_up(
        &mut self,
        queue: &mut PublishQueue,
        label: &str,
        path: &[PathSegment],
        response: &GraphQLResponse,
    ) -> Result<(), StoreError> {
        let unknown = || StoreError::UnknownIncrementalPayload {
            label: label.to_string(),
            path: format_path(path),
        };
        let options = queue.store().config().normalization_options();

        let deferred = self.placeholders.iter().position(|placeholder| {
            matches!(placeholder, IncrementalPlaceholder::Defer { .. })
                && placeholder.label() == label
                && placeholder.path() == path
        });
        if let Some(index) = deferred {
            let placeholder = self.placeholders.remove(index);
            let IncrementalPlaceholder::Defer { selector, typename, .. } = &placeholder else {
                return Err(unknown());
            };
            let mut result = normalizer::normalize_at(selector, typename.as_deref(), path, response, &options)?;
            self.commit(queue, &mut result);
            return Ok(());
        }

        // A streamed item's path is the list field's path plus the item index.
        let Some((PathSegment::Index(item_index), list_path)) = path.split_last() else {
            return Err(unknown());
        };
        let Some(placeholder) = self.placeholders.iter().find(|placeholder| {
            matches!(placeholder, IncrementalPlaceholder::Stream { .. })
                && placeholder.label() == label
                && placeholder.path() == list_path
        }) else {
            return Err(unknown());
        };
        let IncrementalPlaceholder::Stream {
            parent_id,
            selections,
            variables,
            ..
        } = placeholder
        else {
            return Err(unknown());
        };

        let source = queue.store().fork_source();
        let Some(parent) = source.get(parent_id) else {
            return Err(StoreError::MissingStreamParent(parent_id.clone()));
        };
        let existing = selections
            .iter()
            .find_map(|selection| match selection {
                Selection::LinkedField(field) => Some(field.storage_key(variables)),
                _ => None,
            })
            .and_then(|key| parent.get(&key))
            .and_then(|value| value.as_refs())
            .map(<[_]>::to_vec)
            .unwrap_or_default();

        let item = response.data.clone().unwrap_or_default();
        let normalized = normalizer::normalize_stream_item(
            placeholder,
            &item,
            *item_index,
            &existing,
            &response.errors,
            &options,
        )?;
        if let Some(mut result) = normalized {
            self.commit(queue, &mut result);
        }
        Ok(())
    }

    fn commit(&mut self, queue: &mut PublishQueue, result: &mut NormalizeResult) {
        self.placeholders.append(&mut result.incremental_placeholders);
        for error in &result.errors {
            tracing::warn!(path = error.path(), error = %error, "increment does not match its selection");
        }
        queue.commit_normalized(Some(self.operation.clone()), std::mem::take(result), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use relay_core::{DataId, FieldValue};

    use crate::store::Store;
    use crate::test_utils::{operation, query};

    fn executor_for(selections: serde_json::Value) -> (Store, PublishQueue, OperationExecutor) {
        let store = Store::default();
        let queue = PublishQueue::new(store.clone());
        let op = operation(&query("Incremental", selections), json!({}));
        (store, queue, OperationExecutor::new(op, None))
    }

    fn follow_up(data: serde_json::Value, label: &str, path: serde_json::Value, has_next: bool) -> GraphQLResponse {
        serde_json::from_value(json!({"data": data, "label": label, "path": path, "hasNext": has_next})).unwrap()
    }

    #[test]
    fn deferred_fragment_arrives_later() {
        let (store, mut queue, mut executor) = executor_for(json!([{
            "kind": "LinkedField", "name": "me", "concreteType": "User",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "Defer", "label": "bio", "selections": [{"kind": "ScalarField", "name": "bio"}]}
            ]
        }]));
        let initial: GraphQLResponse =
            serde_json::from_value(json!({"data": {"me": {"id": "4"}}, "hasNext": true})).unwrap();
        executor.next(&mut queue, &initial).unwrap();
        assert_eq!(executor.pending().len(), 1);
        let snapshot = store.lookup(&executor.operation().fragment);
        assert!(snapshot.is_missing_data);

        executor
            .next(&mut queue, &follow_up(json!({"bio": "hi"}), "bio", json!(["me"]), false))
            .unwrap();
        assert!(executor.is_complete());
        let snapshot = store.lookup(&executor.operation().fragment);
        assert!(!snapshot.is_missing_data);
        assert_eq!(snapshot.data, Some(json!({"me": {"id": "4", "bio": "hi"}})));
    }

    #[test]
    fn streamed_items_extend_the_list() {
        let (store, mut queue, mut executor) = executor_for(json!([{
            "kind": "Stream", "label": "feed", "selections": [{
                "kind": "LinkedField", "name": "feed", "plural": true, "concreteType": "Story",
                "selections": [{"kind": "ScalarField", "name": "id"}]
            }]
        }]));
        let initial: GraphQLResponse =
            serde_json::from_value(json!({"data": {"feed": [{"id": "a"}]}, "hasNext": true})).unwrap();
        executor.next(&mut queue, &initial).unwrap();
        executor
            .next(&mut queue, &follow_up(json!({"id": "b"}), "feed", json!(["feed", 1]), true))
            .unwrap();
        executor
            .next(&mut queue, &follow_up(json!({"id": "c"}), "feed", json!(["feed", 2]), false))
            .unwrap();

        let source = store.get_source();
        assert_eq!(
            source.get(&DataId::root()).unwrap().get("feed"),
            Some(&FieldValue::Refs(vec![
                Some(DataId::new("a")),
                Some(DataId::new("b")),
                Some(DataId::new("c"))
            ]))
        );
        assert!(executor.is_complete());
    }

    #[test]
    fn unmatched_follow_up_is_an_error() {
        let (_, mut queue, mut executor) = executor_for(json!([{"kind": "ScalarField", "name": "id"}]));
        let initial: GraphQLResponse =
            serde_json::from_value(json!({"data": {"id": "1"}, "hasNext": true})).unwrap();
        executor.next(&mut queue, &initial).unwrap();
        let err = executor
            .next(&mut queue, &follow_up(json!({}), "nope", json!(["x"]), false))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnknownIncrementalPayload { ref label, ref path } if label == "nope" && path == "x"
        ));
    }

    #[test]
    fn plain_response_completes_immediately() {
        let (store, mut queue, mut executor) = executor_for(json!([{"kind": "ScalarField", "name": "id"}]));
        executor
            .next(&mut queue, &GraphQLResponse::from_data(json!({"id": "root-id"})))
            .unwrap();
        assert!(executor.is_complete());
        assert!(matches!(
            store.check(executor.operation()),
            crate::store::OperationAvailability::Available { .. }
        ));
    }
}
