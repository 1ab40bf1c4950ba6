//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use relay_core::{create_operation_descriptor, ConcreteRequest, DataId, OperationDescriptor};
use relay_store::{RecordSource, Store};

/// A compiled request with separate reader and normalization trees.
pub fn request(name: &str, kind: &str, reader: Value, operation: Value, argument_definitions: Value) -> Arc<ConcreteRequest> {
    Arc::new(
        serde_json::from_value(json!({
            "fragment": {
                "name": name,
                "typeCondition": "Query",
                "argumentDefinitions": argument_definitions,
                "selections": reader
            },
            "operation": {
                "name": name,
                "argumentDefinitions": argument_definitions,
                "selections": operation
            },
            "params": {"name": name, "operationKind": kind}
        }))
        .unwrap(),
    )
}

/// A query whose reader and normalization trees are the same.
pub fn query(name: &str, selections: Value) -> Arc<ConcreteRequest> {
    request(name, "query", selections.clone(), selections, json!([]))
}

pub fn operation(request: &Arc<ConcreteRequest>, variables: Value) -> OperationDescriptor {
    let variables = serde_json::from_value(variables).unwrap();
    create_operation_descriptor(request.clone(), &variables, None)
}

pub fn source(value: Value) -> RecordSource {
    serde_json::from_value(value).unwrap()
}

fn user_selection(field: &str) -> Value {
    json!([{
        "kind": "LinkedField", "name": field, "concreteType": "User",
        "selections": [
            {"kind": "ScalarField", "name": "id"},
            {"kind": "ScalarField", "name": "name"}
        ]
    }])
}

/// `me { id name }`
pub fn me_query() -> Arc<ConcreteRequest> {
    query("MeQuery", user_selection("me"))
}

/// `other { id name }`
pub fn other_query() -> Arc<ConcreteRequest> {
    query("OtherQuery", user_selection("other"))
}

/// `renameUser(id: $id) { user { id name } }`
pub fn rename_mutation() -> Arc<ConcreteRequest> {
    let selections = json!([{
        "kind": "LinkedField", "name": "renameUser", "concreteType": "RenameUserPayload",
        "args": [{"kind": "Variable", "name": "id", "variableName": "id"}],
        "selections": user_selection("user")
    }]);
    request(
        "RenameUserMutation",
        "mutation",
        selections.clone(),
        selections,
        json!([{"kind": "LocalArgument", "name": "id"}]),
    )
}

/// A store holding users "1" (Alice, at `me`) and "2" (Bob, at `other`).
pub fn users_store() -> Store {
    Store::new(
        source(json!({
            "client:root": {"__id": "client:root", "__typename": "__Root",
                "me": {"__ref": "1"}, "other": {"__ref": "2"}},
            "1": {"__id": "1", "__typename": "User", "id": "1", "name": "Alice"},
            "2": {"__id": "2", "__typename": "User", "id": "2", "name": "Bob"}
        })),
        Default::default(),
    )
}

/// `name` of a record as currently visible (optimistic changes included).
pub fn visible_name(store: &Store, id: &str) -> Option<Value> {
    let source = store.fork_source();
    let record = source.get(&DataId::new(id))?;
    record.get("name")?.as_scalar().cloned()
}

/// `name` of a record in the canonical source.
pub fn base_name(store: &Store, id: &str) -> Option<Value> {
    let source = store.get_source();
    let record = source.get(&DataId::new(id))?;
    record.get("name")?.as_scalar().cloned()
}
