//! Fixtures shared by the unit tests of this crate.

use std::sync::Arc;

use serde_json::{json, Value};

use relay_core::{create_operation_descriptor, ConcreteRequest, OperationDescriptor, Selection, Selections};

use crate::source::RecordSource;

pub fn selections(value: Value) -> Selections {
    let list: Vec<Selection> = serde_json::from_value(value).unwrap();
    Arc::from(list)
}

/// A query whose reader and normalization trees are the same `selections`.
pub fn query(name: &str, selections: Value) -> Arc<ConcreteRequest> {
    query_with_args(name, selections, json!([]))
}

pub fn query_with_args(name: &str, selections: Value, argument_definitions: Value) -> Arc<ConcreteRequest> {
    Arc::new(
        serde_json::from_value(json!({
            "fragment": {
                "name": name,
                "typeCondition": "Query",
                "argumentDefinitions": argument_definitions,
                "selections": selections
            },
            "operation": {
                "name": name,
                "argumentDefinitions": argument_definitions,
                "selections": selections
            },
            "params": {"name": name, "operationKind": "query"}
        }))
        .unwrap(),
    )
}

pub fn operation(request: &Arc<ConcreteRequest>, variables: Value) -> OperationDescriptor {
    let variables = serde_json::from_value(variables).unwrap();
    create_operation_descriptor(request.clone(), &variables, None)
}

/// A source from its persisted JSON form.
pub fn source(value: Value) -> RecordSource {
    serde_json::from_value(value).unwrap()
}

/// `me { id name }`, the query most tests start from.
pub fn me_query() -> Arc<ConcreteRequest> {
    query(
        "MeQuery",
        json!([{
            "kind": "LinkedField", "name": "me", "concreteType": "User",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "name"}
            ]
        }]),
    )
}
