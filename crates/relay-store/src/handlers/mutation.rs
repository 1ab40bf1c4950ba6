//! Declarative mutation directives: `@deleteRecord`, `@deleteEdge`,
//! `@appendEdge`, `@prependEdge`, `@appendNode` and `@prependNode`.
//!
//! The edge and node directives take the ids of the client connections to
//! update in `handle_args.connections`; the node directives also need the
//! edge type to create in `handle_args.edgeTypeName`.

use std::collections::HashSet;

use serde_json::Value;

use relay_core::DataId;

use crate::handlers::connection::{
    build_connection_edge, create_edge, delete_node, insert_edge_after, insert_edge_before, EDGES, NODE,
};
use crate::handlers::Handler;
use crate::mutator::{RecordProxy, RecordSourceProxy};
use crate::normalizer::HandleFieldPayload;

/// Where new edges go in a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Append,
    Prepend,
}

impl InsertPosition {
    fn insert(self, connection: &RecordProxy<'_>, edge: &RecordProxy<'_>) {
        match self {
            InsertPosition::Append => insert_edge_after(connection, edge, None),
            InsertPosition::Prepend => insert_edge_before(connection, edge, None),
        }
    }
}

/// Ids named by a scalar id field, singular or plural.
fn ids_of(value: Option<Value>) -> Vec<DataId> {
    match value {
        Some(Value::String(id)) => vec![DataId::new(id)],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(id) => Some(DataId::new(id)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn connection_ids(payload: &HandleFieldPayload) -> Vec<DataId> {
    match payload.handle_args.get("connections") {
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(Value::as_str)
            .map(DataId::new)
            .collect(),
        _ => {
            tracing::warn!(handle = %payload.handle, "no connections given");
            Vec::new()
        }
    }
}

fn existing_node_ids(connection: &RecordProxy<'_>) -> HashSet<DataId> {
    connection
        .get_linked_records(EDGES, None)
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.get_linked_record(NODE, None))
        .map(|node| node.data_id().clone())
        .collect()
}

/// Linked records under the payload's field, singular or plural.
fn linked_records<'a>(record: &RecordProxy<'a>, field_key: &str) -> Vec<RecordProxy<'a>> {
    if let Some(single) = record.get_linked_record(field_key, None) {
        return vec![single];
    }
    record
        .get_linked_records(field_key, None)
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .collect()
}

/// `@deleteRecord` on an id field: deletes the named records.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteRecordHandler;

impl Handler for DeleteRecordHandler {
    fn update(&self, store: &RecordSourceProxy, payload: &HandleFieldPayload) {
        let Some(record) = store.get(&payload.data_id) else {
            return;
        };
        for id in ids_of(record.get_value(&payload.field_key, None)) {
            store.delete(&id);
        }
    }
}

/// `@deleteEdge` on an id field: removes the edges of the named nodes from
/// each connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteEdgeHandler;

impl Handler for DeleteEdgeHandler {
    fn update(&self, store: &RecordSourceProxy, payload: &HandleFieldPayload) {
        let Some(record) = store.get(&payload.data_id) else {
            return;
        };
        let ids = ids_of(record.get_value(&payload.field_key, None));
        for connection_id in connection_ids(payload) {
            let Some(connection) = store.get(&connection_id) else {
                tracing::warn!(connection = %connection_id, "connection not found");
                continue;
            };
            for id in &ids {
                delete_node(&connection, id);
            }
        }
    }
}

/// `@appendEdge` / `@prependEdge` on an edge field.
#[derive(Debug, Clone, Copy)]
pub struct EdgeInsertHandler(pub InsertPosition);

impl Handler for EdgeInsertHandler {
    fn update(&self, store: &RecordSourceProxy, payload: &HandleFieldPayload) {
        let Some(record) = store.get(&payload.data_id) else {
            return;
        };
        let server_edges = linked_records(&record, &payload.field_key);
        for connection_id in connection_ids(payload) {
            let Some(connection) = store.get(&connection_id) else {
                tracing::warn!(connection = %connection_id, "connection not found");
                continue;
            };
            let mut node_ids = existing_node_ids(&connection);
            for server_edge in &server_edges {
                let Some(node) = server_edge.get_linked_record(NODE, None) else {
                    continue;
                };
                if !node_ids.insert(node.data_id().clone()) {
                    continue;
                }
                if let Some(edge) = build_connection_edge(store, &connection, server_edge) {
                    self.0.insert(&connection, &edge);
                }
            }
        }
    }
}

/// `@appendNode` / `@prependNode` on a node field.
#[derive(Debug, Clone, Copy)]
pub struct NodeInsertHandler(pub InsertPosition);

impl Handler for NodeInsertHandler {
    fn update(&self, store: &RecordSourceProxy, payload: &HandleFieldPayload) {
        let Some(record) = store.get(&payload.data_id) else {
            return;
        };
        let Some(edge_type) = payload.handle_args.get("edgeTypeName").and_then(Value::as_str) else {
            tracing::warn!(handle = %payload.handle, "no edgeTypeName given");
            return;
        };
        let nodes = linked_records(&record, &payload.field_key);
        for connection_id in connection_ids(payload) {
            let Some(connection) = store.get(&connection_id) else {
                tracing::warn!(connection = %connection_id, "connection not found");
                continue;
            };
            let mut node_ids = existing_node_ids(&connection);
            for node in &nodes {
                if !node_ids.insert(node.data_id().clone()) {
                    continue;
                }
                if let Some(edge) = create_edge(store, &connection, node, edge_type) {
                    self.0.insert(&connection, &edge);
                }
            }
        }
    }
}
