//! Cursor-paginated connections.
//!
//! The server field of a connection is re-fetched page by page; the handler
//! keeps a client-side connection record (keyed by the handle key) that
//! accumulates edges across pages:
//!
//! - no `after`/`before` argument: the page replaces the edges
//! - `after` equal to the current end cursor: edges are appended
//! - `before` equal to the current start cursor: edges are prepended
//! - any other cursor: the page is ignored
//!
//! Appended and prepended edges are de-duplicated by node id. Every server
//! edge is copied into a client edge record `client:<connection>:edges:<n>`
//! so edges from different pages never share an id.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use relay_core::id::generate_client_id;
use relay_core::storage_key::{format_storage_key, handle_key};
use relay_core::{DataId, Variables};

use crate::handlers::Handler;
use crate::mutator::{RecordProxy, RecordSourceProxy};
use crate::normalizer::HandleFieldPayload;

pub const EDGES: &str = "edges";
pub const NODE: &str = "node";
pub const CURSOR: &str = "cursor";
pub const PAGE_INFO: &str = "pageInfo";
pub const PAGE_INFO_TYPE: &str = "PageInfo";
pub const END_CURSOR: &str = "endCursor";
pub const START_CURSOR: &str = "startCursor";
pub const HAS_NEXT_PAGE: &str = "hasNextPage";
pub const HAS_PREV_PAGE: &str = "hasPreviousPage";
pub const NEXT_EDGE_INDEX: &str = "__connection_next_edge_index";

/// Handler for `connection` handle fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionHandler;

impl Handler for ConnectionHandler {
    fn update(&self, store: &RecordSourceProxy, payload: &HandleFieldPayload) {
        let Some(record) = store.get(&payload.data_id) else {
            return;
        };
        let Some(server_connection) = record.get_linked_record(&payload.field_key, None) else {
            record.set_value(Value::Null, &payload.handle_key, None);
            return;
        };

        let client_id = generate_client_id(record.data_id(), &payload.handle_key, None);
        let linked = record.get_linked_record(&payload.handle_key, None);
        let existing = linked.clone().or_else(|| store.get(&client_id));

        let Some(connection) = existing else {
            create_connection(store, &record, &server_connection, &client_id, &payload.handle_key);
            return;
        };
        if linked.is_none() {
            record.set_linked_record(&connection, &payload.handle_key, None);
        }
        merge_page(store, &connection, &server_connection, &payload.args);
    }
}

fn create_connection(
    store: &RecordSourceProxy,
    record: &RecordProxy<'_>,
    server_connection: &RecordProxy<'_>,
    client_id: &DataId,
    handle_key: &str,
) {
    let typename = server_connection.typename().unwrap_or_default();
    let Ok(connection) = store.create(client_id, &typename) else {
        return;
    };
    connection.set_value(Value::from(0), NEXT_EDGE_INDEX, None);
    connection.copy_fields_from(server_connection);
    if let Some(server_edges) = server_connection.get_linked_records(EDGES, None) {
        let edges: Vec<_> = server_edges
            .iter()
            .map(|edge| edge.as_ref().and_then(|edge| build_connection_edge(store, &connection, edge)))
            .collect();
        connection.set_linked_records(&edges, EDGES, None);
    }
    record.set_linked_record(&connection, handle_key, None);

    let page_info_id = generate_client_id(connection.data_id(), PAGE_INFO, None);
    let page_info = match store.create(&page_info_id, PAGE_INFO_TYPE) {
        Ok(page_info) => page_info,
        Err(_) => match store.get(&page_info_id) {
            Some(page_info) => page_info,
            None => return,
        },
    };
    page_info.set_value(Value::Bool(false), HAS_NEXT_PAGE, None);
    page_info.set_value(Value::Bool(false), HAS_PREV_PAGE, None);
    page_info.set_value(Value::Null, END_CURSOR, None);
    page_info.set_value(Value::Null, START_CURSOR, None);
    if let Some(server_page_info) = server_connection.get_linked_record(PAGE_INFO, None) {
        page_info.copy_fields_from(&server_page_info);
    }
    connection.set_linked_record(&page_info, PAGE_INFO, None);
}

fn merge_page(
    store: &RecordSourceProxy,
    connection: &RecordProxy<'_>,
    server_connection: &RecordProxy<'_>,
    args: &Variables,
) {
    let page_info = connection.get_linked_record(PAGE_INFO, None);
    let prev_edges = connection.get_linked_records(EDGES, None);
    let server_edges = server_connection.get_linked_records(EDGES, None).map(|edges| {
        edges
            .iter()
            .map(|edge| edge.as_ref().and_then(|edge| build_connection_edge(store, connection, edge)))
            .collect::<Vec<_>>()
    });
    let after = args.get("after").filter(|v| !v.is_null());
    let before = args.get("before").filter(|v| !v.is_null());
    let cursor_of = |key: &str| page_info.as_ref().and_then(|info| info.get_value(key, None));

    let next_edges = match (prev_edges, server_edges) {
        (Some(prev), Some(server)) => {
            if let Some(after) = after {
                if cursor_of(END_CURSOR).as_ref() != Some(after) {
                    tracing::warn!(connection = %connection.data_id(), "unexpected after cursor; page ignored");
                    return;
                }
                let mut merged = Vec::new();
                let mut node_ids = HashSet::new();
                merge_edges(prev, &mut merged, &mut node_ids);
                merge_edges(server, &mut merged, &mut node_ids);
                Some(merged)
            } else if let Some(before) = before {
                if cursor_of(START_CURSOR).as_ref() != Some(before) {
                    tracing::warn!(connection = %connection.data_id(), "unexpected before cursor; page ignored");
                    return;
                }
                let mut merged = Vec::new();
                let mut node_ids = HashSet::new();
                merge_edges(server, &mut merged, &mut node_ids);
                merge_edges(prev, &mut merged, &mut node_ids);
                Some(merged)
            } else {
                Some(server)
            }
        }
        (None, Some(server)) => Some(server),
        (_, None) => None,
    };
    if let Some(edges) = next_edges {
        connection.set_linked_records(&edges, EDGES, None);
    }

    let (Some(page_info), Some(server_page_info)) = (page_info, server_connection.get_linked_record(PAGE_INFO, None))
    else {
        return;
    };
    let paginating_backward = before.is_some() || (after.is_none() && args.contains_key("last"));
    if after.is_none() && before.is_none() {
        page_info.copy_fields_from(&server_page_info);
    } else if paginating_backward {
        let has_prev = server_page_info.get_value(HAS_PREV_PAGE, None).and_then(|v| v.as_bool());
        page_info.set_value(Value::Bool(has_prev.unwrap_or(false)), HAS_PREV_PAGE, None);
        if let Some(cursor) = server_page_info.get_value(START_CURSOR, None).filter(Value::is_string) {
            page_info.set_value(cursor, START_CURSOR, None);
        }
    } else {
        let has_next = server_page_info.get_value(HAS_NEXT_PAGE, None).and_then(|v| v.as_bool());
        page_info.set_value(Value::Bool(has_next.unwrap_or(false)), HAS_NEXT_PAGE, None);
        if let Some(cursor) = server_page_info.get_value(END_CURSOR, None).filter(Value::is_string) {
            page_info.set_value(cursor, END_CURSOR, None);
        }
    }
}

fn node_id(edge: &RecordProxy<'_>) -> Option<DataId> {
    edge.get_linked_record(NODE, None).map(|node| node.data_id().clone())
}

fn merge_edges<'a>(
    source: Vec<Option<RecordProxy<'a>>>,
    target: &mut Vec<Option<RecordProxy<'a>>>,
    node_ids: &mut HashSet<DataId>,
) {
    for edge in source.into_iter().flatten() {
        if let Some(id) = node_id(&edge) {
            if !node_ids.insert(id) {
                continue;
            }
        }
        target.push(Some(edge));
    }
}

/// Copies a server edge into a fresh client edge record of `connection`.
pub fn build_connection_edge<'a>(
    store: &'a RecordSourceProxy,
    connection: &RecordProxy<'_>,
    edge: &RecordProxy<'_>,
) -> Option<RecordProxy<'a>> {
    let index = connection
        .get_value(NEXT_EDGE_INDEX, None)
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let edge_id = generate_client_id(connection.data_id(), EDGES, usize::try_from(index).ok());
    let typename = edge.typename().unwrap_or_default();
    let client_edge = store.create(&edge_id, &typename).ok().or_else(|| store.get(&edge_id))?;
    client_edge.copy_fields_from(edge);
    if client_edge.get_value(CURSOR, None).is_none() {
        client_edge.set_value(Value::Null, CURSOR, None);
    }
    connection.set_value(Value::from(index + 1), NEXT_EDGE_INDEX, None);
    Some(client_edge)
}

/// Creates (or reuses) the edge of `connection` pointing at `node`.
pub fn create_edge<'a>(
    store: &'a RecordSourceProxy,
    connection: &RecordProxy<'_>,
    node: &RecordProxy<'_>,
    edge_type: &str,
) -> Option<RecordProxy<'a>> {
    let edge_id = generate_client_id(connection.data_id(), node.data_id().as_str(), None);
    let edge = store.get(&edge_id).or_else(|| store.create(&edge_id, edge_type).ok())?;
    edge.set_linked_record(node, NODE, None);
    if edge.get_value(CURSOR, None).is_none() {
        edge.set_value(Value::Null, CURSOR, None);
    }
    Some(edge)
}

/// Inserts `edge` after the edge with `cursor`, or at the end.
pub fn insert_edge_after(connection: &RecordProxy<'_>, edge: &RecordProxy<'_>, cursor: Option<&str>) {
    insert_edge(connection, edge, cursor, true);
}

/// Inserts `edge` before the edge with `cursor`, or at the start.
pub fn insert_edge_before(connection: &RecordProxy<'_>, edge: &RecordProxy<'_>, cursor: Option<&str>) {
    insert_edge(connection, edge, cursor, false);
}

fn insert_edge(connection: &RecordProxy<'_>, edge: &RecordProxy<'_>, cursor: Option<&str>, after: bool) {
    let Some(mut edges) = connection.get_linked_records(EDGES, None) else {
        connection.set_linked_records(&[Some(edge.clone())], EDGES, None);
        return;
    };
    let found = cursor.and_then(|cursor| {
        edges.iter().position(|existing| {
            existing
                .as_ref()
                .and_then(|e| e.get_value(CURSOR, None))
                .is_some_and(|value| value.as_str() == Some(cursor))
        })
    });
    let index = match (found, after) {
        (Some(i), true) => i + 1,
        (Some(i), false) => i,
        (None, true) => edges.len(),
        (None, false) => 0,
    };
    edges.insert(index, Some(edge.clone()));
    connection.set_linked_records(&edges, EDGES, None);
}

/// Removes every edge of `connection` whose node is `node_id`.
pub fn delete_node(connection: &RecordProxy<'_>, node_id_to_delete: &DataId) {
    let Some(edges) = connection.get_linked_records(EDGES, None) else {
        return;
    };
    let before = edges.len();
    let kept: Vec<_> = edges
        .into_iter()
        .filter(|edge| {
            edge.as_ref()
                .and_then(node_id)
                .map_or(true, |id| &id != node_id_to_delete)
        })
        .collect();
    if kept.len() != before {
        connection.set_linked_records(&kept, EDGES, None);
    }
}

/// Id of the client connection record stored under `key` on `record_id`.
pub fn connection_id(record_id: &DataId, key: &str, filters: Option<&Variables>) -> DataId {
    let name = handle_key("connection", key, "");
    let storage_key = match filters {
        Some(filters) if !filters.is_empty() => {
            let args: BTreeMap<String, Value> = filters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            format_storage_key(&name, &args)
        }
        _ => name,
    };
    generate_client_id(record_id, &storage_key, None)
}

/// The client connection record stored under `key` on `record`.
pub fn get_connection<'a>(record: &RecordProxy<'a>, key: &str, filters: Option<&Variables>) -> Option<RecordProxy<'a>> {
    let name = handle_key("connection", key, "");
    record.get_linked_record(&name, filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::source::RecordSource;
    use crate::test_utils::source;

    const CONN: &str = "client:root:__Feed_feed_connection";

    fn payload(args: Value) -> HandleFieldPayload {
        let args: Variables = serde_json::from_value(args).unwrap();
        let sorted: BTreeMap<String, Value> = args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let field_key = format_storage_key("feed", &sorted);
        HandleFieldPayload {
            data_id: DataId::root(),
            field_key,
            handle: "connection".into(),
            handle_key: "__Feed_feed_connection".into(),
            args,
            handle_args: Variables::new(),
        }
    }

    /// A server page under `field_key` with one edge per node id.
    fn page(field_key: &str, nodes: &[&str], end_cursor: &str, has_next: bool) -> Value {
        let conn_id = format!("client:root:{field_key}");
        let mut records = serde_json::Map::new();
        let mut edge_ids = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let edge_id = format!("{conn_id}:edges:{i}");
            records.insert(
                edge_id.clone(),
                json!({"__id": edge_id, "__typename": "FeedEdge", "cursor": format!("c-{node}"), "node": {"__ref": node}}),
            );
            records.insert(node.to_string(), json!({"__id": node, "__typename": "Story"}));
            edge_ids.push(edge_id);
        }
        let page_info_id = format!("{conn_id}:pageInfo");
        records.insert(
            page_info_id.clone(),
            json!({"__id": page_info_id, "endCursor": end_cursor, "hasNextPage": has_next}),
        );
        records.insert(
            conn_id.clone(),
            json!({"__id": conn_id, "__typename": "FeedConnection",
                   "edges": {"__refs": edge_ids}, "pageInfo": {"__ref": page_info_id}}),
        );
        records.insert(
            "client:root".into(),
            json!({"__id": "client:root", field_key: {"__ref": conn_id}}),
        );
        Value::Object(records)
    }

    fn merge_into(base: &mut RecordSource, delta: RecordSource) {
        for id in delta.record_ids() {
            match (base.get(&id), delta.get(&id)) {
                (Some(current), Some(next)) => {
                    let merged = current.update(next).unwrap().unwrap_or_else(|| current.clone());
                    base.set(merged);
                }
                (_, Some(next)) => base.set(next.clone()),
                (_, None) => base.delete(&id),
            }
        }
    }

    fn edge_nodes(proxy: &RecordSourceProxy) -> Vec<String> {
        let connection = proxy.get(&DataId::new(CONN)).unwrap();
        connection
            .get_linked_records(EDGES, None)
            .unwrap()
            .into_iter()
            .map(|edge| node_id(&edge.unwrap()).unwrap().to_string())
            .collect()
    }

    fn first_page() -> RecordSource {
        let mut base = source(page("feed(first:2)", &["s1", "s2"], "c-s2", true));
        let proxy = RecordSourceProxy::new(base.fork());
        ConnectionHandler.update(&proxy, &payload(json!({"first": 2})));
        merge_into(&mut base, proxy.into_result().sink);
        base
    }

    #[test]
    fn first_page_creates_client_connection() {
        let base = first_page();
        let proxy = RecordSourceProxy::new(base);
        assert_eq!(edge_nodes(&proxy), vec!["s1", "s2"]);
        let root = proxy.get(&DataId::root()).unwrap();
        assert_eq!(
            root.get_linked_record("__Feed_feed_connection", None).unwrap().data_id(),
            &DataId::new(CONN)
        );
        let connection = proxy.get(&DataId::new(CONN)).unwrap();
        assert_eq!(connection.get_value(NEXT_EDGE_INDEX, None), Some(json!(2)));
        let page_info = connection.get_linked_record(PAGE_INFO, None).unwrap();
        assert_eq!(page_info.get_value(END_CURSOR, None), Some(json!("c-s2")));
        assert_eq!(page_info.get_value(HAS_NEXT_PAGE, None), Some(json!(true)));
    }

    #[test]
    fn after_end_cursor_appends_and_dedupes() {
        let mut base = first_page();
        merge_into(&mut base, source(page("feed(after:\"c-s2\",first:2)", &["s2", "s3"], "c-s3", false)));
        let proxy = RecordSourceProxy::new(base);
        ConnectionHandler.update(&proxy, &payload(json!({"first": 2, "after": "c-s2"})));
        assert_eq!(edge_nodes(&proxy), vec!["s1", "s2", "s3"]);
        let page_info = proxy
            .get(&DataId::new(CONN))
            .unwrap()
            .get_linked_record(PAGE_INFO, None)
            .unwrap();
        assert_eq!(page_info.get_value(END_CURSOR, None), Some(json!("c-s3")));
        assert_eq!(page_info.get_value(HAS_NEXT_PAGE, None), Some(json!(false)));
    }

    #[test]
    fn unknown_cursor_is_ignored() {
        let mut base = first_page();
        merge_into(&mut base, source(page("feed(after:\"zzz\",first:2)", &["s9"], "c-s9", false)));
        let proxy = RecordSourceProxy::new(base);
        ConnectionHandler.update(&proxy, &payload(json!({"first": 2, "after": "zzz"})));
        assert_eq!(edge_nodes(&proxy), vec!["s1", "s2"]);
    }

    #[test]
    fn refetch_without_cursor_replaces() {
        let mut base = first_page();
        merge_into(&mut base, source(page("feed(first:2)", &["s7"], "c-s7", false)));
        let proxy = RecordSourceProxy::new(base);
        ConnectionHandler.update(&proxy, &payload(json!({"first": 2})));
        assert_eq!(edge_nodes(&proxy), vec!["s7"]);
    }

    #[test]
    fn edge_helpers() {
        let proxy = RecordSourceProxy::new(first_page());
        let connection = proxy.get(&DataId::new(CONN)).unwrap();
        let node = proxy.create(&DataId::new("s5"), "Story").unwrap();
        let edge = create_edge(&proxy, &connection, &node, "FeedEdge").unwrap();
        assert_eq!(edge.data_id(), &DataId::new(format!("{CONN}:s5")));
        insert_edge_before(&connection, &edge, None);
        assert_eq!(edge_nodes(&proxy), vec!["s5", "s1", "s2"]);

        delete_node(&connection, &DataId::new("s1"));
        assert_eq!(edge_nodes(&proxy), vec!["s5", "s2"]);

        let root = proxy.get(&DataId::root()).unwrap();
        assert_eq!(get_connection(&root, "Feed_feed", None).unwrap().data_id(), &DataId::new(CONN));
        assert_eq!(connection_id(&DataId::root(), "Feed_feed", None), DataId::new(CONN));
    }
}
