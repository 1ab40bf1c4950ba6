//! Paginating a `@connection` field through the publish queue, then
//! editing it with a declarative mutation directive.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use serde_json::{json, Value};

use relay_core::GraphQLResponse;
use relay_store::{PublishQueue, Snapshot, Store};

use common::{operation, request};

const CONNECTION: &str = "client:root:__Feed_feed_connection";

fn feed_args() -> Value {
    json!([
        {"kind": "Variable", "name": "first", "variableName": "count"},
        {"kind": "Variable", "name": "after", "variableName": "cursor"}
    ])
}

fn connection_selections() -> Value {
    json!([
        {
            "kind": "LinkedField", "name": "edges", "plural": true, "concreteType": "FeedEdge",
            "selections": [
                {"kind": "ScalarField", "name": "cursor"},
                {"kind": "LinkedField", "name": "node", "concreteType": "Story",
                    "selections": [{"kind": "ScalarField", "name": "id"}]}
            ]
        },
        {
            "kind": "LinkedField", "name": "pageInfo", "concreteType": "PageInfo",
            "selections": [
                {"kind": "ScalarField", "name": "endCursor"},
                {"kind": "ScalarField", "name": "hasNextPage"}
            ]
        }
    ])
}

/// `feed(first: $count, after: $cursor) @connection(key: "Feed_feed")`
fn feed_query() -> std::sync::Arc<relay_core::ConcreteRequest> {
    let reader = json!([{
        "kind": "LinkedField", "alias": "feed", "name": "__Feed_feed_connection",
        "concreteType": "FeedConnection", "selections": connection_selections()
    }]);
    let normalization = json!([
        {
            "kind": "LinkedField", "name": "feed", "args": feed_args(),
            "concreteType": "FeedConnection", "selections": connection_selections()
        },
        {
            "kind": "LinkedHandle", "name": "feed", "args": feed_args(),
            "handle": "connection", "key": "Feed_feed", "filters": []
        }
    ]);
    request(
        "FeedQuery",
        "query",
        reader,
        normalization,
        json!([
            {"kind": "LocalArgument", "name": "count"},
            {"kind": "LocalArgument", "name": "cursor"}
        ]),
    )
}

/// `deleteStory(id: $id) { deletedId @deleteEdge(connections: [...]) }`
fn delete_story_mutation() -> std::sync::Arc<relay_core::ConcreteRequest> {
    let selections = json!([{
        "kind": "LinkedField", "name": "deleteStory", "concreteType": "DeleteStoryPayload",
        "args": [{"kind": "Variable", "name": "id", "variableName": "id"}],
        "selections": [
            {"kind": "ScalarField", "name": "deletedId"},
            {
                "kind": "ScalarHandle", "name": "deletedId", "handle": "deleteEdge",
                "handleArgs": [{"kind": "Literal", "name": "connections", "value": [CONNECTION]}]
            }
        ]
    }]);
    request(
        "DeleteStoryMutation",
        "mutation",
        selections.clone(),
        selections,
        json!([{"kind": "LocalArgument", "name": "id"}]),
    )
}

fn page(stories: &[(&str, &str)], end_cursor: &str, has_next_page: bool) -> GraphQLResponse {
    let edges: Vec<Value> = stories
        .iter()
        .map(|(id, cursor)| json!({"cursor": cursor, "node": {"id": id}}))
        .collect();
    GraphQLResponse::from_data(json!({
        "feed": {
            "edges": edges,
            "pageInfo": {"endCursor": end_cursor, "hasNextPage": has_next_page}
        }
    }))
}

fn edge_ids(snapshot: &Snapshot) -> Vec<Value> {
    let data = snapshot.data.clone().unwrap_or_default();
    data["feed"]["edges"]
        .as_array()
        .map(|edges| edges.iter().map(|edge| edge["node"]["id"].clone()).collect())
        .unwrap_or_default()
}

fn load_two_pages(store: &Store, queue: &mut PublishQueue) -> relay_core::OperationDescriptor {
    let first = operation(&feed_query(), json!({"count": 2, "cursor": null}));
    queue
        .commit_payload(&first, &page(&[("s1", "c1"), ("s2", "c2")], "c2", true), None)
        .unwrap();
    queue.run(Some(&first)).unwrap();

    let second = operation(&feed_query(), json!({"count": 2, "cursor": "c2"}));
    queue
        .commit_payload(&second, &page(&[("s3", "c3"), ("s4", "c4")], "c4", false), None)
        .unwrap();
    queue.run(Some(&second)).unwrap();
    assert!(!store.lookup(&first.fragment).is_missing_data);
    first
}

#[test]
fn pages_accumulate_in_the_client_connection() {
    let store = Store::default();
    let mut queue = PublishQueue::new(store.clone());
    let first = load_two_pages(&store, &mut queue);

    let snapshot = store.lookup(&first.fragment);
    assert_eq!(edge_ids(&snapshot), vec![json!("s1"), json!("s2"), json!("s3"), json!("s4")]);
    let data = snapshot.data.unwrap();
    assert_eq!(data["feed"]["edges"][3]["cursor"], json!("c4"));
    assert_eq!(data["feed"]["pageInfo"], json!({"endCursor": "c4", "hasNextPage": false}));
}

#[test]
fn stale_cursor_page_is_ignored() {
    let store = Store::default();
    let mut queue = PublishQueue::new(store.clone());
    let first = load_two_pages(&store, &mut queue);

    let stale = operation(&feed_query(), json!({"count": 2, "cursor": "c1"}));
    queue
        .commit_payload(&stale, &page(&[("s9", "c9")], "c9", true), None)
        .unwrap();
    queue.run(Some(&stale)).unwrap();

    let snapshot = store.lookup(&first.fragment);
    assert_eq!(edge_ids(&snapshot), vec![json!("s1"), json!("s2"), json!("s3"), json!("s4")]);
}

#[test]
fn delete_edge_directive_removes_the_node_from_the_connection() {
    let store = Store::default();
    let mut queue = PublishQueue::new(store.clone());
    let first = load_two_pages(&store, &mut queue);

    let hits = Rc::new(Cell::new(0));
    let counter = hits.clone();
    let _subscription = store.subscribe(store.lookup(&first.fragment), move |_: &Snapshot| {
        counter.set(counter.get() + 1)
    });

    let delete = operation(&delete_story_mutation(), json!({"id": "s2"}));
    queue
        .commit_payload(
            &delete,
            &GraphQLResponse::from_data(json!({"deleteStory": {"deletedId": "s2"}})),
            None,
        )
        .unwrap();
    queue.run(Some(&delete)).unwrap();

    assert_eq!(hits.get(), 1);
    let snapshot = store.lookup(&first.fragment);
    assert_eq!(edge_ids(&snapshot), vec![json!("s1"), json!("s3"), json!("s4")]);
    // The node record itself survives; only the edge is gone.
    assert!(store.get_source().has(&relay_core::DataId::new("s2")));
}
