//! Properties of publishing, of the optimistic layer over arbitrary record
//! edits, of normalize/read agreement and of collection safety.

mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use relay_core::{DataId, GraphQLResponse, Record};
use relay_store::{
    normalize, GcProgress, NormalizationOptions, OptimisticUpdate, PublishQueue, RecordSource, Store, StoreConfig,
};

use common::{me_query, operation, query, source, users_store};

/// Per id: `Some(name)` writes a `User` with that name, `None` deletes.
fn edits() -> impl Strategy<Value = BTreeMap<u8, Option<String>>> {
    proptest::collection::btree_map(1u8..5, proptest::option::of("[a-z]{0,6}"), 0..5)
}

fn edit_source(edits: &BTreeMap<u8, Option<String>>) -> RecordSource {
    let mut source = RecordSource::new();
    for (id, name) in edits {
        let id = DataId::new(id.to_string());
        match name {
            Some(name) => {
                let mut record = Record::new(id, Some("User"));
                record.set_scalar("name", json!(name));
                source.set(record);
            }
            None => source.delete(&id),
        }
    }
    source
}

/// `me { id name friends { id name } }` payloads. Friend names follow from
/// their ids so repeated friends agree with each other.
fn profiles() -> impl Strategy<Value = Value> {
    (
        "[a-z0-9]{1,6}",
        proptest::option::of("[A-Za-z ]{0,8}"),
        proptest::collection::vec(proptest::option::of(0u8..6), 0..6),
    )
        .prop_map(|(id, name, friends)| {
            let friends: Vec<Value> = friends
                .into_iter()
                .map(|friend| match friend {
                    Some(n) => json!({"id": format!("friend-{n}"), "name": format!("Friend {n}")}),
                    None => Value::Null,
                })
                .collect();
            json!({"me": {"id": format!("me-{id}"), "name": name, "friends": friends}})
        })
}

fn profile_query() -> std::sync::Arc<relay_core::ConcreteRequest> {
    query(
        "ProfileQuery",
        json!([{
            "kind": "LinkedField", "name": "me", "concreteType": "User",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "name"},
                {
                    "kind": "LinkedField", "name": "friends", "plural": true, "concreteType": "User",
                    "selections": [
                        {"kind": "ScalarField", "name": "id"},
                        {"kind": "ScalarField", "name": "name"}
                    ]
                }
            ]
        }]),
    )
}

/// Unreferenced `User` records keyed `orphan-<n>`.
fn orphans() -> impl Strategy<Value = BTreeMap<u8, String>> {
    proptest::collection::btree_map(any::<u8>(), "[a-z]{1,6}", 0..12)
}

proptest! {
    #[test]
    fn normalized_payloads_read_back_unchanged(data in profiles()) {
        let op = operation(&profile_query(), json!({}));
        let response = GraphQLResponse::from_data(data.clone());
        let result = normalize(&op.root, &response, &NormalizationOptions::default()).unwrap();
        prop_assert!(result.errors.is_empty());

        let store = Store::default();
        store.publish(&result.source, &[]).unwrap();
        store.notify(Some(&op), false);
        let snapshot = store.lookup(&op.fragment);
        prop_assert!(!snapshot.is_missing_data);
        prop_assert_eq!(snapshot.data, Some(data));
    }

    #[test]
    fn collection_keeps_everything_a_retained_query_reads(
        orphans in orphans(),
        budget in 1usize..4,
        slices_before_retain in 0usize..6,
    ) {
        let config = StoreConfig {
            gc_slice_budget: budget,
            gc_release_buffer_size: 0,
            ..StoreConfig::default()
        };
        let store = Store::new(users_store().get_source(), config);
        let mut extra = serde_json::Map::new();
        for (n, name) in &orphans {
            let id = format!("orphan-{n}");
            extra.insert(id.clone(), json!({"__id": id, "__typename": "User", "name": name}));
        }
        store.publish(&source(Value::Object(extra)), &[]).unwrap();
        store.notify(None, false);

        // Nothing is retained yet, so early slices may already sweep the
        // query's records; what it reads when retained must survive.
        let op = operation(&me_query(), json!({}));
        store.schedule_gc();
        for _ in 0..slices_before_retain {
            store.run_gc_slice();
        }
        let expected = store.lookup(&op.fragment);
        let _retained = store.retain(&op);
        store.schedule_gc();
        let mut progress = store.run_gc_slice();
        while progress == GcProgress::Pending {
            progress = store.run_gc_slice();
        }
        prop_assert!(matches!(progress, GcProgress::Finished { .. }), "gc did not finish");

        let snapshot = store.lookup(&op.fragment);
        prop_assert_eq!(snapshot.is_missing_data, expected.is_missing_data);
        prop_assert_eq!(snapshot.data, expected.data);
        let remaining = store.get_source();
        prop_assert!(orphans.keys().all(|n| !remaining.has(&DataId::new(format!("orphan-{n}")))), "orphan records survived gc");
    }


    #[test]
    fn republishing_the_same_records_changes_nothing(edits in edits()) {
        let store = users_store();
        let source = edit_source(&edits);
        store.publish(&source, &[]).unwrap();
        store.notify(None, false);
        let after_first = store.get_source();
        let epoch = store.current_write_epoch();

        store.publish(&source, &[]).unwrap();
        prop_assert_eq!(store.get_source(), after_first);
        prop_assert_eq!(store.current_write_epoch(), epoch);
    }

    #[test]
    fn reverting_an_optimistic_update_restores_the_visible_source(edits in edits()) {
        let store = users_store();
        let before = store.fork_source();
        let mut queue = PublishQueue::new(store.clone());

        let id = queue.apply_update(OptimisticUpdate::Source(edit_source(&edits)));
        queue.run(None).unwrap();
        prop_assert_eq!(store.get_source(), before.clone());

        queue.revert_update(id).unwrap();
        queue.run(None).unwrap();
        prop_assert!(!store.is_optimistic());
        prop_assert_eq!(store.fork_source(), before.clone());
        prop_assert_eq!(store.get_source(), before);
    }

    #[test]
    fn server_commits_survive_reverting_optimistic_updates(
        optimistic in edits(),
        server in "[A-Z][a-z]{0,6}",
    ) {
        let store = users_store();
        let mut queue = PublishQueue::new(store.clone());
        let id = queue.apply_update(OptimisticUpdate::Source(edit_source(&optimistic)));
        queue.run(None).unwrap();

        let mut commit = RecordSource::new();
        let mut alice = Record::new(DataId::new("1"), Some("User"));
        alice.set_scalar("name", json!(server.clone()));
        commit.set(alice);
        queue.commit_source(commit);
        queue.run(None).unwrap();

        queue.revert_update(id).unwrap();
        queue.run(None).unwrap();
        prop_assert_eq!(common::visible_name(&store, "1"), Some(json!(server)));
        prop_assert_eq!(common::visible_name(&store, "2"), Some(json!("Bob")));
    }
}
