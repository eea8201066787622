//! Instance selection, filtering and aggregate queries.

mod common;

use common::{create, engine_with, probed_engine, read, targets};
use serde_json::json;
use varv::{Context, Value, VarvError};

fn board_spec() -> serde_json::Value {
    json!({
        "concepts": {
            "Task": {
                "schema": {
                    "title": "string",
                    "done": {"boolean": {"default": false}},
                    "rank": "number",
                    "tags": {"array": {"items": "string", "default": []}}
                }
            },
            "Bug": {
                "schema": {"severity": "number"},
                "extensions": {"inject": "Task"}
            }
        }
    })
}

#[tokio::test]
async fn test_select_is_polymorphic_unless_others_are_excluded() {
    let engine = engine_with(board_spec()).await;
    let task = create(&engine, "Task", json!({"title": "plain"})).await;
    let bug = create(&engine, "Bug", json!({"title": "crash"})).await;

    let out = engine
        .run_chain(&[json!({"select": "Task"})], vec![Context::new()], None)
        .await
        .unwrap();
    assert_eq!(targets(&out), vec![task.clone(), bug.clone()]);
    assert_eq!(out[0].concept_uuids, vec![task.clone(), bug.clone()]);

    let out = engine
        .run_chain(
            &[json!({"select": {"concept": "Task", "includeOthers": false}})],
            vec![Context::new()],
            None,
        )
        .await
        .unwrap();
    assert_eq!(targets(&out), vec![task]);
}

#[tokio::test]
async fn test_select_where_then_set_updates_matches() {
    let engine = engine_with(board_spec()).await;
    let open = create(&engine, "Task", json!({"title": "open", "rank": 2})).await;
    let closed = create(&engine, "Task", json!({"title": "closed", "done": true, "rank": 1})).await;

    engine
        .run_chain(
            &[
                json!({"select": {"concept": "Task", "where": {"property": "done", "equals": false}}}),
                json!({"set": {"title": "touched"}}),
            ],
            vec![Context::new()],
            None,
        )
        .await
        .unwrap();

    assert_eq!(read(&engine, &open, "title").await, Value::from("touched"));
    assert_eq!(read(&engine, &closed, "title").await, Value::from("closed"));
}

#[tokio::test]
async fn test_where_combinators_and_variables() {
    let engine = engine_with(board_spec()).await;
    let a = create(&engine, "Task", json!({"title": "alpha", "rank": 5, "tags": ["ui"]})).await;
    create(&engine, "Task", json!({"title": "beta", "rank": 1, "tags": ["db"]})).await;
    let c = create(&engine, "Bug", json!({"title": "gamma", "rank": 9, "tags": ["ui", "db"]})).await;

    let out = engine
        .run_chain(
            &[
                json!({"select": "Task"}),
                json!({"where": {"and": [
                    {"property": "rank", "greaterThan": "$min"},
                    {"property": "tags", "includes": "ui"}
                ]}}),
            ],
            vec![Context::new().with_variable("min", 2)],
            None,
        )
        .await
        .unwrap();
    assert_eq!(targets(&out), vec![a.clone(), c.clone()]);

    let out = engine
        .run_chain(
            &[
                json!({"select": "Task"}),
                json!({"where": {"or": [
                    {"concept": "Bug", "includeOthers": false},
                    {"property": "title", "startsWith": "al"}
                ]}}),
            ],
            vec![Context::new()],
            None,
        )
        .await
        .unwrap();
    assert_eq!(targets(&out), vec![a, c]);
}

#[tokio::test]
async fn test_filter_rejects_operator_for_property_type() {
    let engine = engine_with(board_spec()).await;
    create(&engine, "Task", json!({"title": "x"})).await;

    let err = engine
        .run_chain(
            &[json!({"select": {"concept": "Task", "where": {"property": "done", "startsWith": "t"}}})],
            vec![Context::new()],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VarvError::Filter(_)));
}

#[tokio::test]
async fn test_stop_if_empty_stops_the_behaviour() {
    let engine = engine_with(json!({
        "concepts": {
            "Task": {
                "schema": {"done": "boolean"},
                "actions": {
                    "finish": [
                        {"select": {"concept": "Task", "where": {"property": "done", "equals": false}, "stopIfEmpty": true}},
                        {"set": {"done": true}}
                    ]
                }
            }
        }
    }))
    .await;
    create(&engine, "Task", json!({"done": true})).await;

    let outcome = engine.dispatch("Task", "finish", vec![Context::new()]).await.unwrap();
    assert!(outcome.is_stopped());
    assert!(outcome.contexts().is_empty());
}

#[tokio::test]
async fn test_bulk_select_queries_once_for_all_contexts() {
    let (engine, probe) = probed_engine(json!({
        "dataStores": {"tracked": {"type": "probe"}},
        "defaultMappings": ["tracked"],
        "concepts": {"Item": {"schema": {"n": "number"}}}
    }))
    .await;
    let mut items = Vec::new();
    for n in 0..2 {
        items.push(create(&engine, "Item", json!({"n": n})).await);
    }
    let incoming = vec![Context::new(); 3];

    probe.reset_lookups();
    let bulk = engine
        .run_chain(&[json!({"select": "Item"})], incoming.clone(), None)
        .await
        .unwrap();
    assert_eq!(probe.lookups(), 1);
    assert_eq!(bulk.len(), 6);

    probe.reset_lookups();
    let each = engine
        .run_chain(&[json!({"select": {"concept": "Item", "forEach": true}})], incoming, None)
        .await
        .unwrap();
    assert_eq!(probe.lookups(), 3);
    assert_eq!(targets(&each), targets(&bulk));
}

#[tokio::test]
async fn test_count_and_exists_bind_variables() {
    let engine = engine_with(board_spec()).await;
    create(&engine, "Task", json!({"done": true})).await;
    create(&engine, "Task", json!({"done": false})).await;
    create(&engine, "Bug", json!({"done": true})).await;

    let out = engine
        .run_chain(
            &[
                json!({"count": {"concept": "Task", "where": {"property": "done", "equals": true}}}),
                json!({"exists": {"concept": "Bug", "where": {"property": "done", "equals": false}, "as": "openBug"}}),
            ],
            vec![Context::new()],
            None,
        )
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].variable("count").unwrap(), &Value::Number(2.0));
    assert_eq!(out[0].variable("openBug").unwrap(), &Value::Boolean(false));
}

#[tokio::test]
async fn test_sort_orders_contexts_by_property() {
    let engine = engine_with(board_spec()).await;
    let low = create(&engine, "Task", json!({"rank": 1})).await;
    let high = create(&engine, "Task", json!({"rank": 7})).await;
    let mid = create(&engine, "Task", json!({"rank": 4})).await;

    let out = engine
        .run_chain(
            &[json!({"select": "Task"}), json!({"sort": {"by": "rank", "order": "desc"}})],
            vec![Context::new()],
            None,
        )
        .await
        .unwrap();
    assert_eq!(targets(&out), vec![high, mid, low]);
}

#[tokio::test]
async fn test_limit_truncates_selection() {
    let engine = engine_with(board_spec()).await;
    let first = create(&engine, "Task", json!({})).await;
    create(&engine, "Task", json!({})).await;

    let out = engine
        .run_chain(&[json!({"select": {"concept": "Task", "limit": 1}})], vec![Context::new()], None)
        .await
        .unwrap();
    assert_eq!(targets(&out), vec![first]);
}
