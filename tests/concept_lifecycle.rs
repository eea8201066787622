//! Instance lifecycle, property validation and datastore fan-out.

mod common;

use std::collections::BTreeMap;

use common::{create, engine_with, probed_engine, read};
use serde_json::json;
use varv::{EngineEvent, ValidationError, Value, VarvError};

fn todo_spec() -> serde_json::Value {
    json!({
        "concepts": {
            "Todo": {
                "schema": {
                    "title": "string",
                    "done": {"boolean": {"default": false}},
                    "status": {"string": {"enum": ["open", "closed"], "default": "open"}},
                    "price": "number",
                    "qty": {"number": {"default": 1}},
                    "total": {"number": {"derive": "price * qty"}}
                }
            }
        }
    })
}

#[tokio::test]
async fn test_create_applies_defaults_and_publishes_appeared() {
    let engine = engine_with(todo_spec()).await;
    let mut events = engine.subscribe();

    let uuid = create(&engine, "Todo", json!({"title": "write tests"})).await;

    assert_eq!(read(&engine, &uuid, "title").await, Value::from("write tests"));
    assert_eq!(read(&engine, &uuid, "done").await, Value::Boolean(false));
    assert_eq!(read(&engine, &uuid, "status").await, Value::from("open"));
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::Appeared {
            concept: "Todo".into(),
            uuid: uuid.clone()
        }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_create_rejects_value_outside_enum() {
    let engine = engine_with(todo_spec()).await;
    let mut events = engine.subscribe();
    let todo = engine.require_concept("Todo").unwrap();

    let mut values = BTreeMap::new();
    values.insert("status".to_string(), Value::from("archived"));
    let err = todo.create(&engine, None, values).await.unwrap_err();

    assert!(matches!(err, VarvError::Validation(ValidationError::NotInEnum { .. })));
    assert!(events.try_recv().is_err());
    assert_eq!(engine.registry().instance_count().unwrap(), 0);
}

#[tokio::test]
async fn test_delete_publishes_one_disappeared_and_evicts() {
    let engine = engine_with(todo_spec()).await;
    let uuid = create(&engine, "Todo", json!({})).await;
    let mut events = engine.subscribe();

    let todo = engine.require_concept("Todo").unwrap();
    todo.delete(&engine, &uuid).await.unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::Disappeared {
            concept: "Todo".into(),
            uuid: uuid.clone()
        }
    );
    assert!(events.try_recv().is_err());
    assert!(engine.get_concept_from_uuid(&uuid).await.unwrap().is_none());

    todo.delete(&engine, &uuid).await.unwrap();
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_same_value_write_is_reported_once() {
    let engine = engine_with(todo_spec()).await;
    let uuid = create(&engine, "Todo", json!({"title": "a"})).await;
    let mut events = engine.subscribe();

    let lookup = engine.resolve_property(Some(&uuid), None, "title").await.unwrap();
    let first = engine.set_property_value(&lookup, &Value::from("b")).await.unwrap();
    let second = engine.set_property_value(&lookup, &Value::from("b")).await.unwrap();

    assert!(first.changed());
    assert!(!second.changed());
    match events.try_recv().unwrap() {
        EngineEvent::PropertyChanged {
            property,
            value,
            previous,
            ..
        } => {
            assert_eq!(property, "title");
            assert_eq!(value, Value::from("b"));
            assert_eq!(previous, Value::from("a"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_values_are_cast_to_the_declared_type() {
    let engine = engine_with(todo_spec()).await;
    let uuid = create(&engine, "Todo", json!({"price": "2.5", "done": "true"})).await;

    assert_eq!(read(&engine, &uuid, "price").await, Value::Number(2.5));
    assert_eq!(read(&engine, &uuid, "done").await, Value::Boolean(true));

    let lookup = engine.resolve_property(Some(&uuid), None, "price").await.unwrap();
    let err = engine
        .set_property_value(&lookup, &Value::from("cheap"))
        .await
        .unwrap_err();
    assert!(matches!(err, VarvError::Validation(ValidationError::CastFailed { .. })));
}

#[tokio::test]
async fn test_derived_property_is_computed_and_read_only() {
    let engine = engine_with(todo_spec()).await;
    let uuid = create(&engine, "Todo", json!({"price": 3, "qty": 2})).await;

    assert_eq!(read(&engine, &uuid, "total").await, Value::Number(6.0));

    let lookup = engine.resolve_property(Some(&uuid), None, "total").await.unwrap();
    let err = engine
        .set_property_value(&lookup, &Value::Number(1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, VarvError::Validation(ValidationError::ReadOnly { .. })));
}

#[tokio::test]
async fn test_writes_fan_out_to_every_mapped_store() {
    let (engine, probe) = probed_engine(json!({
        "dataStores": {
            "primary": {"type": "probe"},
            "mirror": {"type": "probe"}
        },
        "concepts": {
            "Note": {
                "schema": {"body": "string", "draft": "boolean"},
                "mappings": {"body": ["primary", "mirror"], "draft": "primary"}
            }
        }
    }))
    .await;
    let uuid = create(&engine, "Note", json!({"body": "hello", "draft": true})).await;

    let primary = probe.store("primary");
    let mirror = probe.store("mirror");
    assert_eq!(primary.stored_value(&uuid, "body").unwrap(), Some(Value::from("hello")));
    assert_eq!(mirror.stored_value(&uuid, "body").unwrap(), Some(Value::from("hello")));
    assert_eq!(primary.stored_value(&uuid, "draft").unwrap(), Some(Value::Boolean(true)));
    assert_eq!(mirror.stored_value(&uuid, "draft").unwrap(), None);

    let note = engine.require_concept("Note").unwrap();
    assert_eq!(note.property("body").unwrap().datastore_names(), vec!["primary", "mirror"]);
    assert_eq!((primary.write_count(), mirror.write_count()), (2, 1));

    let lookup = engine.resolve_property(Some(&uuid), None, "body").await.unwrap();
    engine.set_property_value(&lookup, &Value::from("hello")).await.unwrap();
    assert_eq!((primary.write_count(), mirror.write_count()), (2, 1));

    engine.set_property_value(&lookup, &Value::from("bye")).await.unwrap();
    assert_eq!((primary.write_count(), mirror.write_count()), (3, 2));
    assert_eq!(mirror.stored_value(&uuid, "body").unwrap(), Some(Value::from("bye")));
}

#[tokio::test]
async fn test_framework_writes_do_not_echo_from_observers() {
    let (engine, probe) = probed_engine(json!({
        "dataStores": {"primary": {"type": "probe"}},
        "defaultMappings": ["primary"],
        "concepts": {"Note": {"schema": {"body": "string"}}}
    }))
    .await;
    let uuid = create(&engine, "Note", json!({"body": "one"})).await;
    let mut events = engine.subscribe();

    let lookup = engine.resolve_property(Some(&uuid), None, "body").await.unwrap();
    engine.set_property_value(&lookup, &Value::from("two")).await.unwrap();
    assert!(matches!(events.try_recv().unwrap(), EngineEvent::PropertyChanged { .. }));
    assert!(events.try_recv().is_err());

    probe.store("primary").external_set(&uuid, "body", "three").unwrap();
    match events.try_recv().unwrap() {
        EngineEvent::PropertyChanged { concept, value, .. } => {
            assert_eq!(concept, "Note");
            assert_eq!(value, Value::from("three"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(read(&engine, &uuid, "body").await, Value::from("three"));
}

#[tokio::test]
async fn test_clone_and_remove_through_actions() {
    let engine = engine_with(json!({
        "concepts": {
            "Item": {"schema": {"label": "string", "part": "Part"}},
            "Part": {"schema": {"code": "string"}}
        }
    }))
    .await;
    let part = create(&engine, "Part", json!({"code": "p1"})).await;
    let item = create(&engine, "Item", json!({"label": "box", "part": part})).await;

    let out = engine
        .run_chain(
            &[json!({"clone": {"deep": true}})],
            vec![varv::Context::with_target(item.as_str())],
            None,
        )
        .await
        .unwrap();
    let copy = out[0].target.clone().unwrap();
    assert_ne!(copy, item);
    assert_eq!(read(&engine, &copy, "label").await, Value::from("box"));
    let copied_part = read(&engine, &copy, "part").await;
    assert_ne!(copied_part, Value::from(part.as_str()));
    let copied_part = copied_part.as_str().unwrap().to_string();
    assert_eq!(read(&engine, &copied_part, "code").await, Value::from("p1"));

    let out = engine
        .run_chain(&[json!("remove")], vec![varv::Context::with_target(item.as_str())], None)
        .await
        .unwrap();
    assert!(out.is_empty());
    assert!(engine.get_concept_from_uuid(&item).await.unwrap().is_none());
    assert_eq!(read(&engine, &copy, "label").await, Value::from("box"));
}

#[tokio::test]
async fn test_set_type_keeps_shared_values() {
    let engine = engine_with(json!({
        "concepts": {
            "Draft": {"schema": {"title": "string", "words": "number"}},
            "Post": {"schema": {"title": "string", "likes": {"number": {"default": 0}}}}
        }
    }))
    .await;
    let uuid = create(&engine, "Draft", json!({"title": "Hi", "words": 12})).await;
    let mut events = engine.subscribe();

    engine
        .run_chain(&[json!({"setType": "Post"})], vec![varv::Context::with_target(uuid.as_str())], None)
        .await
        .unwrap();

    let concept = engine.get_concept_from_uuid(&uuid).await.unwrap().unwrap();
    assert_eq!(concept.name(), "Post");
    assert_eq!(read(&engine, &uuid, "title").await, Value::from("Hi"));
    assert_eq!(read(&engine, &uuid, "likes").await, Value::Number(0.0));
    let mut saw_type_change = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TypeChanged { from, to, .. } = event {
            assert_eq!((from.as_str(), to.as_str()), ("Draft", "Post"));
            saw_type_change = true;
        }
    }
    assert!(saw_type_change);
}
