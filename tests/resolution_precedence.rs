//! Property and action name resolution order.

mod common;

use common::{create, engine_with, read};
use serde_json::json;
use varv::{Context, ResolutionError, Value, VarvError};

fn spec() -> serde_json::Value {
    json!({
        "concepts": {
            "Settings": {
                "schema": {"theme": "string", "label": "string"}
            },
            "Card": {
                "schema": {"label": "string", "count": {"number": {"default": 0}}},
                "actions": {
                    "increment": [{"increment": "count"}],
                    "bump": ["increment"],
                    "rename": [{"set": {"label": "$name"}}]
                }
            },
            "Board": {
                "schema": {"title": "string"},
                "actions": {
                    "renameCard": [{"Card.rename": {"name": "renamed"}}]
                }
            }
        }
    })
}

#[tokio::test]
async fn test_target_property_wins_over_local_concept() {
    let engine = engine_with(spec()).await;
    create(&engine, "Settings", json!({"label": "settings"})).await;
    let card = create(&engine, "Card", json!({"label": "card"})).await;

    let lookup = engine
        .resolve_property(Some(&card), Some("Settings"), "label")
        .await
        .unwrap();
    assert_eq!(lookup.concept.name(), "Card");
    assert_eq!(engine.get_property_value(&lookup).await.unwrap(), Value::from("card"));
}

#[tokio::test]
async fn test_local_singleton_used_when_target_lacks_property() {
    let engine = engine_with(spec()).await;
    let settings = create(&engine, "Settings", json!({"theme": "dark"})).await;
    let card = create(&engine, "Card", json!({})).await;

    let lookup = engine
        .resolve_property(Some(&card), Some("Settings"), "theme")
        .await
        .unwrap();
    assert_eq!(lookup.concept.name(), "Settings");
    assert_eq!(lookup.target.as_deref(), Some(settings.as_str()));
}

#[tokio::test]
async fn test_global_scan_finds_undeclared_local_property() {
    let engine = engine_with(spec()).await;
    let board = create(&engine, "Board", json!({"title": "Sprint"})).await;

    let lookup = engine.resolve_property(None, Some("Card"), "title").await.unwrap();
    assert_eq!(lookup.concept.name(), "Board");
    assert_eq!(lookup.target.as_deref(), Some(board.as_str()));
    assert_eq!(engine.get_property_value(&lookup).await.unwrap(), Value::from("Sprint"));
}

#[tokio::test]
async fn test_dotted_name_uses_target_when_it_is_that_concept() {
    let engine = engine_with(spec()).await;
    let first = create(&engine, "Card", json!({"label": "first"})).await;
    let second = create(&engine, "Card", json!({"label": "second"})).await;

    let lookup = engine.resolve_property(Some(&second), None, "Card.label").await.unwrap();
    assert_eq!(lookup.target.as_deref(), Some(second.as_str()));

    let settings = create(&engine, "Settings", json!({})).await;
    let lookup = engine
        .resolve_property(Some(&settings), None, "Card.label")
        .await
        .unwrap();
    assert_eq!(lookup.target.as_deref(), Some(first.as_str()));
}

#[tokio::test]
async fn test_unknown_names_fail_to_resolve() {
    let engine = engine_with(spec()).await;

    let err = engine.resolve_property(None, None, "nothing").await.unwrap_err();
    assert!(matches!(
        err,
        VarvError::Resolution(ResolutionError::PropertyNotFound { .. })
    ));
    let err = engine.resolve_property(None, None, "Ghost.label").await.unwrap_err();
    assert!(matches!(
        err,
        VarvError::Resolution(ResolutionError::ConceptNotFound { .. })
    ));
    let err = engine
        .run_chain(&[json!("frobnicate")], vec![Context::new()], None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VarvError::Resolution(ResolutionError::ActionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_behaviour_named_like_primitive_calls_the_primitive() {
    let engine = engine_with(spec()).await;
    let card = create(&engine, "Card", json!({})).await;

    engine
        .dispatch("Card", "increment", vec![Context::with_target(card.as_str())])
        .await
        .unwrap();
    assert_eq!(read(&engine, &card, "count").await, Value::Number(1.0));

    engine
        .dispatch("Card", "bump", vec![Context::with_target(card.as_str())])
        .await
        .unwrap();
    assert_eq!(read(&engine, &card, "count").await, Value::Number(2.0));
}

#[tokio::test]
async fn test_dotted_action_binds_step_options_as_variables() {
    let engine = engine_with(spec()).await;
    let card = create(&engine, "Card", json!({"label": "old"})).await;

    engine
        .dispatch("Board", "renameCard", vec![Context::with_target(card.as_str())])
        .await
        .unwrap();
    assert_eq!(read(&engine, &card, "label").await, Value::from("renamed"));
}

#[tokio::test]
async fn test_dispatch_unknown_behaviour_reports_qualified_name() {
    let engine = engine_with(spec()).await;
    let err = engine.dispatch("Card", "missing", vec![Context::new()]).await.unwrap_err();
    match err {
        VarvError::Resolution(ResolutionError::ActionNotFound { name }) => assert_eq!(name, "Card.missing"),
        other => panic!("unexpected error {other:?}"),
    }
}
