//! Reload from merged sources: serialization, debounce and reporting.

mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{create, init_tracing};
use serde_json::json;
use varv::{
    Engine, EngineConfig, EngineEvent, FileSpec, ReloadReport, SpecSource, StaticSpec, VarvError, VarvResult,
};

/// Records how many fetches overlap.
#[derive(Default)]
struct SlowSpec {
    active: AtomicUsize,
    peak: AtomicUsize,
    fetches: AtomicUsize,
}

#[async_trait]
impl SpecSource for SlowSpec {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch(&self) -> VarvResult<serde_json::Value> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({"concepts": {"Slow": {"schema": {"n": "number"}}}}))
    }
}

fn engine_with_debounce(ms: u64) -> Arc<Engine> {
    init_tracing();
    Engine::new(EngineConfig {
        reload_debounce_ms: ms,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn recorder(engine: &Engine) -> Arc<Mutex<Vec<ReloadReport>>> {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    engine
        .add_reload_listener(Arc::new(move |report: &ReloadReport| {
            sink.lock().unwrap().push(report.clone());
        }))
        .unwrap();
    reports
}

#[tokio::test]
async fn test_reload_merges_sources_in_order() {
    let engine = engine_with_debounce(10);
    let reports = recorder(&engine);
    engine
        .add_source(Arc::new(StaticSpec::new(
            "base",
            json!({"concepts": {"Todo": {
                "schema": {"title": "string"},
                "actions": {"go": {"when": ["appeared"], "then": [{"set": {"title": "one"}}]}}
            }}}),
        )))
        .unwrap();
    engine
        .add_source(Arc::new(StaticSpec::new(
            "extra",
            json!({"concepts": {
                "Todo": {
                    "schema": {"done": "boolean"},
                    "actions": {"go": {"then": [{"set": {"done": true}}]}}
                },
                "Tag": {"schema": {"name": "string"}}
            }}),
        )))
        .unwrap();
    let mut events = engine.subscribe();

    let report = engine.reload().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.generation, 1);
    assert_eq!(report.sources, 2);
    assert_eq!(report.summary.map(|s| s.concepts), Some(2));
    assert!(report.unresolved_conflicts.is_empty());
    assert_eq!(events.try_recv().unwrap(), EngineEvent::EngineReloaded { generation: 1 });

    let todo = engine.require_concept("Todo").unwrap();
    assert_eq!(todo.property_names(), vec!["title", "done"]);
    assert_eq!(todo.behaviour("go").unwrap().chain().len(), 2);
    assert_eq!(reports.lock().unwrap().as_slice(), &[report]);
}

#[tokio::test]
async fn test_unresolved_conflicts_keep_last_fragment() {
    let engine = engine_with_debounce(10);
    for (name, allowed) in [("first", json!(["a"])), ("second", json!(["a", "b"]))] {
        engine
            .add_source(Arc::new(StaticSpec::new(
                name,
                json!({"concepts": {"Item": {"schema": {"kind": {"string": {"enum": allowed}}}}}}),
            )))
            .unwrap();
    }

    let report = engine.reload().await.unwrap();

    assert_eq!(report.unresolved_conflicts, vec!["concepts.Item.schema.kind.string.enum".to_string()]);
    let item = engine.require_concept("Item").unwrap();
    let kind = item.property("kind").unwrap();
    assert!(kind.validate(&varv::Value::from("b")).is_ok());
}

#[tokio::test]
async fn test_concurrent_reloads_run_one_at_a_time() {
    let engine = engine_with_debounce(10);
    let source = Arc::new(SlowSpec::default());
    engine.add_source(Arc::clone(&source) as Arc<dyn SpecSource>).unwrap();

    let e1 = Arc::clone(&engine);
    let e2 = Arc::clone(&engine);
    let (first, second) = tokio::join!(
        async move { e1.reload().await },
        async move { e2.reload().await }
    );

    let mut generations = vec![first.unwrap().generation, second.unwrap().generation];
    generations.sort_unstable();
    assert_eq!(generations, vec![1, 2]);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(source.peak.load(Ordering::SeqCst), 1);
    assert_eq!(engine.completed_reloads(), 2);
}

#[tokio::test]
async fn test_reload_discards_previous_instances() {
    let engine = engine_with_debounce(10);
    engine
        .add_source(Arc::new(StaticSpec::new("only", json!({"concepts": {"Note": {"schema": {"body": "string"}}}}))))
        .unwrap();
    engine.reload().await.unwrap();
    let note = create(&engine, "Note", json!({"body": "gone soon"})).await;
    assert_eq!(engine.registry().instance_count().unwrap(), 1);

    engine.reload().await.unwrap();

    assert_eq!(engine.registry().instance_count().unwrap(), 0);
    assert!(engine.get_concept_from_uuid(&note).await.unwrap().is_none());
    assert!(engine.require_concept("Note").is_ok());
}

#[tokio::test]
async fn test_scheduled_reloads_are_debounced() {
    let engine = engine_with_debounce(30);
    let source = Arc::new(SlowSpec::default());
    engine.add_source(Arc::clone(&source) as Arc<dyn SpecSource>).unwrap();

    let handles = vec![
        engine.schedule_reload().unwrap(),
        engine.schedule_reload().unwrap(),
        engine.schedule_reload().unwrap(),
    ];
    let mut ran = Vec::new();
    for handle in handles {
        ran.push(handle.await.unwrap().is_some());
    }

    assert_eq!(ran, vec![false, false, true]);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(engine.completed_reloads(), 1);
}

#[tokio::test]
async fn test_file_source_is_read_on_every_reload() {
    let engine = engine_with_debounce(10);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", json!({"concepts": {"Page": {"schema": {"title": "string"}}}})).unwrap();
    file.flush().unwrap();
    engine.add_source(Arc::new(FileSpec::new(file.path()))).unwrap();

    engine.reload().await.unwrap();
    assert!(engine.require_concept("Page").is_ok());

    std::fs::write(file.path(), json!({"concepts": {"Post": {}}}).to_string()).unwrap();
    engine.reload().await.unwrap();
    assert!(engine.get_concept("Page").is_none());
    assert!(engine.require_concept("Post").is_ok());
}

#[tokio::test]
async fn test_failed_reload_is_reported_to_listeners() {
    let engine = engine_with_debounce(10);
    let reports = recorder(&engine);
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "{ not json").unwrap();
    engine.add_source(Arc::new(FileSpec::new(file.path()))).unwrap();

    let err = engine.reload().await.unwrap_err();

    assert!(matches!(err, VarvError::Spec(varv::SpecError::Source { .. })));
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].is_success());
    assert!(reports[0].summary.is_none());
    assert_eq!(engine.completed_reloads(), 1);
}
