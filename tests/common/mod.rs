//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use varv::concept::Concept;
use varv::datastore::DatastoreContext;
use varv::property::Property;
use varv::{Context, Datastore, DatastoreError, Engine, EngineConfig, InstanceQuery, MemoryDatastore, Value, VarvResult};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An engine with the default config and `spec` loaded.
pub async fn engine_with(spec: serde_json::Value) -> Arc<Engine> {
    init_tracing();
    let engine = Engine::with_defaults().unwrap();
    engine.load_spec(&spec).await.unwrap();
    engine
}

/// An engine with a probe store type registered and `spec` loaded.
pub async fn probed_engine(spec: serde_json::Value) -> (Arc<Engine>, StoreProbe) {
    init_tracing();
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let probe = StoreProbe::default();
    probe.install(&engine);
    engine.load_spec(&spec).await.unwrap();
    (engine, probe)
}

pub async fn create(engine: &Engine, concept: &str, values: serde_json::Value) -> String {
    let concept = engine.require_concept(concept).unwrap();
    let values: BTreeMap<String, Value> = match values {
        serde_json::Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect(),
        _ => BTreeMap::new(),
    };
    concept.create(engine, None, values).await.unwrap()
}

pub async fn read(engine: &Engine, uuid: &str, property: &str) -> Value {
    let lookup = engine.resolve_property(Some(uuid), None, property).await.unwrap();
    engine.get_property_value(&lookup).await.unwrap()
}

pub fn targets(contexts: &[Context]) -> Vec<String> {
    contexts.iter().filter_map(|c| c.target.clone()).collect()
}

/// Polls `check` until it holds or about a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Registers the `probe` datastore type and keeps a handle on every store
/// it builds, counting instance lookups across all of them.
#[derive(Clone, Default)]
pub struct StoreProbe {
    stores: Arc<Mutex<BTreeMap<String, Arc<MemoryDatastore>>>>,
    lookups: Arc<AtomicUsize>,
}

impl StoreProbe {
    pub const KIND: &'static str = "probe";

    pub fn install(&self, engine: &Engine) {
        let probe = self.clone();
        engine
            .register_datastore_type(
                Self::KIND,
                Arc::new(move |name: &str, options: &serde_json::Value, ctx: &DatastoreContext| {
                    let inner = Arc::new(MemoryDatastore::from_options(name, options, ctx.events.clone())?);
                    probe.stores.lock().unwrap().insert(name.to_string(), Arc::clone(&inner));
                    Ok(Arc::new(ProbeDatastore {
                        inner,
                        lookups: Arc::clone(&probe.lookups),
                    }) as Arc<dyn Datastore>)
                }),
            )
            .unwrap();
    }

    pub fn store(&self, name: &str) -> Arc<MemoryDatastore> {
        Arc::clone(self.stores.lock().unwrap().get(name).unwrap())
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn reset_lookups(&self) {
        self.lookups.store(0, Ordering::SeqCst);
    }
}

struct ProbeDatastore {
    inner: Arc<MemoryDatastore>,
    lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl Datastore for ProbeDatastore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> &str {
        StoreProbe::KIND
    }

    async fn init(&self) -> Result<(), DatastoreError> {
        self.inner.init().await
    }

    async fn destroy(&self) -> Result<(), DatastoreError> {
        self.inner.destroy().await
    }

    async fn load_backing_store(&self) -> Result<Vec<(String, String)>, DatastoreError> {
        self.inner.load_backing_store().await
    }

    async fn create_backing_store(&self, concept: &Concept, property: &Property) -> Result<(), DatastoreError> {
        self.inner.create_backing_store(concept, property).await
    }

    async fn remove_backing_store(&self, concept: &Concept, property: &Property) -> Result<(), DatastoreError> {
        self.inner.remove_backing_store(concept, property).await
    }

    async fn lookup_concept(&self, uuid: &str) -> Result<Option<String>, DatastoreError> {
        self.inner.lookup_concept(uuid).await
    }

    async fn lookup_instances(&self, engine: &Engine, query: &InstanceQuery<'_>) -> VarvResult<Vec<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup_instances(engine, query).await
    }

    fn is_property_mapped(&self, concept: &str, property: &str) -> bool {
        self.inner.is_property_mapped(concept, property)
    }

    fn is_concept_type_mapped(&self, concept: &str) -> bool {
        self.inner.is_concept_type_mapped(concept)
    }

    async fn instance_appeared(&self, concept: &str, uuid: &str) -> Result<(), DatastoreError> {
        self.inner.instance_appeared(concept, uuid).await
    }

    async fn instance_disappeared(&self, concept: &str, uuid: &str) -> Result<(), DatastoreError> {
        self.inner.instance_disappeared(concept, uuid).await
    }
}
