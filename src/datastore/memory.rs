//! In-memory datastore.
//!
//! Thread-safe reference implementation of the [`Datastore`] contract, used
//! as the default backend and in tests. It models an observer-driven store:
//! every write it sees is reported as a `PropertyChanged` event unless the
//! write happened inside an observerless section, which is how the
//! framework's own writes avoid echoing back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::concept::Concept;
use crate::datastore::{Datastore, DatastoreError, InstanceQuery, ObserverSwitch};
use crate::engine::Engine;
use crate::error::VarvResult;
use crate::event::{EngineEvent, EventBus};
use crate::property::{Property, PropertyBackend, SetOutcome};
use crate::value::Value;

fn lock_err(datastore: &str) -> DatastoreError {
    DatastoreError::backend(datastore, "poisoned lock")
}

#[derive(Debug, Clone, Deserialize)]
struct SeedInstance {
    uuid: String,
    concept: String,
    #[serde(default)]
    values: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryOptions {
    #[serde(default = "default_skip_unchanged")]
    skip_unchanged: bool,
    #[serde(default)]
    instances: Vec<SeedInstance>,
}

const fn default_skip_unchanged() -> bool {
    true
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            skip_unchanged: true,
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryInstance {
    concept: String,
    values: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// concept -> mapped properties
    mapped: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
    instances: HashMap<String, MemoryInstance>,
}

impl MemoryState {
    fn insert(&mut self, uuid: &str, concept: &str) {
        match self.instances.get_mut(uuid) {
            Some(existing) => existing.concept = concept.to_string(),
            None => {
                self.order.push(uuid.to_string());
                self.instances.insert(
                    uuid.to_string(),
                    MemoryInstance {
                        concept: concept.to_string(),
                        values: BTreeMap::new(),
                    },
                );
            }
        }
    }

    fn remove(&mut self, uuid: &str) {
        if self.instances.remove(uuid).is_some() {
            self.order.retain(|u| u != uuid);
        }
    }
}

struct MemoryInner {
    name: String,
    skip_unchanged: bool,
    seed: Vec<SeedInstance>,
    events: EventBus,
    observer: ObserverSwitch,
    writes: AtomicUsize,
    state: RwLock<MemoryState>,
}

impl MemoryInner {
    /// Applies a write and reports it if the observer is on.
    fn write(&self, uuid: &str, concept: &str, property: &str, value: &Value) -> Result<SetOutcome, DatastoreError> {
        let previous = {
            let mut state = self.state.write().map_err(|_| lock_err(&self.name))?;
            state.insert(uuid, concept);
            let instance = state
                .instances
                .get_mut(uuid)
                .ok_or_else(|| DatastoreError::UnknownInstance {
                    datastore: self.name.clone(),
                    uuid: uuid.to_string(),
                })?;
            let previous = instance.values.get(property).cloned().unwrap_or_default();
            if self.skip_unchanged
                && instance.values.contains_key(property)
                && Property::is_same(value, &previous)
            {
                return Ok(SetOutcome::Unchanged);
            }
            instance.values.insert(property.to_string(), value.clone());
            previous
        };
        self.writes.fetch_add(1, Ordering::SeqCst);

        if self.observer.is_enabled() {
            debug!(datastore = %self.name, %uuid, %property, "observed external write");
            self.events.publish(EngineEvent::PropertyChanged {
                concept: concept.to_string(),
                uuid: uuid.to_string(),
                property: property.to_string(),
                value: value.clone(),
                previous,
            });
        }
        Ok(SetOutcome::Written)
    }
}

struct MemoryBackend {
    inner: Arc<MemoryInner>,
    concept: String,
    property: String,
}

#[async_trait]
impl PropertyBackend for MemoryBackend {
    async fn get(&self, uuid: &str) -> Result<Option<Value>, DatastoreError> {
        let state = self.inner.state.read().map_err(|_| lock_err(&self.inner.name))?;
        Ok(state
            .instances
            .get(uuid)
            .and_then(|i| i.values.get(&self.property))
            .cloned())
    }

    async fn set(&self, uuid: &str, value: &Value) -> Result<SetOutcome, DatastoreError> {
        self.inner
            .observer
            .observerless(|| self.inner.write(uuid, &self.concept, &self.property, value))
    }
}

/// Thread-safe in-memory datastore.
pub struct MemoryDatastore {
    inner: Arc<MemoryInner>,
}

impl MemoryDatastore {
    /// Type name this store registers under.
    pub const KIND: &'static str = "memory";

    /// Creates an empty store that suppresses same-value writes.
    #[must_use]
    pub fn new(name: impl Into<String>, events: EventBus) -> Self {
        Self::with_options(name.into(), MemoryOptions::default(), events)
    }

    /// Creates a store from declared options.
    ///
    /// Recognized keys: `skipUnchanged` (default `true`) and `instances`, a
    /// list of `{uuid, concept, values}` discovered by `load_backing_store`.
    pub fn from_options(name: &str, options: &serde_json::Value, events: EventBus) -> Result<Self, DatastoreError> {
        let parsed = if options.is_null() {
            MemoryOptions::default()
        } else {
            MemoryOptions::deserialize(options).map_err(|e| DatastoreError::InvalidOptions {
                datastore: name.to_string(),
                reason: e.to_string(),
            })?
        };
        Ok(Self::with_options(name.to_string(), parsed, events))
    }

    fn with_options(name: String, options: MemoryOptions, events: EventBus) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name,
                skip_unchanged: options.skip_unchanged,
                seed: options.instances,
                events,
                observer: ObserverSwitch::new(),
                writes: AtomicUsize::new(0),
                state: RwLock::new(MemoryState::default()),
            }),
        }
    }

    /// Total writes performed, excluding suppressed same-value writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Raw stored value, bypassing the property layer.
    pub fn stored_value(&self, uuid: &str, property: &str) -> Result<Option<Value>, DatastoreError> {
        let state = self.inner.state.read().map_err(|_| lock_err(&self.inner.name))?;
        Ok(state
            .instances
            .get(uuid)
            .and_then(|i| i.values.get(property))
            .cloned())
    }

    /// Simulates a write made outside the framework.
    ///
    /// The store's observer reports it as a `PropertyChanged` event.
    pub fn external_set(&self, uuid: &str, property: &str, value: impl Into<Value>) -> Result<SetOutcome, DatastoreError> {
        let concept = {
            let state = self.inner.state.read().map_err(|_| lock_err(&self.inner.name))?;
            state
                .instances
                .get(uuid)
                .map(|i| i.concept.clone())
                .ok_or_else(|| DatastoreError::UnknownInstance {
                    datastore: self.inner.name.clone(),
                    uuid: uuid.to_string(),
                })?
        };
        self.inner.write(uuid, &concept, property, &value.into())
    }

    /// Number of instances currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.read().map(|s| s.order.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn init(&self) -> Result<(), DatastoreError> {
        let mut state = self.inner.state.write().map_err(|_| lock_err(&self.inner.name))?;
        for seed in &self.inner.seed {
            state.mapped.entry(seed.concept.clone()).or_default();
            state.insert(&seed.uuid, &seed.concept);
            if let Some(instance) = state.instances.get_mut(&seed.uuid) {
                instance.values.extend(seed.values.clone());
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), DatastoreError> {
        let mut state = self.inner.state.write().map_err(|_| lock_err(&self.inner.name))?;
        *state = MemoryState::default();
        Ok(())
    }

    async fn load_backing_store(&self) -> Result<Vec<(String, String)>, DatastoreError> {
        let state = self.inner.state.read().map_err(|_| lock_err(&self.inner.name))?;
        Ok(state
            .order
            .iter()
            .filter_map(|uuid| {
                let instance = state.instances.get(uuid)?;
                state
                    .mapped
                    .contains_key(&instance.concept)
                    .then(|| (instance.concept.clone(), uuid.clone()))
            })
            .collect())
    }

    async fn create_backing_store(&self, concept: &Concept, property: &Property) -> Result<(), DatastoreError> {
        {
            let mut state = self.inner.state.write().map_err(|_| lock_err(&self.inner.name))?;
            state
                .mapped
                .entry(concept.name().to_string())
                .or_default()
                .insert(property.name().to_string());
        }
        let backend = MemoryBackend {
            inner: Arc::clone(&self.inner),
            concept: concept.name().to_string(),
            property: property.name().to_string(),
        };
        property
            .add_binding(&self.inner.name, Arc::new(backend))
            .map_err(|e| DatastoreError::backend(&self.inner.name, e.to_string()))
    }

    async fn remove_backing_store(&self, concept: &Concept, property: &Property) -> Result<(), DatastoreError> {
        {
            let mut state = self.inner.state.write().map_err(|_| lock_err(&self.inner.name))?;
            if let Some(props) = state.mapped.get_mut(concept.name()) {
                props.remove(property.name());
                if props.is_empty() {
                    state.mapped.remove(concept.name());
                }
            }
        }
        property
            .remove_binding(&self.inner.name)
            .map(|_| ())
            .map_err(|e| DatastoreError::backend(&self.inner.name, e.to_string()))
    }

    async fn lookup_concept(&self, uuid: &str) -> Result<Option<String>, DatastoreError> {
        let state = self.inner.state.read().map_err(|_| lock_err(&self.inner.name))?;
        Ok(state.instances.get(uuid).map(|i| i.concept.clone()))
    }

    async fn lookup_instances(&self, engine: &Engine, query: &InstanceQuery<'_>) -> VarvResult<Vec<String>> {
        let candidates: Vec<String> = {
            let state = self.inner.state.read().map_err(|_| lock_err(&self.inner.name))?;
            state
                .order
                .iter()
                .filter(|uuid| {
                    state
                        .instances
                        .get(*uuid)
                        .is_some_and(|i| query.type_names.iter().any(|t| *t == i.concept))
                })
                .cloned()
                .collect()
        };

        let mut matched = Vec::new();
        for uuid in candidates {
            if query.limit.is_some_and(|limit| matched.len() >= limit) {
                break;
            }
            let keep = match query.filter {
                Some(filter) => {
                    let ctx = query.context.retarget(uuid.as_str());
                    filter.evaluate(engine, &ctx, query.local_concept).await?
                }
                None => true,
            };
            if keep {
                matched.push(uuid);
            }
        }
        Ok(matched)
    }

    fn is_property_mapped(&self, concept: &str, property: &str) -> bool {
        self.inner
            .state
            .read()
            .map(|s| s.mapped.get(concept).is_some_and(|p| p.contains(property)))
            .unwrap_or(false)
    }

    fn is_concept_type_mapped(&self, concept: &str) -> bool {
        self.inner
            .state
            .read()
            .map(|s| s.mapped.contains_key(concept))
            .unwrap_or(false)
    }

    async fn instance_appeared(&self, concept: &str, uuid: &str) -> Result<(), DatastoreError> {
        let mut state = self.inner.state.write().map_err(|_| lock_err(&self.inner.name))?;
        state.mapped.entry(concept.to_string()).or_default();
        state.insert(uuid, concept);
        Ok(())
    }

    async fn instance_disappeared(&self, concept: &str, uuid: &str) -> Result<(), DatastoreError> {
        let mut state = self.inner.state.write().map_err(|_| lock_err(&self.inner.name))?;
        if state.instances.get(uuid).is_some_and(|i| i.concept == concept) {
            state.remove(uuid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_skips_unchanged_writes() {
        let store = MemoryDatastore::new("mem", EventBus::new(8));
        store.instance_appeared("Todo", "u1").await.unwrap();
        let backend = MemoryBackend {
            inner: Arc::clone(&store.inner),
            concept: "Todo".into(),
            property: "title".into(),
        };
        assert_eq!(backend.set("u1", &Value::from("a")).await.unwrap(), SetOutcome::Written);
        assert_eq!(backend.set("u1", &Value::from("a")).await.unwrap(), SetOutcome::Unchanged);
        assert_eq!(store.write_count(), 1);
        assert_eq!(backend.get("u1").await.unwrap(), Some(Value::from("a")));
    }

    #[tokio::test]
    async fn test_framework_writes_are_not_observed() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let store = MemoryDatastore::new("mem", bus);
        store.instance_appeared("Todo", "u1").await.unwrap();
        let backend = MemoryBackend {
            inner: Arc::clone(&store.inner),
            concept: "Todo".into(),
            property: "done".into(),
        };
        backend.set("u1", &Value::from(true)).await.unwrap();
        assert!(rx.try_recv().is_err());

        store.external_set("u1", "done", false).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "stateChanged");
    }

    #[tokio::test]
    async fn test_seeded_instances_load_and_disappear() {
        let options = serde_json::json!({
            "instances": [{"uuid": "s1", "concept": "Note", "values": {"text": "hi"}}]
        });
        let store = MemoryDatastore::from_options("mem", &options, EventBus::new(8)).unwrap();
        store.init().await.unwrap();
        assert_eq!(store.lookup_concept("s1").await.unwrap(), Some("Note".to_string()));
        assert_eq!(store.stored_value("s1", "text").unwrap(), Some(Value::from("hi")));

        assert_eq!(
            store.load_backing_store().await.unwrap(),
            vec![("Note".to_string(), "s1".to_string())]
        );

        store.instance_disappeared("Other", "s1").await.unwrap();
        assert_eq!(store.len(), 1);
        store.instance_disappeared("Note", "s1").await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = serde_json::json!({"skipUnchanged": "sometimes"});
        assert!(MemoryDatastore::from_options("mem", &options, EventBus::new(4)).is_err());
    }
}
