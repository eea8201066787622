//! The Varv engine.
//!
//! One [`Engine`] owns the concept registry, the datastores, the event bus
//! and the action, trigger and datastore type registries. Concepts,
//! behaviours and triggers reach shared state only through it, and
//! triggers hold it weakly.
//!
//! Loading a specification always follows the same order:
//! 1. datastores are created and initialized
//! 2. concepts are registered
//! 3. every stored property gets a backing store on each mapped datastore
//! 4. datastores report persisted instances, published as `Appeared`
//! 5. behaviours enable their triggers

mod merge;
mod registry;
mod reload;
mod resolve;

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{ActionConstructor, ActionRegistry, ChainScope};
use crate::behaviour::ChainOutcome;
use crate::concept::Concept;
use crate::config::{DatastoreDecl, EngineConfig};
use crate::context::Context;
use crate::datastore::{Datastore, DatastoreContext, DatastoreFactory, DatastoreRegistry};
use crate::error::{lock_err, ResolutionError, SpecError, VarvError, VarvResult};
use crate::event::{EngineEvent, EventBus};
use crate::fanout::write_all;
use crate::loader::ConceptLoader;
use crate::trigger::{TriggerConstructor, TriggerRegistry};

pub use merge::{merge, merge_all, resolve_merge_conflicts, MERGE_CONFLICT};
pub use registry::Registry;
pub use reload::{FileSpec, ReloadListener, ReloadReport, SpecSource, StaticSpec};
pub use resolve::PropertyLookup;

/// What one `load_spec` call added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub concepts: usize,
    pub datastores: usize,
    /// Persisted instances discovered by the datastores.
    pub instances: usize,
}

/// The runtime hosting concepts, datastores and behaviours.
pub struct Engine {
    me: Weak<Engine>,
    config: EngineConfig,
    registry: Registry,
    events: EventBus,
    datastores: RwLock<Vec<Arc<dyn Datastore>>>,
    actions: RwLock<ActionRegistry>,
    triggers: RwLock<TriggerRegistry>,
    datastore_types: RwLock<DatastoreRegistry>,
    reload: reload::ReloadState,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stores: Vec<String> = self
            .datastores()
            .map(|s| s.iter().map(|d| d.name().to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("datastores", &stores)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the builtin actions, triggers and the memory
    /// datastore type. Nothing is loaded yet.
    pub fn new(config: EngineConfig) -> VarvResult<Arc<Self>> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry: Registry::new(),
            events,
            datastores: RwLock::new(Vec::new()),
            actions: RwLock::new(ActionRegistry::default()),
            triggers: RwLock::new(TriggerRegistry::default()),
            datastore_types: RwLock::new(DatastoreRegistry::default()),
            reload: reload::ReloadState::default(),
            config,
        }))
    }

    /// An engine with [`EngineConfig::default`].
    pub fn with_defaults() -> VarvResult<Arc<Self>> {
        Self::new(EngineConfig::default())
    }

    fn handle(&self) -> VarvResult<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or_else(|| VarvError::internal("engine is shutting down"))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn publish(&self, event: EngineEvent) -> usize {
        debug!(event = event.name(), uuid = event.uuid().unwrap_or(""), "publishing");
        self.events.publish(event)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // Registration hooks. They affect specifications loaded afterwards.

    /// Adds or replaces a primitive action.
    pub fn register_action(&self, name: impl Into<String>, constructor: ActionConstructor) -> VarvResult<()> {
        self.actions
            .write()
            .map_err(|_| lock_err("action registry"))?
            .register(name, constructor);
        Ok(())
    }

    /// Adds or replaces a trigger type.
    pub fn register_trigger(&self, name: impl Into<String>, constructor: TriggerConstructor) -> VarvResult<()> {
        self.triggers
            .write()
            .map_err(|_| lock_err("trigger registry"))?
            .register(name, constructor);
        Ok(())
    }

    /// Adds or replaces a datastore type.
    pub fn register_datastore_type(&self, kind: impl Into<String>, factory: DatastoreFactory) -> VarvResult<()> {
        self.datastore_types
            .write()
            .map_err(|_| lock_err("datastore types"))?
            .register(kind, factory);
        Ok(())
    }

    /// Snapshot of the primitive action registry.
    pub fn action_registry(&self) -> VarvResult<ActionRegistry> {
        Ok(self.actions.read().map_err(|_| lock_err("action registry"))?.clone())
    }

    pub fn trigger_registry(&self) -> VarvResult<TriggerRegistry> {
        Ok(self.triggers.read().map_err(|_| lock_err("trigger registry"))?.clone())
    }

    // Datastores

    /// Every open datastore in creation order.
    pub fn datastores(&self) -> VarvResult<Vec<Arc<dyn Datastore>>> {
        Ok(self.datastores.read().map_err(|_| lock_err("datastores"))?.clone())
    }

    pub fn datastore(&self, name: &str) -> VarvResult<Option<Arc<dyn Datastore>>> {
        Ok(self
            .datastores
            .read()
            .map_err(|_| lock_err("datastores"))?
            .iter()
            .find(|d| d.name() == name)
            .cloned())
    }

    /// Open datastores for `names`, in the given order. Unknown names are
    /// skipped with a warning.
    pub fn datastores_named(&self, names: &[String]) -> VarvResult<Vec<Arc<dyn Datastore>>> {
        let open = self.datastores.read().map_err(|_| lock_err("datastores"))?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match open.iter().find(|d| d.name() == name) {
                Some(store) => out.push(Arc::clone(store)),
                None => warn!(datastore = %name, "mapped datastore is not open"),
            }
        }
        Ok(out)
    }

    fn take_datastores(&self) -> VarvResult<Vec<Arc<dyn Datastore>>> {
        Ok(std::mem::take(
            &mut *self.datastores.write().map_err(|_| lock_err("datastores"))?,
        ))
    }

    /// Creates and initializes the configured and declared datastores that
    /// are not open yet. A declaration overrides a configured store of the
    /// same name. Returns how many were opened.
    async fn open_datastores(&self, declared: &[DatastoreDecl]) -> VarvResult<usize> {
        let mut wanted: Vec<DatastoreDecl> = self.config.default_datastores.clone();
        for decl in declared {
            match wanted.iter_mut().find(|w| w.name == decl.name) {
                Some(slot) => *slot = decl.clone(),
                None => wanted.push(decl.clone()),
            }
        }
        let types = self
            .datastore_types
            .read()
            .map_err(|_| lock_err("datastore types"))?
            .clone();
        let ctx = DatastoreContext {
            events: self.events.clone(),
        };

        let mut opened = 0;
        for decl in wanted {
            if let Some(existing) = self.datastore(&decl.name)? {
                if existing.kind() != decl.kind {
                    warn!(datastore = %decl.name, open = %existing.kind(), declared = %decl.kind, "datastore already open with another type, keeping it");
                }
                continue;
            }
            let store = types
                .create(&decl.kind, &decl.name, &decl.options, &ctx)
                .ok_or_else(|| SpecError::UnknownDatastoreType {
                    name: decl.name.clone(),
                    kind: decl.kind.clone(),
                })??;
            store.init().await?;
            debug!(datastore = %decl.name, kind = %decl.kind, "datastore opened");
            self.datastores
                .write()
                .map_err(|_| lock_err("datastores"))?
                .push(store);
            opened += 1;
        }
        Ok(opened)
    }

    // Concepts

    #[must_use]
    pub fn get_concept(&self, name: &str) -> Option<Arc<Concept>> {
        self.registry.concept(name).ok().flatten()
    }

    /// Like [`get_concept`](Self::get_concept), failing with `ConceptNotFound`.
    pub fn require_concept(&self, name: &str) -> VarvResult<Arc<Concept>> {
        self.registry.concept(name)?.ok_or_else(|| {
            ResolutionError::ConceptNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Loads a specification document on top of what is already loaded.
    pub async fn load_spec(&self, spec: &serde_json::Value) -> VarvResult<LoadSummary> {
        let engine = self.handle()?;
        let actions = self.action_registry()?;
        let triggers = self.trigger_registry()?;
        let loaded = ConceptLoader::new(&actions, &triggers, &self.config.default_mappings).load(spec)?;

        let datastores = self.open_datastores(&loaded.datastores).await?;
        for concept in &loaded.concepts {
            self.registry.register_concept(Arc::clone(concept))?;
        }

        for concept in &loaded.concepts {
            for property in concept.properties().iter().filter(|p| !p.is_derived()) {
                for store in self.datastores_named(concept.mapped_datastores(property.name()))? {
                    store.create_backing_store(concept, property).await?;
                }
            }
        }

        let mut instances = 0;
        for store in self.datastores()? {
            for (concept_name, uuid) in store.load_backing_store().await? {
                let Some(concept) = self.registry.concept(&concept_name)? else {
                    debug!(datastore = %store.name(), concept = %concept_name, %uuid, "persisted instance of unknown concept");
                    continue;
                };
                if self.registry.cached_concept(&uuid)?.is_some() {
                    continue;
                }
                self.registry.cache_instance(&uuid, concept)?;
                instances += 1;
                self.publish(EngineEvent::Appeared {
                    concept: concept_name,
                    uuid,
                });
            }
        }

        for concept in &loaded.concepts {
            for behaviour in concept.behaviours() {
                behaviour.enable(&engine)?;
            }
        }

        let summary = LoadSummary {
            concepts: loaded.concepts.len(),
            datastores,
            instances,
        };
        info!(
            concepts = summary.concepts,
            datastores = summary.datastores,
            instances = summary.instances,
            "specification loaded"
        );
        Ok(summary)
    }

    /// Disables the triggers of every registered behaviour.
    pub fn disable_behaviours(&self) -> VarvResult<()> {
        for concept in self.registry.concepts()? {
            for behaviour in concept.behaviours() {
                behaviour.disable()?;
            }
        }
        Ok(())
    }

    /// Changes the concept of an existing instance in place.
    ///
    /// The old stores forget the instance, the new ones adopt it, and every
    /// stored value whose property name exists on the new concept is copied
    /// over. Other values are dropped. Publishes `TypeChanged`.
    pub async fn switch_concept_type(&self, uuid: &str, concept: &str) -> VarvResult<()> {
        let next = self.require_concept(concept)?;
        let current = self
            .get_concept_from_uuid(uuid)
            .await?
            .ok_or_else(|| ResolutionError::UnknownInstance { uuid: uuid.to_string() })?;
        if current.name() == next.name() {
            return Ok(());
        }
        let values = current.snapshot(self, uuid).await?;

        let old_stores = self.datastores_named(current.datastores())?;
        write_all(
            current.name(),
            old_stores.iter().map(|s| s.instance_disappeared(current.name(), uuid)),
        )
        .await?;
        self.registry.evict_instance(uuid)?;
        self.registry.cache_instance(uuid, Arc::clone(&next))?;
        let new_stores = self.datastores_named(next.datastores())?;
        write_all(
            next.name(),
            new_stores.iter().map(|s| s.instance_appeared(next.name(), uuid)),
        )
        .await?;

        for (name, value) in values {
            let Some(property) = next.property(&name) else {
                debug!(%uuid, property = %name, to = %next.name(), "value dropped by type switch");
                continue;
            };
            if property.is_derived() || !property.is_backed() {
                continue;
            }
            if let Err(e) = property.set_value(uuid, &value).await {
                warn!(%uuid, property = %name, error = %e, "value not carried over by type switch");
            }
        }

        info!(%uuid, from = %current.name(), to = %next.name(), "instance changed type");
        self.publish(EngineEvent::TypeChanged {
            uuid: uuid.to_string(),
            from: current.name().to_string(),
            to: next.name().to_string(),
        });
        Ok(())
    }

    /// Runs a behaviour directly, outside of its triggers.
    pub async fn dispatch(&self, concept: &str, behaviour: &str, contexts: Vec<Context>) -> VarvResult<ChainOutcome> {
        let owner = self.require_concept(concept)?;
        let behaviour = owner.behaviour(behaviour).cloned().ok_or_else(|| ResolutionError::ActionNotFound {
            name: format!("{concept}.{behaviour}"),
        })?;
        behaviour.run(self, contexts).await
    }

    /// Parses and runs an ad-hoc chain with `local` as the local concept.
    pub async fn run_chain(
        &self,
        steps: &[serde_json::Value],
        contexts: Vec<Context>,
        local: Option<&str>,
    ) -> VarvResult<Vec<Context>> {
        let chain = self.action_registry()?.parse_chain(steps)?;
        let scope = ChainScope::new(local.map(str::to_string));
        chain.run(self, contexts, &scope).await
    }
}
