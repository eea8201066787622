//! Concepts: named entity types and their instance lifecycle.
//!
//! A concept is immutable once the loader has finalized it. Instances are
//! not objects: a UUID "is" a concept because the engine cache and the
//! mapped datastores say so.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::behaviour::Behaviour;
use crate::engine::Engine;
use crate::error::{ResolutionError, ValidationError, VarvResult};
use crate::event::EngineEvent;
use crate::fanout::write_all;
use crate::property::Property;
use crate::value::Value;

/// A declared entity type.
pub struct Concept {
    name: String,
    properties: Vec<Arc<Property>>,
    behaviours: Vec<Arc<Behaviour>>,
    other_concepts: BTreeSet<String>,
    /// property -> datastore names, primary first
    mappings: BTreeMap<String, Vec<String>>,
    /// Every store holding instances of this concept, in first-mapped order.
    datastores: Vec<String>,
}

impl fmt::Debug for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Concept")
            .field("name", &self.name)
            .field("properties", &self.property_names())
            .field(
                "behaviours",
                &self.behaviours.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("other_concepts", &self.other_concepts)
            .field("datastores", &self.datastores)
            .finish()
    }
}

impl Concept {
    /// Assembles a concept. `fallback_datastores` back the concept itself when
    /// no property is mapped anywhere.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        properties: Vec<Arc<Property>>,
        behaviours: Vec<Arc<Behaviour>>,
        other_concepts: BTreeSet<String>,
        mappings: BTreeMap<String, Vec<String>>,
        fallback_datastores: &[String],
    ) -> Self {
        let mut datastores: Vec<String> = Vec::new();
        for p in &properties {
            for store in mappings.get(p.name()).into_iter().flatten() {
                if !datastores.contains(store) {
                    datastores.push(store.clone());
                }
            }
        }
        if datastores.is_empty() {
            datastores = fallback_datastores.to_vec();
        }
        Self {
            name: name.into(),
            properties,
            behaviours,
            other_concepts,
            mappings,
            datastores,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Arc<Property>> {
        self.properties.iter().find(|p| p.name() == name)
    }

    #[must_use]
    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name()).collect()
    }

    #[must_use]
    pub fn behaviours(&self) -> &[Arc<Behaviour>] {
        &self.behaviours
    }

    #[must_use]
    pub fn behaviour(&self, name: &str) -> Option<&Arc<Behaviour>> {
        self.behaviours.iter().find(|b| b.name() == name)
    }

    /// Concepts this one structurally includes (transitively).
    #[must_use]
    pub fn other_concepts(&self) -> &BTreeSet<String> {
        &self.other_concepts
    }

    /// True for the concept itself and every concept it includes.
    #[must_use]
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.other_concepts.contains(name)
    }

    #[must_use]
    pub fn mappings(&self) -> &BTreeMap<String, Vec<String>> {
        &self.mappings
    }

    /// Datastores backing `property`, primary first.
    #[must_use]
    pub fn mapped_datastores(&self, property: &str) -> &[String] {
        self.mappings.get(property).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn datastores(&self) -> &[String] {
        &self.datastores
    }

    fn require_property(&self, name: &str) -> VarvResult<&Arc<Property>> {
        self.property(name).ok_or_else(|| {
            ResolutionError::PropertyNotFound {
                name: format!("{}.{name}", self.name),
            }
            .into()
        })
    }

    /// Checks initial values before anything is written.
    fn prepare_values(&self, values: &BTreeMap<String, Value>) -> VarvResult<Vec<(Arc<Property>, Value)>> {
        for name in values.keys() {
            self.require_property(name)?;
        }
        let mut writes = Vec::new();
        for property in &self.properties {
            let value = match values.get(property.name()) {
                Some(v) => {
                    if property.is_derived() {
                        return Err(ValidationError::ReadOnly {
                            property: property.name().to_string(),
                        }
                        .into());
                    }
                    property.validate(v)?
                }
                None => match &property.options().default {
                    Some(default) if !property.is_derived() => default.clone(),
                    _ => continue,
                },
            };
            if !property.is_backed() {
                return Err(ValidationError::Unbacked {
                    property: property.name().to_string(),
                }
                .into());
            }
            writes.push((Arc::clone(property), value));
        }
        Ok(writes)
    }

    /// Creates an instance and returns its UUID.
    ///
    /// Mapped datastores hear about the instance before its initial values
    /// are written; `Appeared` is published last.
    pub async fn create(
        self: &Arc<Self>,
        engine: &Engine,
        uuid: Option<String>,
        values: BTreeMap<String, Value>,
    ) -> VarvResult<String> {
        let writes = self.prepare_values(&values)?;
        let uuid = uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        engine.registry().cache_instance(&uuid, Arc::clone(self))?;
        let stores = engine.datastores_named(&self.datastores)?;
        write_all(
            &self.name,
            stores.iter().map(|s| s.instance_appeared(&self.name, &uuid)),
        )
        .await?;

        for (property, value) in writes {
            property.set_value(&uuid, &value).await?;
        }

        debug!(concept = %self.name, %uuid, "instance created");
        engine.publish(EngineEvent::Appeared {
            concept: self.name.clone(),
            uuid: uuid.clone(),
        });
        Ok(uuid)
    }

    /// Deletes an instance, publishing exactly one `Disappeared`.
    ///
    /// Deleting an instance no store knows is a no-op.
    pub async fn delete(self: &Arc<Self>, engine: &Engine, uuid: &str) -> VarvResult<()> {
        if engine.get_concept_from_uuid(uuid).await?.is_none() {
            debug!(concept = %self.name, %uuid, "delete of unknown instance ignored");
            return Ok(());
        }
        let stores = engine.datastores_named(&self.datastores)?;
        write_all(
            &self.name,
            stores.iter().map(|s| s.instance_disappeared(&self.name, uuid)),
        )
        .await?;
        engine.registry().evict_instance(uuid)?;

        debug!(concept = %self.name, %uuid, "instance deleted");
        engine.publish(EngineEvent::Disappeared {
            concept: self.name.clone(),
            uuid: uuid.to_string(),
        });
        Ok(())
    }

    /// Reads every stored (non-derived) property of an instance.
    pub async fn snapshot(&self, engine: &Engine, uuid: &str) -> VarvResult<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        for property in self.properties.iter().filter(|p| !p.is_derived()) {
            let value = engine.read_property(self, property, Some(uuid)).await?;
            if !value.is_null() {
                out.insert(property.name().to_string(), value);
            }
        }
        Ok(out)
    }

    /// Duplicates an instance under a new UUID.
    ///
    /// A deep clone also clones every instance referenced through
    /// concept-typed properties; shared and cyclic references are cloned once.
    pub async fn clone_instance(self: &Arc<Self>, engine: &Engine, uuid: &str, deep: bool) -> VarvResult<String> {
        if !deep {
            let values = self.snapshot(engine, uuid).await?;
            return self.create(engine, None, values).await;
        }
        let mut visited = BTreeMap::new();
        clone_deep(Arc::clone(self), engine, uuid.to_string(), &mut visited).await
    }
}

fn clone_deep<'a>(
    concept: Arc<Concept>,
    engine: &'a Engine,
    uuid: String,
    visited: &'a mut BTreeMap<String, String>,
) -> BoxFuture<'a, VarvResult<String>> {
    async move {
        if let Some(copy) = visited.get(&uuid) {
            return Ok(copy.clone());
        }
        let mut values = concept.snapshot(engine, &uuid).await?;
        let references: Vec<(String, Value)> = concept
            .properties()
            .iter()
            .filter(|p| p.property_type().referenced_concept().is_some())
            .filter_map(|p| values.remove(p.name()).map(|v| (p.name().to_string(), v)))
            .collect();

        let copy = concept.create(engine, None, values).await?;
        visited.insert(uuid, copy.clone());

        for (name, value) in references {
            let cloned = match value {
                Value::String(target) => Value::String(clone_reference(engine, target, visited).await?),
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::String(target) => {
                                out.push(Value::String(clone_reference(engine, target, visited).await?));
                            }
                            other => out.push(other),
                        }
                    }
                    Value::Array(out)
                }
                other => other,
            };
            let property = concept.require_property(&name)?;
            property.set_value(&copy, &cloned).await?;
        }
        Ok(copy)
    }
    .boxed()
}

async fn clone_reference(
    engine: &Engine,
    target: String,
    visited: &mut BTreeMap<String, String>,
) -> VarvResult<String> {
    match engine.get_concept_from_uuid(&target).await? {
        Some(referenced) => clone_deep(referenced, engine, target, visited).await,
        None => {
            warn!(uuid = %target, "dangling reference kept during deep clone");
            Ok(target)
        }
    }
}
