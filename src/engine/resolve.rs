//! Name resolution: instances, properties, expressions and actions.
//!
//! Property lookup precedence for a bare name:
//! 1. the current target's concept
//! 2. the chain's local concept, read from its singleton instance
//! 3. every registered concept in registration order, again via singletons
//!
//! A dotted `Concept.property` prefers the target when it is-a `Concept`
//! and falls back to that concept's singleton otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::action::{Action, ChainScope, ResolvedAction};
use crate::behaviour::Behaviour;
use crate::concept::Concept;
use crate::context::Context;
use crate::datastore::{Datastore, InstanceQuery};
use crate::engine::Engine;
use crate::error::{lock_err, ResolutionError, VarvError, VarvResult};
use crate::event::EngineEvent;
use crate::expr::{Expression, Identifier};
use crate::fanout::{any_true, first_success, max_count};
use crate::property::{Property, SetReport};
use crate::value::Value;

/// A property resolved against a concept and, when known, an instance.
#[derive(Debug, Clone)]
pub struct PropertyLookup {
    pub concept: Arc<Concept>,
    pub property: Arc<Property>,
    /// Instance to read or write; `None` when no instance could be found.
    pub target: Option<String>,
}

impl PropertyLookup {
    fn new(concept: &Arc<Concept>, property: &Arc<Property>, target: Option<String>) -> Self {
        Self {
            concept: Arc::clone(concept),
            property: Arc::clone(property),
            target,
        }
    }
}

impl Engine {
    /// Concept of an instance: the cache first, then the first datastore
    /// that knows the UUID. Datastore answers are cached.
    pub async fn get_concept_from_uuid(&self, uuid: &str) -> VarvResult<Option<Arc<Concept>>> {
        if let Some(concept) = self.registry.cached_concept(uuid)? {
            return Ok(Some(concept));
        }
        let stores = self.datastores()?;
        let Some(name) = first_success(stores.iter().map(|s| s.lookup_concept(uuid))).await? else {
            return Ok(None);
        };
        match self.registry.concept(&name)? {
            Some(concept) => {
                self.registry.cache_instance(uuid, Arc::clone(&concept))?;
                Ok(Some(concept))
            }
            None => {
                debug!(%uuid, concept = %name, "datastore names an unregistered concept");
                Ok(None)
            }
        }
    }

    /// `name` followed by every registered concept that is-a `name`.
    pub fn get_all_implementing_concept_names(&self, name: &str) -> VarvResult<Vec<String>> {
        let mut names = vec![name.to_string()];
        names.extend(
            self.registry
                .concepts()?
                .iter()
                .filter(|c| c.name() != name && c.is_a(name))
                .map(|c| c.name().to_string()),
        );
        Ok(names)
    }

    fn query_stores(&self, type_names: &[String]) -> VarvResult<Vec<Arc<dyn Datastore>>> {
        Ok(self
            .datastores()?
            .into_iter()
            .filter(|s| type_names.iter().any(|t| s.is_concept_type_mapped(t)))
            .collect())
    }

    /// Matching instances across every store mapping one of the types.
    ///
    /// Results keep store order, first store first, without duplicates. A
    /// failing store is skipped unless all of them failed; filter and
    /// resolution errors always propagate.
    pub async fn lookup_instances(&self, query: &InstanceQuery<'_>) -> VarvResult<Vec<String>> {
        let stores = self.query_stores(query.type_names)?;
        let results = join_all(stores.iter().map(|s| s.lookup_instances(self, query))).await;

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut answered = false;
        let mut first_error = None;
        for (store, result) in stores.iter().zip(results) {
            match result {
                Ok(uuids) => {
                    answered = true;
                    out.extend(uuids.into_iter().filter(|u| seen.insert(u.clone())));
                }
                Err(e @ VarvError::Datastore(_)) => {
                    warn!(datastore = %store.name(), error = %e, "instance lookup failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let (false, Some(e)) = (answered, first_error) {
            return Err(e);
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub async fn count_instances(&self, query: &InstanceQuery<'_>) -> VarvResult<usize> {
        let stores = self.query_stores(query.type_names)?;
        max_count(stores.iter().map(|s| s.count_instances(self, query))).await
    }

    pub async fn exists_instance(&self, query: &InstanceQuery<'_>) -> VarvResult<bool> {
        let stores = self.query_stores(query.type_names)?;
        any_true(stores.iter().map(|s| s.exists_instance(self, query))).await
    }

    /// The one instance of `concept`, warning when there are several.
    async fn singleton(&self, concept: &Concept) -> VarvResult<Option<String>> {
        let names = [concept.name().to_string()];
        let ctx = Context::new();
        let found = self
            .lookup_instances(&InstanceQuery::new(&names, &ctx).with_limit(Some(2)))
            .await?;
        if found.len() > 1 {
            warn!(concept = %concept.name(), "several instances where one was expected, using the first");
        }
        Ok(found.into_iter().next())
    }

    /// Resolves a property name for a target and local concept.
    ///
    /// `Ok(None)` when no concept declares the property. An unknown concept
    /// in the dotted form is an error.
    pub async fn lookup_property(
        &self,
        target: Option<&str>,
        local: Option<&str>,
        name: &str,
    ) -> VarvResult<Option<PropertyLookup>> {
        let target_concept = match target {
            Some(uuid) => self.get_concept_from_uuid(uuid).await?,
            None => None,
        };
        let on_target = |property: &str| -> Option<PropertyLookup> {
            let concept = target_concept.as_ref()?;
            let found = concept.property(property)?;
            Some(PropertyLookup::new(concept, found, target.map(str::to_string)))
        };

        if let Some((concept_name, property_name)) = name.split_once('.') {
            let concept = self.require_concept(concept_name)?;
            if target_concept.as_ref().is_some_and(|c| c.is_a(concept_name)) {
                if let Some(found) = on_target(property_name) {
                    return Ok(Some(found));
                }
            }
            let Some(property) = concept.property(property_name).cloned() else {
                return Ok(None);
            };
            let instance = self.singleton(&concept).await?;
            return Ok(Some(PropertyLookup::new(&concept, &property, instance)));
        }

        if let Some(found) = on_target(name) {
            return Ok(Some(found));
        }

        if let Some(concept) = local.and_then(|l| self.get_concept(l)) {
            if let Some(property) = concept.property(name).cloned() {
                let instance = self.singleton(&concept).await?;
                return Ok(Some(PropertyLookup::new(&concept, &property, instance)));
            }
        }

        for concept in self.registry.concepts()? {
            if let Some(property) = concept.property(name).cloned() {
                let instance = self.singleton(&concept).await?;
                return Ok(Some(PropertyLookup::new(&concept, &property, instance)));
            }
        }
        Ok(None)
    }

    /// [`lookup_property`](Self::lookup_property), failing with
    /// `PropertyNotFound`.
    pub async fn resolve_property(
        &self,
        target: Option<&str>,
        local: Option<&str>,
        name: &str,
    ) -> VarvResult<PropertyLookup> {
        self.lookup_property(target, local, name)
            .await?
            .ok_or_else(|| {
                ResolutionError::PropertyNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn get_property_value(&self, lookup: &PropertyLookup) -> VarvResult<Value> {
        self.read_property(&lookup.concept, &lookup.property, lookup.target.as_deref())
            .await
    }

    /// Reads a property of an instance; derived properties are computed
    /// with the instance as target and the concept as local scope.
    pub async fn read_property(
        &self,
        concept: &Concept,
        property: &Arc<Property>,
        target: Option<&str>,
    ) -> VarvResult<Value> {
        let Some(uuid) = target else {
            return Err(ResolutionError::MissingTarget {
                action: format!("{}.{}", concept.name(), property.name()),
            }
            .into());
        };
        match property.derive_expression() {
            Some(expression) => {
                let ctx = Context::with_target(uuid);
                let value = self
                    .evaluate_expression(expression, &ctx, Some(concept.name()))
                    .await?;
                Ok(property.type_cast(&value).unwrap_or(value))
            }
            None => property.get_value(uuid).await,
        }
    }

    /// Writes a property and publishes `PropertyChanged` when any backend
    /// actually wrote.
    pub async fn set_property_value(&self, lookup: &PropertyLookup, value: &Value) -> VarvResult<SetReport> {
        let Some(uuid) = lookup.target.as_deref() else {
            return Err(ResolutionError::MissingTarget {
                action: format!("{}.{}", lookup.concept.name(), lookup.property.name()),
            }
            .into());
        };
        let property = &lookup.property;
        let value = property.validate(value)?;
        let previous = if property.is_derived() {
            Value::Null
        } else {
            match property.get_value(uuid).await {
                Ok(previous) => previous,
                Err(e) => {
                    debug!(property = %property.name(), error = %e, "previous value unavailable");
                    Value::Null
                }
            }
        };
        let report = property.set_value(uuid, &value).await?;
        if report.changed() {
            let concept = match self.get_concept_from_uuid(uuid).await? {
                Some(actual) => actual.name().to_string(),
                None => lookup.concept.name().to_string(),
            };
            self.publish(EngineEvent::PropertyChanged {
                concept,
                uuid: uuid.to_string(),
                property: property.name().to_string(),
                value,
                previous,
            });
        }
        Ok(report)
    }

    /// Evaluates a calculation, resolving `$variables` from the context and
    /// bare names as properties.
    pub fn evaluate_expression<'a>(
        &'a self,
        expression: &'a Expression,
        ctx: &'a Context,
        local: Option<&'a str>,
    ) -> BoxFuture<'a, VarvResult<Value>> {
        async move {
            let mut bindings = HashMap::new();
            for identifier in expression.identifiers() {
                let value = match &identifier {
                    Identifier::Variable(name) => ctx.resolve(&Value::String(format!("${name}")))?,
                    Identifier::Property(name) => {
                        let lookup = self.resolve_property(ctx.target.as_deref(), local, name).await?;
                        self.get_property_value(&lookup).await?
                    }
                };
                bindings.insert(identifier, value);
            }
            Ok(expression.evaluate(&bindings)?)
        }
        .boxed()
    }

    /// Finds the behaviour a chain step name refers to, if any.
    ///
    /// `Concept.behaviour` names a behaviour directly. Otherwise behaviours
    /// of the local concept and of the target's concept are tried, except
    /// that a step named like the running behaviour never resolves to it.
    pub async fn lookup_behaviour(
        &self,
        name: &str,
        scope: &ChainScope,
        target: Option<&str>,
    ) -> VarvResult<Option<Arc<Behaviour>>> {
        if let Some((concept_name, behaviour_name)) = name.split_once('.') {
            let concept = self.require_concept(concept_name)?;
            return Ok(concept.behaviour(behaviour_name).cloned());
        }

        let is_running = |concept: &Concept| {
            scope.local() == Some(concept.name()) && scope.behaviour.as_deref() == Some(name)
        };
        if let Some(local) = scope.local().and_then(|l| self.get_concept(l)) {
            if !is_running(&local) {
                if let Some(behaviour) = local.behaviour(name) {
                    return Ok(Some(Arc::clone(behaviour)));
                }
            }
        }
        if let Some(uuid) = target {
            if let Some(concept) = self.get_concept_from_uuid(uuid).await? {
                if !is_running(&concept) {
                    if let Some(behaviour) = concept.behaviour(name) {
                        return Ok(Some(Arc::clone(behaviour)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Resolves a chain step name: a behaviour per
    /// [`lookup_behaviour`](Self::lookup_behaviour), else the primitive.
    ///
    /// `primitive` is the one prepared at parse time; without it the
    /// primitive is built with no options.
    pub async fn lookup_action(
        &self,
        name: &str,
        scope: &ChainScope,
        target: Option<&str>,
        primitive: Option<&Arc<dyn Action>>,
    ) -> VarvResult<Option<ResolvedAction>> {
        if let Some(behaviour) = self.lookup_behaviour(name, scope, target).await? {
            return Ok(Some(ResolvedAction::Behaviour(behaviour)));
        }
        if name.contains('.') {
            return Ok(None);
        }

        if let Some(primitive) = primitive {
            return Ok(Some(ResolvedAction::Primitive(Arc::clone(primitive))));
        }
        let built = {
            let actions = self.actions.read().map_err(|_| lock_err("action registry"))?;
            actions.build(name, &serde_json::Value::Null)
        };
        built.transpose().map(|action| action.map(ResolvedAction::Primitive))
    }
}
