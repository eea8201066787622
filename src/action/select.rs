//! `select` and `where` (alias `filter`).

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::action::{boxed, constructor, for_each_context, Action, ActionRegistry, ChainScope, Mode, Options};
use crate::context::{common_context, Context};
use crate::datastore::InstanceQuery;
use crate::engine::Engine;
use crate::error::{ResolutionError, VarvError, VarvResult};
use crate::filter::Filter;
use crate::value::Value;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("select", constructor(|json, _| boxed(Select::parse(json)?)));
    registry.register("where", constructor(|json, _| boxed(Where::parse("where", json)?)));
    registry.register("filter", constructor(|json, _| boxed(Where::parse("filter", json)?)));
}

/// Instances of a concept (polymorphic unless `includeOthers` is false).
#[derive(Debug, Clone)]
pub(super) struct ConceptSet {
    pub concept: String,
    pub filter: Option<Filter>,
    pub include_others: bool,
    pub limit: Option<usize>,
}

impl ConceptSet {
    pub fn parse(options: &Options) -> VarvResult<Option<Self>> {
        let Some(concept) = options.str("concept")? else {
            return Ok(None);
        };
        let filter = match options.filter("where")? {
            Some(f) => Some(f),
            None => options.filter("filter")?,
        };
        Ok(Some(Self {
            concept,
            filter,
            include_others: options.bool("includeOthers", true)?,
            limit: options.usize("limit")?,
        }))
    }

    pub fn type_names(&self, engine: &Engine, ctx: &Context) -> VarvResult<Vec<String>> {
        let name = ctx.resolve_text(&self.concept)?;
        engine.require_concept(&name)?;
        if self.include_others {
            engine.get_all_implementing_concept_names(&name)
        } else {
            Ok(vec![name])
        }
    }

    pub async fn lookup(&self, engine: &Engine, ctx: &Context, scope: &ChainScope) -> VarvResult<Vec<String>> {
        let names = self.type_names(engine, ctx)?;
        let query = InstanceQuery::new(&names, ctx)
            .with_filter(self.filter.as_ref())
            .with_limit(self.limit)
            .with_local_concept(scope.local());
        engine.lookup_instances(&query).await
    }

    pub async fn count(&self, engine: &Engine, ctx: &Context, scope: &ChainScope) -> VarvResult<usize> {
        let names = self.type_names(engine, ctx)?;
        let query = InstanceQuery::new(&names, ctx)
            .with_filter(self.filter.as_ref())
            .with_limit(self.limit)
            .with_local_concept(scope.local());
        engine.count_instances(&query).await
    }

    pub async fn exists(&self, engine: &Engine, ctx: &Context, scope: &ChainScope) -> VarvResult<bool> {
        let names = self.type_names(engine, ctx)?;
        let query = InstanceQuery::new(&names, ctx)
            .with_filter(self.filter.as_ref())
            .with_local_concept(scope.local());
        engine.exists_instance(&query).await
    }
}

/// Collects UUID strings from a literal or a list.
pub(super) fn uuids_of(action: &str, value: &Value) -> VarvResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| VarvError::invalid_action(action, format!("{v} is not a UUID")))
            })
            .collect(),
        other => Err(VarvError::invalid_action(action, format!("{other} is not a UUID"))),
    }
}

#[derive(Debug, Clone)]
enum Source {
    Concept(ConceptSet),
    Target(Value),
    Property(String),
}

#[derive(Debug, Clone)]
struct Select {
    source: Source,
    mode: Mode,
    stop_if_empty: bool,
}

impl Select {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("select", json, Some("concept"))?;
        let source = if let Some(set) = ConceptSet::parse(&options)? {
            Source::Concept(set)
        } else if let Some(target) = options.value("target") {
            Source::Target(target)
        } else if let Some(property) = options.str("property")? {
            Source::Property(property)
        } else {
            return Err(options.error("expected 'concept', 'target' or 'property'"));
        };
        Ok(Self {
            source,
            mode: options.mode()?,
            stop_if_empty: options.stop_if_empty()?,
        })
    }

    async fn resolve(&self, engine: &Engine, ctx: &Context, scope: &ChainScope) -> VarvResult<Vec<String>> {
        match &self.source {
            Source::Concept(set) => set.lookup(engine, ctx, scope).await,
            Source::Target(value) => uuids_of("select", &ctx.resolve(value)?),
            Source::Property(name) => {
                let lookup = engine
                    .resolve_property(ctx.target.as_deref(), scope.local(), name)
                    .await?;
                let ty = lookup.property.property_type();
                if ty.referenced_concept().is_none() {
                    return Err(ResolutionError::WrongPropertyType {
                        property: name.clone(),
                        expected: "concept or concept array".to_string(),
                        actual: ty.name(),
                    }
                    .into());
                }
                uuids_of("select", &engine.get_property_value(&lookup).await?)
            }
        }
    }
}

fn fan_out(ctx: &Context, uuids: &[String]) -> Vec<Context> {
    uuids
        .iter()
        .map(|uuid| {
            let mut next = ctx.retarget(uuid.as_str());
            next.concept_uuids = uuids.to_vec();
            next
        })
        .collect()
}

#[async_trait]
impl Action for Select {
    fn name(&self) -> &str {
        "select"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        let out = match self.mode {
            Mode::Bulk => {
                let common = common_context(&contexts);
                let uuids = self.resolve(engine, &common, scope).await?;
                debug!(selected = uuids.len(), contexts = contexts.len(), "bulk select");
                contexts.iter().flat_map(|ctx| fan_out(ctx, &uuids)).collect()
            }
            Mode::ForEach => {
                for_each_context(contexts, |ctx| async move {
                    let uuids = self.resolve(engine, &ctx, scope).await?;
                    Ok::<_, VarvError>(fan_out(&ctx, &uuids))
                })
                .await?
            }
        };
        if out.is_empty() && self.stop_if_empty {
            return Err(VarvError::stop("select matched nothing"));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct Where {
    name: &'static str,
    filter: Filter,
    stop_if_empty: bool,
}

impl Where {
    fn parse(name: &'static str, json: &serde_json::Value) -> VarvResult<Self> {
        if json.is_array() {
            return Ok(Self {
                name,
                filter: Filter::from_json(json)?,
                stop_if_empty: false,
            });
        }
        let mut options = Options::parse(name, json, None)?;
        let stop_if_empty = options.stop_if_empty()?;
        options.take("stopIfEmpty");
        let remaining: serde_json::Map<String, serde_json::Value> =
            options.entries().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Self {
            name,
            filter: Filter::from_json(&serde_json::Value::Object(remaining))?,
            stop_if_empty,
        })
    }
}

#[async_trait]
impl Action for Where {
    fn name(&self) -> &str {
        self.name
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        let kept = for_each_context(contexts, |ctx| async move {
            match self.filter.evaluate(engine, &ctx, scope.local()).await {
                Ok(true) => Ok(Some(ctx)),
                Ok(false) => Ok(None),
                Err(e) => {
                    warn!(action = self.name, error = %e, target = ?ctx.target, "filter failed, context dropped");
                    Ok(None)
                }
            }
        })
        .await?;
        if kept.is_empty() && self.stop_if_empty {
            return Err(VarvError::stop(format!("{} matched nothing", self.name)));
        }
        Ok(kept)
    }
}
