//! Instance lifecycle steps: `new`, `remove`, `clone`, `setType`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use crate::action::select::uuids_of;
use crate::action::{boxed, constructor, for_each_context, Action, ActionRegistry, ChainScope, Mode, Options};
use crate::context::{common_context, Context};
use crate::engine::Engine;
use crate::error::{ResolutionError, VarvError, VarvResult};
use crate::value::Value;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("new", constructor(|json, _| boxed(New::parse(json)?)));
    registry.register("remove", constructor(|json, _| boxed(Remove::parse(json)?)));
    registry.register("clone", constructor(|json, _| boxed(CloneInstance::parse(json)?)));
    registry.register("setType", constructor(|json, _| boxed(SetType::parse(json)?)));
}

/// UUIDs named by `target` (after substitution), else the context target.
fn targets_of(action: &str, explicit: Option<&Value>, ctx: &Context) -> VarvResult<Vec<String>> {
    match explicit {
        Some(value) => uuids_of(action, &ctx.resolve(value)?),
        None => ctx.target.clone().map(|t| vec![t]).ok_or_else(|| {
            ResolutionError::MissingTarget {
                action: action.to_string(),
            }
            .into()
        }),
    }
}

async fn concept_of(engine: &Engine, uuid: &str) -> VarvResult<std::sync::Arc<crate::concept::Concept>> {
    engine
        .get_concept_from_uuid(uuid)
        .await?
        .ok_or_else(|| {
            ResolutionError::UnknownInstance {
                uuid: uuid.to_string(),
            }
            .into()
        })
}

#[derive(Debug, Clone)]
struct New {
    concept: String,
    with: BTreeMap<String, Value>,
    select: bool,
    mode: Mode,
    variable: Option<String>,
}

impl New {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("new", json, Some("concept"))?;
        let concept = options
            .str("concept")?
            .ok_or_else(|| options.error("missing 'concept'"))?;
        let with = match options.raw("with") {
            None | Some(serde_json::Value::Null) => BTreeMap::new(),
            Some(serde_json::Value::Object(map)) => {
                map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect()
            }
            Some(other) => return Err(options.error(format!("'with' must be an object, got {other}"))),
        };
        let mode = options.mode()?;
        let mut select = options.bool("select", true)?;
        if mode == Mode::Bulk && !select {
            warn!(concept = %concept, "new: select:false is overridden in bulk mode, the new instance is selected");
            select = true;
        }
        Ok(Self {
            concept,
            with,
            select,
            mode,
            variable: options.str("as")?.map(|s| s.trim_start_matches('$').to_string()),
        })
    }

    async fn create(&self, engine: &Engine, ctx: &Context) -> VarvResult<String> {
        let name = ctx.resolve_text(&self.concept)?;
        let concept = engine.require_concept(&name)?;
        let mut values = BTreeMap::new();
        for (key, raw) in &self.with {
            values.insert(key.clone(), ctx.resolve(raw)?);
        }
        concept.create(engine, None, values).await
    }

    fn emit(&self, ctx: &Context, uuid: &str) -> Context {
        let mut next = if self.select {
            ctx.retarget(uuid)
        } else {
            ctx.clone()
        };
        if let Some(var) = &self.variable {
            next.set_variable(var.clone(), uuid);
        }
        next
    }
}

#[async_trait]
impl Action for New {
    fn name(&self) -> &str {
        "new"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, _scope: &ChainScope) -> VarvResult<Vec<Context>> {
        match self.mode {
            Mode::Bulk => {
                let uuid = self.create(engine, &common_context(&contexts)).await?;
                Ok(contexts.iter().map(|ctx| self.emit(ctx, &uuid)).collect())
            }
            Mode::ForEach => {
                for_each_context(contexts, |ctx| async move {
                    let uuid = self.create(engine, &ctx).await?;
                    Ok::<_, VarvError>(self.emit(&ctx, &uuid))
                })
                .await
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Remove {
    target: Option<Value>,
}

impl Remove {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("remove", json, Some("target"))?;
        Ok(Self {
            target: options.value("target"),
        })
    }
}

#[async_trait]
impl Action for Remove {
    fn name(&self) -> &str {
        "remove"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, _scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |ctx| async move {
            let uuids = targets_of("remove", self.target.as_ref(), &ctx)?;
            for uuid in &uuids {
                let concept = concept_of(engine, uuid).await?;
                concept.delete(engine, uuid).await?;
            }
            let target_gone = ctx.target.as_ref().is_some_and(|t| uuids.contains(t));
            Ok::<_, VarvError>(if target_gone { None } else { Some(ctx) })
        })
        .await
    }
}

#[derive(Debug, Clone)]
struct CloneInstance {
    target: Option<Value>,
    deep: bool,
}

impl CloneInstance {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("clone", json, Some("deep"))?;
        Ok(Self {
            target: options.value("target"),
            deep: options.bool("deep", false)?,
        })
    }
}

#[async_trait]
impl Action for CloneInstance {
    fn name(&self) -> &str {
        "clone"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, _scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |ctx| async move {
            let mut out = Vec::new();
            for uuid in targets_of("clone", self.target.as_ref(), &ctx)? {
                let concept = concept_of(engine, &uuid).await?;
                let copy = concept.clone_instance(engine, &uuid, self.deep).await?;
                out.push(ctx.retarget(copy));
            }
            Ok::<_, VarvError>(out)
        })
        .await
    }
}

#[derive(Debug, Clone)]
struct SetType {
    concept: String,
}

impl SetType {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("setType", json, Some("concept"))?;
        Ok(Self {
            concept: options
                .str("concept")?
                .ok_or_else(|| options.error("missing 'concept'"))?,
        })
    }
}

#[async_trait]
impl Action for SetType {
    fn name(&self) -> &str {
        "setType"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, _scope: &ChainScope) -> VarvResult<Vec<Context>> {
        warn!(concept = %self.concept, "setType is experimental");
        for_each_context(contexts, |ctx| async move {
            let uuid = ctx.target.clone().ok_or_else(|| ResolutionError::MissingTarget {
                action: "setType".to_string(),
            })?;
            let name = ctx.resolve_text(&self.concept)?;
            engine.switch_concept_type(&uuid, &name).await?;
            Ok::<_, VarvError>(ctx)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_bulk_forces_select() {
        let n = New::parse(&json!({"concept": "Todo", "select": false})).unwrap();
        assert!(n.select);
        let n = New::parse(&json!({"concept": "Todo", "select": false, "forEach": true})).unwrap();
        assert!(!n.select);
    }

    #[test]
    fn test_new_shorthand_and_with() {
        let n = New::parse(&json!("Todo")).unwrap();
        assert_eq!(n.concept, "Todo");
        let n = New::parse(&json!({"concept": "Todo", "with": {"title": "$t"}, "as": "$made"})).unwrap();
        assert_eq!(n.with.get("title"), Some(&Value::from("$t")));
        assert_eq!(n.variable.as_deref(), Some("made"));
        assert!(New::parse(&json!({"with": {}})).is_err());
    }

    #[test]
    fn test_targets_default_to_context() {
        let ctx = Context::with_target("u1").with_variable("other", "u2");
        assert_eq!(targets_of("remove", None, &ctx).unwrap(), vec!["u1".to_string()]);
        assert_eq!(
            targets_of("remove", Some(&Value::from("$other")), &ctx).unwrap(),
            vec!["u2".to_string()]
        );
        assert!(targets_of("remove", None, &Context::new()).is_err());
    }
}
