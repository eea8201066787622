//! `count` and `exists`.
//!
//! With a `concept` they query the datastores (count = max over stores,
//! exists = OR); without one they count the incoming contexts, optionally
//! narrowed by `where`. The result lands in a variable on every context.

use async_trait::async_trait;

use crate::action::select::ConceptSet;
use crate::action::{boxed, constructor, for_each_context, Action, ActionRegistry, ChainScope, Mode, Options};
use crate::context::{common_context, Context};
use crate::engine::Engine;
use crate::error::{VarvError, VarvResult};
use crate::filter::Filter;
use crate::value::Value;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("count", constructor(|json, _| boxed(Aggregate::parse(Kind::Count, json)?)));
    registry.register("exists", constructor(|json, _| boxed(Aggregate::parse(Kind::Exists, json)?)));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Count,
    Exists,
}

impl Kind {
    const fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Exists => "exists",
        }
    }
}

#[derive(Debug, Clone)]
struct Aggregate {
    kind: Kind,
    concept: Option<ConceptSet>,
    /// Narrows incoming contexts when no concept is given.
    filter: Option<Filter>,
    mode: Mode,
    variable: String,
}

impl Aggregate {
    fn parse(kind: Kind, json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse(kind.name(), json, Some("concept"))?;
        let concept = ConceptSet::parse(&options)?;
        let filter = if concept.is_none() {
            options.filter("where")?
        } else {
            None
        };
        Ok(Self {
            kind,
            concept,
            filter,
            mode: options.mode()?,
            variable: options.result_variable(kind.name())?,
        })
    }

    async fn compute(&self, engine: &Engine, ctx: &Context, scope: &ChainScope) -> VarvResult<Value> {
        let Some(set) = &self.concept else {
            return Err(VarvError::internal("aggregate without concept"));
        };
        Ok(match self.kind {
            Kind::Count => Value::from(set.count(engine, ctx, scope).await?),
            Kind::Exists => Value::Boolean(set.exists(engine, ctx, scope).await?),
        })
    }

    async fn count_contexts(&self, engine: &Engine, contexts: &[Context], scope: &ChainScope) -> VarvResult<usize> {
        let Some(filter) = &self.filter else {
            return Ok(contexts.len());
        };
        let mut n = 0;
        for ctx in contexts {
            if filter.evaluate(engine, ctx, scope.local()).await? {
                n += 1;
            }
        }
        Ok(n)
    }
}

#[async_trait]
impl Action for Aggregate {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        if self.concept.is_none() {
            let n = self.count_contexts(engine, &contexts, scope).await?;
            let value = match self.kind {
                Kind::Count => Value::from(n),
                Kind::Exists => Value::Boolean(n > 0),
            };
            return Ok(contexts
                .into_iter()
                .map(|ctx| ctx.with_variable(self.variable.clone(), value.clone()))
                .collect());
        }
        match self.mode {
            Mode::Bulk => {
                let value = self.compute(engine, &common_context(&contexts), scope).await?;
                Ok(contexts
                    .into_iter()
                    .map(|ctx| ctx.with_variable(self.variable.clone(), value.clone()))
                    .collect())
            }
            Mode::ForEach => {
                for_each_context(contexts, |ctx| async move {
                    let value = self.compute(engine, &ctx, scope).await?;
                    Ok::<_, VarvError>(ctx.with_variable(self.variable.clone(), value))
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_defaults() {
        let a = Aggregate::parse(Kind::Count, &json!("Todo")).unwrap();
        assert_eq!(a.variable, "count");
        assert!(a.concept.is_some());

        let a = Aggregate::parse(Kind::Exists, &json!({"as": "$any", "where": {"variable": "x", "equals": 1}})).unwrap();
        assert_eq!(a.variable, "any");
        assert!(a.concept.is_none());
        assert!(a.filter.is_some());
    }
}
