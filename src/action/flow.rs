//! `if`: routes contexts into a `then` or `else` sub-chain.
//!
//! ```text
//! {"if": {"where": {"property": "done", "equals": true},
//!         "then": ["remove"],
//!         "else": [{"set": {"done": true}}]}}
//! ```
//!
//! Passing contexts run through `then` together, the rest through `else`
//! (or pass unchanged when there is none). The output is the `then` result
//! followed by the `else` result.

use async_trait::async_trait;
use tracing::warn;

use crate::action::{boxed, constructor, Action, ActionChain, ActionRegistry, ChainScope, Options};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::VarvResult;
use crate::filter::Filter;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("if", constructor(|json, reg| boxed(If::parse(json, reg)?)));
}

#[derive(Debug, Clone)]
struct If {
    condition: Filter,
    then: ActionChain,
    otherwise: Option<ActionChain>,
}

fn sub_chain(options: &Options, key: &str, registry: &ActionRegistry) -> VarvResult<Option<ActionChain>> {
    match options.raw(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Array(steps)) => registry.parse_chain(steps).map(Some),
        Some(single) => registry.parse_chain(std::slice::from_ref(single)).map(Some),
    }
}

impl If {
    fn parse(json: &serde_json::Value, registry: &ActionRegistry) -> VarvResult<Self> {
        let options = Options::parse("if", json, None)?;
        let condition = match options.filter("where")? {
            Some(f) => f,
            None => options
                .filter("condition")?
                .ok_or_else(|| options.error("missing 'where'"))?,
        };
        Ok(Self {
            condition,
            then: sub_chain(&options, "then", registry)?.unwrap_or_default(),
            otherwise: sub_chain(&options, "else", registry)?,
        })
    }
}

#[async_trait]
impl Action for If {
    fn name(&self) -> &str {
        "if"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for ctx in contexts {
            match self.condition.evaluate(engine, &ctx, scope.local()).await {
                Ok(true) => passed.push(ctx),
                Ok(false) => failed.push(ctx),
                Err(e) => {
                    warn!(error = %e, target = ?ctx.target, "if: condition failed, taking else branch");
                    failed.push(ctx);
                }
            }
        }
        let mut out = if passed.is_empty() {
            Vec::new()
        } else {
            self.then.run(engine, passed, scope).await?
        };
        match &self.otherwise {
            Some(chain) if !failed.is_empty() => out.extend(chain.run(engine, failed, scope).await?),
            Some(_) => {}
            None => out.extend(failed),
        }
        Ok(out)
    }
}
