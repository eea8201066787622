//! Actions and action chains.
//!
//! A chain is an ordered list of steps over a list of [`Context`]s. Each step
//! receives every context that survived the previous step and returns a new
//! list: fewer (filtering), more (fan-out) or transformed. The next step
//! starts only after the current one has finished for all contexts.
//!
//! A step name is resolved at run time:
//! 1. `Concept.behaviour` dotted form
//! 2. a behaviour of the chain's own concept
//! 3. a behaviour of the current target's concept
//! 4. the builtin primitive prepared when the chain was parsed

mod aggregate;
mod array;
mod flow;
mod lifecycle;
pub mod options;
mod select;
mod sort;
mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::behaviour::Behaviour;
use crate::context::{common_target, Context};
use crate::engine::Engine;
use crate::error::{ResolutionError, SpecError, VarvError, VarvResult};

pub use options::{for_each_context, Accept, Emit, Loaded, Mode, Options, Slot};

/// Execution scope of a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainScope {
    /// Concept whose behaviour is running; first choice for name lookups.
    pub local_concept: Option<String>,
    /// Behaviour whose chain is running. A step with the same name refers
    /// to the primitive, not back to the behaviour.
    pub behaviour: Option<String>,
    /// Nesting depth of behaviour invocations.
    pub depth: usize,
}

impl ChainScope {
    #[must_use]
    pub fn new(local_concept: Option<String>) -> Self {
        Self {
            local_concept,
            behaviour: None,
            depth: 0,
        }
    }

    /// Top-level scope of a behaviour's chain.
    #[must_use]
    pub fn for_behaviour(behaviour: &Behaviour) -> Self {
        Self {
            local_concept: Some(behaviour.concept().to_string()),
            behaviour: Some(behaviour.name().to_string()),
            depth: 0,
        }
    }

    #[must_use]
    pub fn local(&self) -> Option<&str> {
        self.local_concept.as_deref()
    }

    /// Scope for a behaviour invoked from this one.
    #[must_use]
    pub fn nested(&self, behaviour: &Behaviour) -> Self {
        Self {
            local_concept: Some(behaviour.concept().to_string()),
            behaviour: Some(behaviour.name().to_string()),
            depth: self.depth + 1,
        }
    }
}

/// A primitive chain step.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Transforms the incoming contexts.
    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>>;
}

/// Builds an action from its options. Nested chains are parsed with the
/// registry passed in.
pub type ActionConstructor =
    Arc<dyn Fn(&serde_json::Value, &ActionRegistry) -> VarvResult<Arc<dyn Action>> + Send + Sync>;

/// Primitive actions by name.
#[derive(Clone)]
pub struct ActionRegistry {
    constructors: BTreeMap<String, ActionConstructor>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        select::register(&mut registry);
        aggregate::register(&mut registry);
        lifecycle::register(&mut registry);
        sort::register(&mut registry);
        state::register(&mut registry);
        flow::register(&mut registry);
        array::register(&mut registry);
        registry
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

impl ActionRegistry {
    /// A registry without builtins.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers (or replaces) a primitive.
    pub fn register(&mut self, name: impl Into<String>, constructor: ActionConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Builds the primitive `name`, `None` if no such primitive exists.
    pub fn build(&self, name: &str, options: &serde_json::Value) -> Option<VarvResult<Arc<dyn Action>>> {
        self.constructors.get(name).map(|ctor| ctor(options, self))
    }

    /// Parses a chain from its JSON step list.
    ///
    /// A step is either a bare name (`"remove"`) or a single-key object
    /// (`{"select": {...}}`).
    pub fn parse_chain(&self, steps: &[serde_json::Value]) -> VarvResult<ActionChain> {
        steps
            .iter()
            .map(|step| self.parse_step(step))
            .collect::<VarvResult<Vec<_>>>()
            .map(|steps| ActionChain { steps })
    }

    fn parse_step(&self, step: &serde_json::Value) -> VarvResult<ActionStep> {
        let (name, options) = match step {
            serde_json::Value::String(name) => (name.clone(), serde_json::Value::Null),
            serde_json::Value::Object(map) if map.len() == 1 => {
                let Some((name, options)) = map.iter().next() else {
                    return Err(invalid_step(step));
                };
                (name.clone(), options.clone())
            }
            _ => return Err(invalid_step(step)),
        };
        let (primitive, rejected) = match self.build(&name, &options) {
            None => (None, None),
            Some(Ok(action)) => (Some(action), None),
            Some(Err(VarvError::Spec(e))) => {
                debug!(step = %name, error = %e, "options do not fit the primitive, step must name a behaviour");
                (None, Some(e))
            }
            Some(Err(e)) => return Err(e),
        };
        Ok(ActionStep {
            name,
            options,
            primitive,
            rejected,
        })
    }
}

fn invalid_step(step: &serde_json::Value) -> VarvError {
    SpecError::Invalid {
        reason: format!("action step must be a name or a single-key object, got {step}"),
    }
    .into()
}

/// What a step name resolved to.
#[derive(Clone)]
pub enum ResolvedAction {
    Behaviour(Arc<Behaviour>),
    Primitive(Arc<dyn Action>),
}

/// One step of a chain with its prepared primitive, if the name has one.
#[derive(Clone)]
pub struct ActionStep {
    name: String,
    options: serde_json::Value,
    primitive: Option<Arc<dyn Action>>,
    /// Why the options were refused by the primitive of the same name.
    rejected: Option<SpecError>,
}

impl fmt::Debug for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionStep")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("primitive", &self.primitive.is_some())
            .field("rejected", &self.rejected)
            .finish()
    }
}

impl ActionStep {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn options(&self) -> &serde_json::Value {
        &self.options
    }

    async fn execute(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        let target = common_target(&contexts);
        if let Some(rejected) = &self.rejected {
            let behaviour = engine
                .lookup_behaviour(&self.name, scope, target.as_deref())
                .await?
                .ok_or_else(|| VarvError::from(rejected.clone()))?;
            return invoke_behaviour(engine, &behaviour, &self.options, contexts, scope).await;
        }
        let resolved = engine
            .lookup_action(&self.name, scope, target.as_deref(), self.primitive.as_ref())
            .await?
            .ok_or_else(|| ResolutionError::ActionNotFound {
                name: self.name.clone(),
            })?;
        match resolved {
            ResolvedAction::Primitive(action) => action.apply(engine, contexts, scope).await,
            ResolvedAction::Behaviour(behaviour) => {
                invoke_behaviour(engine, &behaviour, &self.options, contexts, scope).await
            }
        }
    }
}

/// Runs another behaviour's chain with the step options bound as variables.
async fn invoke_behaviour(
    engine: &Engine,
    behaviour: &Behaviour,
    arguments: &serde_json::Value,
    contexts: Vec<Context>,
    scope: &ChainScope,
) -> VarvResult<Vec<Context>> {
    if scope.depth + 1 > engine.config().max_call_depth {
        return Err(VarvError::invalid_action(
            behaviour.name(),
            format!("call depth limit {} reached", engine.config().max_call_depth),
        ));
    }
    let arguments = Options::parse(behaviour.name(), arguments, None)?;
    let mut bound = Vec::with_capacity(contexts.len());
    for mut ctx in contexts {
        for (key, raw) in arguments.entries() {
            let value = ctx.resolve(&raw.into())?;
            ctx.set_variable(key.strip_prefix('$').unwrap_or(key), value);
        }
        bound.push(ctx);
    }
    let nested = scope.nested(behaviour);
    behaviour.chain().run(engine, bound, &nested).await
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default)]
pub struct ActionChain {
    steps: Vec<ActionStep>,
}

impl ActionChain {
    #[must_use]
    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step in order; an empty context list ends the chain.
    pub fn run<'a>(
        &'a self,
        engine: &'a Engine,
        contexts: Vec<Context>,
        scope: &'a ChainScope,
    ) -> BoxFuture<'a, VarvResult<Vec<Context>>> {
        async move {
            let mut contexts = contexts;
            for (index, step) in self.steps.iter().enumerate() {
                if contexts.is_empty() {
                    debug!(step = %step.name, index, "chain ended: no contexts left");
                    break;
                }
                debug!(step = %step.name, index, contexts = contexts.len(), "running step");
                contexts = step.execute(engine, contexts, scope).await?;
            }
            Ok(contexts)
        }
        .boxed()
    }
}

pub(crate) fn constructor<F>(f: F) -> ActionConstructor
where
    F: Fn(&serde_json::Value, &ActionRegistry) -> VarvResult<Arc<dyn Action>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Helper for constructors: wrap a typed action.
pub(crate) fn boxed<A: Action + 'static>(action: A) -> VarvResult<Arc<dyn Action>> {
    Ok(Arc::new(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_chain_prepares_primitives() {
        let registry = ActionRegistry::default();
        let chain = registry
            .parse_chain(&[json!({"select": "Todo"}), json!("custom"), json!({"sort": {"by": "rank", "order": "sideways"}})])
            .unwrap();
        let names: Vec<&str> = chain.steps().iter().map(ActionStep::name).collect();
        assert_eq!(names, vec!["select", "custom", "sort"]);
        assert!(chain.steps()[0].primitive.is_some());
        assert!(chain.steps()[1].primitive.is_none());
        assert!(chain.steps()[2].rejected.is_some());
    }

    #[test]
    fn test_malformed_step_is_rejected() {
        let registry = ActionRegistry::default();
        assert!(registry.parse_chain(&[json!(3)]).is_err());
        assert!(registry.parse_chain(&[json!({"set": {}, "sort": {}})]).is_err());
    }
}
