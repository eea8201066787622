//! Triggers: event sources that start behaviour chains.
//!
//! A trigger is built per behaviour from its `when` entry and stays idle
//! until [`Trigger::enable`] hands it a [`TriggerBinding`]. Bindings hold
//! weak references so a running trigger never keeps an engine alive.

mod builtin;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::behaviour::{Behaviour, ChainOutcome};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{SpecError, VarvError, VarvResult};

pub use builtin::{EventKind, EventTrigger, IntervalTrigger};

/// An event source bound to one behaviour.
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    /// Starts listening. Must subscribe before returning so no event
    /// published afterwards is missed.
    fn enable(&self, binding: TriggerBinding) -> VarvResult<()>;

    fn disable(&self);

    fn is_enabled(&self) -> bool;
}

impl fmt::Debug for dyn Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger").field("name", &self.name()).finish()
    }
}

/// Connection from a trigger back to its behaviour.
#[derive(Clone)]
pub struct TriggerBinding {
    engine: Weak<Engine>,
    behaviour: Weak<Behaviour>,
    concept: String,
}

impl fmt::Debug for TriggerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBinding")
            .field("concept", &self.concept)
            .field("live", &(self.engine.strong_count() > 0))
            .finish()
    }
}

impl TriggerBinding {
    #[must_use]
    pub fn new(engine: &Arc<Engine>, behaviour: &Arc<Behaviour>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
            behaviour: Arc::downgrade(behaviour),
            concept: behaviour.concept().to_string(),
        }
    }

    /// Concept owning the behaviour.
    #[must_use]
    pub fn concept(&self) -> &str {
        &self.concept
    }

    #[must_use]
    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.upgrade()
    }

    /// Runs the behaviour with one context. `None` once the engine or
    /// behaviour is gone, or when the chain failed (already logged).
    pub async fn fire(&self, context: Context) -> Option<ChainOutcome> {
        let engine = self.engine.upgrade()?;
        let behaviour = self.behaviour.upgrade()?;
        behaviour.dispatch(&engine, vec![context]).await
    }
}

/// Builds a trigger from its options.
pub type TriggerConstructor = Arc<dyn Fn(&serde_json::Value) -> VarvResult<Arc<dyn Trigger>> + Send + Sync>;

/// Trigger types by name.
#[derive(Clone)]
pub struct TriggerRegistry {
    constructors: BTreeMap<String, TriggerConstructor>,
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        registry
    }
}

impl TriggerRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: TriggerConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Builds the trigger for one `when` entry: a bare name or a
    /// single-key object.
    pub fn parse(&self, entry: &serde_json::Value) -> VarvResult<Arc<dyn Trigger>> {
        static NO_OPTIONS: serde_json::Value = serde_json::Value::Null;
        let (name, options) = match entry {
            serde_json::Value::String(name) => (name.as_str(), &NO_OPTIONS),
            serde_json::Value::Object(map) if map.len() == 1 => match map.iter().next() {
                Some((name, options)) => (name.as_str(), options),
                None => return Err(invalid(entry)),
            },
            _ => return Err(invalid(entry)),
        };
        let constructor = self.constructors.get(name).ok_or_else(|| SpecError::InvalidTrigger {
            trigger: name.to_string(),
            reason: "unknown trigger type".to_string(),
        })?;
        constructor(options)
    }
}

fn invalid(entry: &serde_json::Value) -> VarvError {
    SpecError::InvalidTrigger {
        trigger: entry.to_string(),
        reason: "expected a name or a single-key object".to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_builtin_entries() {
        let registry = TriggerRegistry::default();
        assert_eq!(registry.parse(&json!({"appeared": "Todo"})).unwrap().name(), "appeared");
        assert_eq!(registry.parse(&json!({"interval": 50})).unwrap().name(), "interval");
        assert_eq!(
            registry
                .parse(&json!({"stateChanged": {"property": "done"}}))
                .unwrap()
                .name(),
            "stateChanged"
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        let registry = TriggerRegistry::default();
        let err = registry.parse(&json!({"click": {}})).unwrap_err();
        assert!(err.is_spec());
        assert!(registry.parse(&json!({"a": 1, "b": 2})).is_err());
        assert!(registry.parse(&json!(3)).is_err());
    }
}
