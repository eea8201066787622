//! Execution contexts flowing through action chains.
//!
//! A [`Context`] is the unit of dataflow: the current subject UUID plus the
//! chain's scratch variables. Steps clone a context before changing it, so a
//! context handed to a step is never mutated behind another branch's back.

use std::collections::BTreeMap;

use crate::error::{ResolutionError, VarvResult};
use crate::value::Value;

/// Variable name that falls back to the context target during substitution.
pub const TARGET_VARIABLE: &str = "target";

/// The unit of data flowing through an action chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    /// Current subject UUID.
    pub target: Option<String>,
    /// Named scratch values scoped to the chain execution.
    pub variables: BTreeMap<String, Value>,
    /// Target before the most recent retarget.
    pub last_target: Option<String>,
    /// UUIDs collected by set-producing steps.
    pub concept_uuids: Vec<String>,
    /// Originating native event payload, when the trigger had one.
    pub event: Option<Value>,
}

impl Context {
    /// Creates an empty, target-less context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context targeting `uuid`.
    #[must_use]
    pub fn with_target(uuid: impl Into<String>) -> Self {
        Self {
            target: Some(uuid.into()),
            ..Self::default()
        }
    }

    /// Returns a copy of this context pointing at `uuid`, remembering the old target.
    #[must_use]
    pub fn retarget(&self, uuid: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.last_target = self.target.clone();
        next.target = Some(uuid.into());
        next
    }

    /// Builder-style variable binding.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Looks up a variable, failing with `UnknownVariable` when unset.
    pub fn variable(&self, name: &str) -> VarvResult<&Value> {
        self.variables.get(name).ok_or_else(|| {
            ResolutionError::UnknownVariable {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Substitutes `$name` references in a value.
    ///
    /// Strings of the exact form `$name` are replaced by the variable's value;
    /// `$target` falls back to the context target when no such variable is
    /// bound. Arrays and objects are substituted element-wise.
    pub fn resolve(&self, value: &Value) -> VarvResult<Value> {
        match value {
            Value::String(s) => match variable_reference(s) {
                Some(name) => self.resolve_reference(name),
                None => Ok(value.clone()),
            },
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item))
                    .collect::<VarvResult<Vec<_>>>()?,
            )),
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Substitutes a string that may be a `$name` reference, returning text.
    pub fn resolve_text(&self, text: &str) -> VarvResult<String> {
        match variable_reference(text) {
            Some(name) => Ok(self.resolve_reference(name)?.to_text()),
            None => Ok(text.to_string()),
        }
    }

    fn resolve_reference(&self, name: &str) -> VarvResult<Value> {
        if let Some(v) = self.variables.get(name) {
            return Ok(v.clone());
        }
        if name == TARGET_VARIABLE {
            if let Some(target) = &self.target {
                return Ok(Value::String(target.clone()));
            }
        }
        Err(ResolutionError::UnknownVariable {
            name: name.to_string(),
        }
        .into())
    }
}

/// Returns the variable name if `s` is a `$name` reference.
#[must_use]
pub fn variable_reference(s: &str) -> Option<&str> {
    let name = s.strip_prefix('$')?;
    if name.is_empty() || name.starts_with('$') {
        return None;
    }
    Some(name)
}

/// Variables bound to the same value in every context.
#[must_use]
pub fn common_variables(contexts: &[Context]) -> BTreeMap<String, Value> {
    let Some((first, rest)) = contexts.split_first() else {
        return BTreeMap::new();
    };
    first
        .variables
        .iter()
        .filter(|(name, value)| {
            rest.iter()
                .all(|ctx| ctx.variables.get(*name).is_some_and(|v| v.same_as(value)))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The target shared by every context, or `None` when they disagree or are empty.
#[must_use]
pub fn common_target(contexts: &[Context]) -> Option<String> {
    let (first, rest) = contexts.split_first()?;
    let target = first.target.as_ref()?;
    if rest.iter().all(|ctx| ctx.target.as_ref() == Some(target)) {
        Some(target.clone())
    } else {
        None
    }
}

/// The context a bulk-mode step runs against: common target plus common variables.
#[must_use]
pub fn common_context(contexts: &[Context]) -> Context {
    Context {
        target: common_target(contexts),
        variables: common_variables(contexts),
        ..Context::default()
    }
}
