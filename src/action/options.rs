//! Option normalization shared by the builtin actions.
//!
//! Every action turns its raw JSON options into a typed record once, at
//! construction. `$name` references inside option values are kept as
//! [`Value`]s and substituted per context when the action runs.

use std::future::Future;

use futures::future::try_join_all;

use crate::action::ChainScope;
use crate::context::Context;
use crate::engine::{Engine, PropertyLookup};
use crate::error::{ResolutionError, VarvError, VarvResult};
use crate::filter::Filter;
use crate::property::PropertyType;
use crate::value::Value;

/// Whether a set-like action runs once per chain or once per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Once, against the common context (default).
    Bulk,
    /// Independently for each context.
    ForEach,
}

/// Raw option map of one action step.
#[derive(Debug, Clone)]
pub struct Options {
    action: String,
    map: serde_json::Map<String, serde_json::Value>,
}

impl Options {
    /// Normalizes `json` into an option map.
    ///
    /// Objects are taken as-is, `null` is empty, and any other value is the
    /// shorthand form stored under `shorthand` (if the action has one).
    pub fn parse(action: &str, json: &serde_json::Value, shorthand: Option<&str>) -> VarvResult<Self> {
        let map = match (json, shorthand) {
            (serde_json::Value::Object(map), _) => map.clone(),
            (serde_json::Value::Null, _) => serde_json::Map::new(),
            (other, Some(key)) => {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), other.clone());
                map
            }
            (other, None) => {
                return Err(VarvError::invalid_action(action, format!("unsupported options {other}")));
            }
        };
        Ok(Self {
            action: action.to_string(),
            map,
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn error(&self, reason: impl Into<String>) -> VarvError {
        VarvError::invalid_action(&self.action, reason)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.map.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.map.iter()
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(Value::from)
    }

    /// Removes a key, returning its value.
    pub fn take(&mut self, key: &str) -> Option<serde_json::Value> {
        self.map.remove(key)
    }

    pub fn str(&self, key: &str) -> VarvResult<Option<String>> {
        match self.map.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.error(format!("'{key}' must be a string, got {other}"))),
        }
    }

    pub fn bool(&self, key: &str, default: bool) -> VarvResult<bool> {
        match self.map.get(key) {
            None | Some(serde_json::Value::Null) => Ok(default),
            Some(serde_json::Value::Bool(b)) => Ok(*b),
            Some(other) => Err(self.error(format!("'{key}' must be a boolean, got {other}"))),
        }
    }

    pub fn usize(&self, key: &str) -> VarvResult<Option<usize>> {
        match self.map.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.error(format!("'{key}' must be a non-negative integer"))),
        }
    }

    pub fn filter(&self, key: &str) -> VarvResult<Option<Filter>> {
        self.map.get(key).map(Filter::from_json).transpose()
    }

    /// `forEach` flag; bulk unless set.
    pub fn mode(&self) -> VarvResult<Mode> {
        Ok(if self.bool("forEach", false)? {
            Mode::ForEach
        } else {
            Mode::Bulk
        })
    }

    pub fn stop_if_empty(&self) -> VarvResult<bool> {
        self.bool("stopIfEmpty", false)
    }

    /// Finds the dual-target slot under one of `keys`, or inline.
    pub fn slot(&self, keys: &[&str]) -> VarvResult<Slot> {
        for key in keys {
            match self.map.get(*key) {
                Some(serde_json::Value::Object(inner)) => return Slot::from_map(&self.action, inner),
                Some(serde_json::Value::String(name)) => return Ok(Slot::Property(name.clone())),
                Some(other) => return Err(self.error(format!("'{key}' must name a property or variable, got {other}"))),
                None => {}
            }
        }
        Slot::from_map(&self.action, &self.map)
    }

    /// Name of the variable a result is written to (`as`).
    pub fn result_variable(&self, default: &str) -> VarvResult<String> {
        Ok(self
            .str("as")?
            .map(|s| s.strip_prefix('$').map(str::to_string).unwrap_or(s))
            .unwrap_or_else(|| default.to_string()))
    }
}

/// Output of a per-context step: drop the context, keep one, or fan out.
#[derive(Debug)]
pub enum Emit {
    Drop,
    One(Context),
    Many(Vec<Context>),
}

impl From<Context> for Emit {
    fn from(ctx: Context) -> Self {
        Self::One(ctx)
    }
}

impl From<Option<Context>> for Emit {
    fn from(ctx: Option<Context>) -> Self {
        ctx.map_or(Self::Drop, Self::One)
    }
}

impl From<Vec<Context>> for Emit {
    fn from(contexts: Vec<Context>) -> Self {
        Self::Many(contexts)
    }
}

/// Runs `f` for every context and flattens the results in input order.
///
/// All contexts are processed concurrently and joined before returning,
/// which is the barrier between two chain steps.
pub async fn for_each_context<F, Fut, R>(contexts: Vec<Context>, f: F) -> VarvResult<Vec<Context>>
where
    F: Fn(Context) -> Fut,
    Fut: Future<Output = VarvResult<R>>,
    R: Into<Emit>,
{
    let results = try_join_all(contexts.into_iter().map(f)).await?;
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        match result.into() {
            Emit::Drop => {}
            Emit::One(ctx) => out.push(ctx),
            Emit::Many(many) => out.extend(many),
        }
    }
    Ok(out)
}

/// What a slot may hold for an action to accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Array,
    ArrayOrString,
    Any,
}

impl Accept {
    fn property_ok(self, ty: &PropertyType) -> bool {
        match self {
            Self::Array => ty.is_array(),
            Self::ArrayOrString => ty.is_array() || *ty == PropertyType::String,
            Self::Any => true,
        }
    }

    fn value_ok(self, v: &Value) -> bool {
        match self {
            Self::Array => v.is_array(),
            Self::ArrayOrString => v.is_array() || v.is_string(),
            Self::Any => true,
        }
    }

    const fn expected(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::ArrayOrString => "array or string",
            Self::Any => "any",
        }
    }
}

/// Either a property (resolved through the engine) or a chain variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Property(String),
    Variable(String),
}

impl Slot {
    fn from_map(action: &str, map: &serde_json::Map<String, serde_json::Value>) -> VarvResult<Self> {
        let name = |key: &str| map.get(key).and_then(serde_json::Value::as_str).map(str::to_string);
        if let Some(p) = name("property") {
            return Ok(Self::Property(p));
        }
        if let Some(v) = name("variable") {
            return Ok(Self::Variable(v.strip_prefix('$').map(str::to_string).unwrap_or(v)));
        }
        Err(VarvError::invalid_action(action, "expected a 'property' or 'variable' target"))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Property(n) | Self::Variable(n) => n,
        }
    }

    /// Reads the slot, checking the declared (or runtime) type first.
    pub async fn load(
        &self,
        engine: &Engine,
        ctx: &Context,
        scope: &ChainScope,
        accept: Accept,
    ) -> VarvResult<Loaded> {
        match self {
            Self::Property(name) => {
                let lookup = engine
                    .resolve_property(ctx.target.as_deref(), scope.local(), name)
                    .await?;
                let ty = lookup.property.property_type();
                if !accept.property_ok(ty) {
                    return Err(ResolutionError::WrongPropertyType {
                        property: name.clone(),
                        expected: accept.expected().to_string(),
                        actual: ty.name(),
                    }
                    .into());
                }
                let value = engine.get_property_value(&lookup).await?;
                let value = if value.is_null() && ty.is_array() {
                    Value::Array(Vec::new())
                } else if value.is_null() && *ty == PropertyType::String {
                    Value::String(String::new())
                } else {
                    value
                };
                Ok(Loaded {
                    lookup: Some(lookup),
                    variable: None,
                    value,
                })
            }
            Self::Variable(name) => {
                let value = ctx.variable(name)?.clone();
                if !accept.value_ok(&value) {
                    return Err(ResolutionError::WrongPropertyType {
                        property: format!("${name}"),
                        expected: accept.expected().to_string(),
                        actual: value.kind().name().to_string(),
                    }
                    .into());
                }
                Ok(Loaded {
                    lookup: None,
                    variable: Some(name.clone()),
                    value,
                })
            }
        }
    }
}

/// A slot's value together with where to write it back.
#[derive(Debug)]
pub struct Loaded {
    lookup: Option<PropertyLookup>,
    variable: Option<String>,
    pub value: Value,
}

impl Loaded {
    /// Persists through `set_value` for properties, mutates the variable otherwise.
    pub async fn store(&self, engine: &Engine, ctx: &mut Context, value: Value) -> VarvResult<()> {
        if let Some(lookup) = &self.lookup {
            engine.set_property_value(lookup, &value).await?;
        } else if let Some(name) = &self.variable {
            ctx.set_variable(name.clone(), value);
        }
        Ok(())
    }
}
