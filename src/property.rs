//! Typed property descriptors with multi-datastore fan-out.
//!
//! A [`Property`] owns no values. Each datastore mapping the property installs
//! a [`PropertyBackend`]; reads race the backends and take the first answer,
//! writes go to every backend so co-backing stores stay consistent.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::datastore::DatastoreError;
use crate::error::{lock_err, SpecError, ValidationError, VarvResult};
use crate::expr::Expression;
use crate::fanout::{first_success, write_all};
use crate::value::Value;

/// Declared type of a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    /// Array with an optional element type.
    Array(Option<Box<PropertyType>>),
    /// Reference to an instance of the named concept.
    Concept(String),
}

impl PropertyType {
    /// Parses a type name, treating unknown names as concept references.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "string" => Self::String,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "array" => Self::Array(None),
            other => Self::Concept(other.to_string()),
        }
    }

    /// Human-readable type name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Number => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Array(None) => "array".to_string(),
            Self::Array(Some(items)) => format!("array<{}>", items.name()),
            Self::Concept(name) => name.clone(),
        }
    }

    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// Element type of an array property.
    #[must_use]
    pub fn items(&self) -> Option<&PropertyType> {
        match self {
            Self::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Concept name for concept references, or arrays of them.
    #[must_use]
    pub fn referenced_concept(&self) -> Option<&str> {
        match self {
            Self::Concept(name) => Some(name),
            Self::Array(Some(items)) => items.referenced_concept(),
            _ => None,
        }
    }

    /// Coerces a raw value into this type.
    ///
    /// Deterministic and idempotent: `cast(cast(v)) == cast(v)`. `Null`
    /// passes through unchanged for every type.
    pub fn cast(&self, value: &Value) -> Result<Value, ValidationError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let fail = || ValidationError::CastFailed {
            value: value.to_string(),
            target_type: self.name(),
        };
        match self {
            Self::String => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(_) | Value::Boolean(_) => Ok(Value::String(value.to_text())),
                _ => Err(fail()),
            },
            Self::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::Boolean(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(Value::Number)
                    .ok_or_else(fail),
                _ => Err(fail()),
            },
            Self::Boolean => match value {
                Value::Boolean(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::Boolean(*n != 0.0)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Boolean(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Boolean(false)),
                _ => Err(fail()),
            },
            Self::Concept(_) => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(fail()),
            },
            Self::Array(items) => {
                let elements = match value {
                    Value::Array(elements) => elements.clone(),
                    Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
                        Ok(serde_json::Value::Array(parsed)) => {
                            parsed.into_iter().map(Value::from).collect()
                        }
                        _ => return Err(fail()),
                    },
                    _ => return Err(fail()),
                };
                match items {
                    Some(items) => Ok(Value::Array(
                        elements
                            .iter()
                            .map(|e| items.cast(e))
                            .collect::<Result<Vec<_>, _>>()?,
                    )),
                    None => Ok(Value::Array(elements)),
                }
            }
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Options attached to a property declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyOptions {
    pub default: Option<Value>,
    /// Allowed values (`enum`).
    pub allowed: Option<Vec<Value>>,
    /// Derive expression; derived properties are computed, never stored.
    pub derive: Option<Expression>,
}

/// Result of a single backend write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Written,
    /// The backend already held an equal value and skipped the write.
    Unchanged,
}

/// Per-datastore get/set pair installed by `create_backing_store`.
#[async_trait]
pub trait PropertyBackend: Send + Sync {
    /// Reads the stored value, `None` when the store has no value for `uuid`.
    async fn get(&self, uuid: &str) -> Result<Option<Value>, DatastoreError>;

    /// Writes an already validated value.
    async fn set(&self, uuid: &str, value: &Value) -> Result<SetOutcome, DatastoreError>;
}

#[derive(Clone)]
struct PropertyBinding {
    datastore: String,
    backend: Arc<dyn PropertyBackend>,
}

/// Which backends wrote and which suppressed a same-value write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetReport {
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
}

impl SetReport {
    /// True if at least one backend performed a write.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.written.is_empty()
    }
}

/// A typed, multi-backend field of a concept.
pub struct Property {
    name: String,
    property_type: PropertyType,
    options: PropertyOptions,
    bindings: RwLock<Vec<PropertyBinding>>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("type", &self.property_type)
            .field("options", &self.options)
            .field("datastores", &self.datastore_names())
            .finish()
    }
}

impl Property {
    #[must_use]
    pub fn new(name: impl Into<String>, property_type: PropertyType, options: PropertyOptions) -> Self {
        Self {
            name: name.into(),
            property_type,
            options,
            bindings: RwLock::new(Vec::new()),
        }
    }

    /// Builds a property from a schema entry.
    ///
    /// Accepts the shorthand `"string"` and the full form
    /// `{"number": {"default": 0, "enum": [...], "derive": "a * b"}}`.
    /// Array element types go under `items` and may nest.
    pub fn from_schema(name: &str, schema: &serde_json::Value) -> VarvResult<Self> {
        let (property_type, options) = parse_schema_entry(name, schema)?;
        Ok(Self::new(name, property_type, options))
    }

    /// A copy with the same declaration and no datastore bindings.
    #[must_use]
    pub fn fresh_copy(&self) -> Self {
        Self::new(self.name.clone(), self.property_type.clone(), self.options.clone())
    }

    /// A fresh copy under a different name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.property_type.clone(), self.options.clone())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn property_type(&self) -> &PropertyType {
        &self.property_type
    }

    #[must_use]
    pub fn options(&self) -> &PropertyOptions {
        &self.options
    }

    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.options.derive.is_some()
    }

    #[must_use]
    pub fn derive_expression(&self) -> Option<&Expression> {
        self.options.derive.as_ref()
    }

    /// Declared default, or `Null`.
    #[must_use]
    pub fn default_value(&self) -> Value {
        self.options.default.clone().unwrap_or_default()
    }

    /// Coerces a raw value into the declared type.
    pub fn type_cast(&self, value: &Value) -> Result<Value, ValidationError> {
        self.property_type.cast(value)
    }

    /// Casts and checks enum constraints.
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        let cast = self.type_cast(value)?;
        if let Some(allowed) = &self.options.allowed {
            if !cast.is_null() && !allowed.iter().any(|a| a.same_as(&cast)) {
                return Err(ValidationError::NotInEnum {
                    property: self.name.clone(),
                    value: cast.to_string(),
                });
            }
        }
        Ok(cast)
    }

    /// Structural equality used for same-value suppression.
    #[must_use]
    pub fn is_same(value: &Value, old: &Value) -> bool {
        value.same_as(old)
    }

    /// Installs (or replaces) the backend contributed by `datastore`.
    pub fn add_binding(&self, datastore: &str, backend: Arc<dyn PropertyBackend>) -> VarvResult<()> {
        let mut bindings = self.bindings.write().map_err(|_| lock_err("property bindings"))?;
        bindings.retain(|b| b.datastore != datastore);
        bindings.push(PropertyBinding {
            datastore: datastore.to_string(),
            backend,
        });
        Ok(())
    }

    /// Removes the backend contributed by `datastore`.
    pub fn remove_binding(&self, datastore: &str) -> VarvResult<bool> {
        let mut bindings = self.bindings.write().map_err(|_| lock_err("property bindings"))?;
        let before = bindings.len();
        bindings.retain(|b| b.datastore != datastore);
        Ok(bindings.len() != before)
    }

    /// Names of the datastores currently backing this property.
    #[must_use]
    pub fn datastore_names(&self) -> Vec<String> {
        self.bindings
            .read()
            .map(|b| b.iter().map(|b| b.datastore.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_backed(&self) -> bool {
        self.bindings.read().map(|b| !b.is_empty()).unwrap_or(false)
    }

    fn snapshot(&self) -> VarvResult<Vec<PropertyBinding>> {
        let bindings = self.bindings.read().map_err(|_| lock_err("property bindings"))?;
        if bindings.is_empty() {
            return Err(ValidationError::Unbacked {
                property: self.name.clone(),
            }
            .into());
        }
        Ok(bindings.clone())
    }

    /// Reads the value for `uuid` from the first backend to answer.
    ///
    /// A stored value that fails to cast is returned raw. Missing values fall
    /// back to the declared default.
    pub async fn get_value(&self, uuid: &str) -> VarvResult<Value> {
        let bindings = self.snapshot()?;
        let found = first_success(bindings.iter().map(|b| b.backend.get(uuid))).await?;
        match found {
            Some(raw) => match self.type_cast(&raw) {
                Ok(cast) => Ok(cast),
                Err(e) => {
                    debug!(property = %self.name, error = %e, "stored value kept uncast");
                    Ok(raw)
                }
            },
            None => Ok(self.default_value()),
        }
    }

    /// Validates and writes `value` to every backend.
    pub async fn set_value(&self, uuid: &str, value: &Value) -> VarvResult<SetReport> {
        if self.is_derived() {
            return Err(ValidationError::ReadOnly {
                property: self.name.clone(),
            }
            .into());
        }
        let value = self.validate(value)?;
        let bindings = self.snapshot()?;
        let outcomes = write_all(
            &self.name,
            bindings.iter().map(|b| {
                let value = &value;
                async move {
                    b.backend
                        .set(uuid, value)
                        .await
                        .map(|outcome| (b.datastore.clone(), outcome))
                }
            }),
        )
        .await?;

        let mut report = SetReport::default();
        for (datastore, outcome) in outcomes {
            match outcome {
                SetOutcome::Written => report.written.push(datastore),
                SetOutcome::Unchanged => report.unchanged.push(datastore),
            }
        }
        Ok(report)
    }
}

fn parse_schema_entry(
    name: &str,
    schema: &serde_json::Value,
) -> VarvResult<(PropertyType, PropertyOptions)> {
    let invalid = |reason: String| SpecError::Invalid {
        reason: format!("property '{name}': {reason}"),
    };
    match schema {
        serde_json::Value::String(type_name) => {
            Ok((PropertyType::from_name(type_name), PropertyOptions::default()))
        }
        serde_json::Value::Object(map) => {
            let mut entries = map.iter();
            let (type_name, raw_options) = match (entries.next(), entries.next()) {
                (Some(entry), None) => entry,
                _ => return Err(invalid("expected exactly one type key".to_string()).into()),
            };
            let mut property_type = PropertyType::from_name(type_name);
            let mut options = PropertyOptions::default();
            let Some(opts) = raw_options.as_object() else {
                if raw_options.is_null() {
                    return Ok((property_type, options));
                }
                return Err(invalid("options must be an object".to_string()).into());
            };

            if let (PropertyType::Array(slot), Some(items)) = (&mut property_type, opts.get("items")) {
                let (item_type, _) = parse_schema_entry(name, items)?;
                *slot = Some(Box::new(item_type));
            }
            if let Some(default) = opts.get("default") {
                let default = Value::from(default);
                let cast = property_type
                    .cast(&default)
                    .map_err(|e| invalid(format!("bad default: {e}")))?;
                options.default = Some(cast);
            }
            if let Some(allowed) = opts.get("enum") {
                let serde_json::Value::Array(values) = allowed else {
                    return Err(invalid("enum must be an array".to_string()).into());
                };
                options.allowed = Some(values.iter().map(Value::from).collect());
            }
            if let Some(derive) = opts.get("derive") {
                let source = match derive {
                    serde_json::Value::String(s) => s.as_str(),
                    serde_json::Value::Object(d) => d
                        .get("expression")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| invalid("derive needs an expression".to_string()))?,
                    _ => return Err(invalid("derive must be a string".to_string()).into()),
                };
                options.derive = Some(Expression::parse(source)?);
            }
            Ok((property_type, options))
        }
        _ => Err(invalid("unsupported schema entry".to_string()).into()),
    }
}
