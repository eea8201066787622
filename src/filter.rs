//! Filter predicates.
//!
//! A [`Filter`] is an immutable AST parsed once from JSON and evaluated
//! against a [`Context`]. Leaves resolve their subject (a property through
//! the engine's resolver, a variable, a literal or a calculation), check that
//! the operator is allowed for the subject's type and then compare. A
//! disallowed operator/type pair is an error, never a silent `false`.
//!
//! ```text
//! {"property": "done", "equals": false}
//! {"and": [{"variable": "n", "greaterThan": 2}, {"concept": "Todo"}]}
//! {"calculation": "price * qty", "lessOrEquals": 100}
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use futures::future::{join_all, BoxFuture, FutureExt};

use crate::context::Context;
use crate::engine::Engine;
use crate::error::{FilterError, VarvError, VarvResult};
use crate::expr::Expression;
use crate::property::PropertyType;
use crate::value::{Value, ValueKind};

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> VarvResult<regex::Regex> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| VarvError::internal("regex cache lock poisoned"))?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::Regex::new(pattern).map_err(|e| FilterError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut guard = cache
        .write()
        .map_err(|_| VarvError::internal("regex cache lock poisoned"))?;
    if guard.len() >= REGEX_CACHE_MAX {
        guard.clear();
    }
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// Comparison operator of a leaf filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Equals,
    Unequals,
    GreaterThan,
    LessThan,
    GreaterOrEquals,
    LessOrEquals,
    StartsWith,
    EndsWith,
    Includes,
    IncludesAny,
    IncludesAll,
    Matches,
}

impl FilterOp {
    pub const ALL: [FilterOp; 12] = [
        Self::Equals,
        Self::Unequals,
        Self::GreaterThan,
        Self::LessThan,
        Self::GreaterOrEquals,
        Self::LessOrEquals,
        Self::StartsWith,
        Self::EndsWith,
        Self::Includes,
        Self::IncludesAny,
        Self::IncludesAll,
        Self::Matches,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::Unequals => "unequals",
            Self::GreaterThan => "greaterThan",
            Self::LessThan => "lessThan",
            Self::GreaterOrEquals => "greaterOrEquals",
            Self::LessOrEquals => "lessOrEquals",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Includes => "includes",
            Self::IncludesAny => "includesAny",
            Self::IncludesAll => "includesAll",
            Self::Matches => "matches",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator-checking category of a filter subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
    String,
    Number,
    Boolean,
    Concept,
    Array,
    Null,
    Object,
}

impl SubjectType {
    fn of_value(value: &Value) -> Self {
        match value.kind() {
            ValueKind::Null => Self::Null,
            ValueKind::Boolean => Self::Boolean,
            ValueKind::Number => Self::Number,
            ValueKind::String => Self::String,
            ValueKind::Array => Self::Array,
            ValueKind::Object => Self::Object,
        }
    }

    fn of_property(ty: &PropertyType) -> Self {
        match ty {
            PropertyType::String => Self::String,
            PropertyType::Number => Self::Number,
            PropertyType::Boolean => Self::Boolean,
            PropertyType::Array(_) => Self::Array,
            PropertyType::Concept(_) => Self::Concept,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Concept => "concept",
            Self::Array => "array",
            Self::Null => "null",
            Self::Object => "object",
        }
    }

    /// Operators this type accepts.
    #[must_use]
    pub fn allowed_ops(self) -> &'static [FilterOp] {
        use FilterOp::*;
        match self {
            Self::String => &[
                Equals,
                Unequals,
                GreaterThan,
                LessThan,
                GreaterOrEquals,
                LessOrEquals,
                StartsWith,
                EndsWith,
                Includes,
                Matches,
            ],
            Self::Number => &[
                Equals,
                Unequals,
                GreaterThan,
                LessThan,
                GreaterOrEquals,
                LessOrEquals,
            ],
            Self::Array => &[Equals, Unequals, Includes, IncludesAny, IncludesAll],
            Self::Boolean | Self::Concept | Self::Null | Self::Object => &[Equals, Unequals],
        }
    }

    fn check(self, op: FilterOp) -> Result<(), FilterError> {
        if self.allowed_ops().contains(&op) {
            Ok(())
        } else {
            Err(FilterError::OperatorNotAllowed {
                operator: op.name().to_string(),
                value_type: self.name().to_string(),
            })
        }
    }
}

/// Predicate AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Compares a property resolved through the engine.
    Property {
        property: String,
        op: FilterOp,
        value: Value,
    },
    /// Compares a context variable.
    Variable {
        variable: String,
        op: FilterOp,
        value: Value,
    },
    /// Compares a literal (after `$` substitution).
    Value {
        value: Value,
        op: FilterOp,
        operand: Value,
    },
    /// Tests the concept type of the context target.
    Concept { concept: String, include_others: bool },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Evaluates an expression, then compares its result.
    Calculation {
        expression: Expression,
        op: FilterOp,
        value: Value,
    },
}

fn malformed(reason: impl Into<String>) -> VarvError {
    FilterError::Malformed {
        reason: reason.into(),
    }
    .into()
}

impl Filter {
    pub fn property(property: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::Property {
            property: property.into(),
            op,
            value: value.into(),
        }
    }

    pub fn variable(variable: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::Variable {
            variable: variable.into(),
            op,
            value: value.into(),
        }
    }

    pub fn concept(concept: impl Into<String>) -> Self {
        Self::Concept {
            concept: concept.into(),
            include_others: true,
        }
    }

    /// Builds a filter from its JSON form. An array is shorthand for `and`.
    pub fn from_json(json: &serde_json::Value) -> VarvResult<Self> {
        match json {
            serde_json::Value::Array(items) => Ok(Self::And(
                items.iter().map(Self::from_json).collect::<VarvResult<_>>()?,
            )),
            serde_json::Value::Object(map) => {
                let list = |key: &str| -> VarvResult<Vec<Filter>> {
                    match map.get(key) {
                        Some(serde_json::Value::Array(items)) => {
                            items.iter().map(Self::from_json).collect()
                        }
                        Some(single @ serde_json::Value::Object(_)) => Ok(vec![Self::from_json(single)?]),
                        _ => Err(malformed(format!("'{key}' needs a list of filters"))),
                    }
                };
                if map.contains_key("and") {
                    return Ok(Self::And(list("and")?));
                }
                if map.contains_key("or") {
                    return Ok(Self::Or(list("or")?));
                }
                if let Some(inner) = map.get("not") {
                    return Ok(Self::Not(Box::new(Self::from_json(inner)?)));
                }
                if let Some(concept) = map.get("concept") {
                    let concept = concept
                        .as_str()
                        .ok_or_else(|| malformed("'concept' must be a string"))?;
                    let include_others = map
                        .get("includeOthers")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(true);
                    return Ok(Self::Concept {
                        concept: concept.to_string(),
                        include_others,
                    });
                }

                let (op, operand) = map
                    .iter()
                    .find_map(|(k, v)| FilterOp::from_name(k).map(|op| (op, Value::from(v))))
                    .ok_or_else(|| malformed(format!("no operator in {json}")))?;

                let text = |key: &str| -> VarvResult<String> {
                    map.get(key)
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| malformed(format!("'{key}' must be a string")))
                };
                if map.contains_key("property") {
                    Ok(Self::Property {
                        property: text("property")?,
                        op,
                        value: operand,
                    })
                } else if map.contains_key("variable") {
                    Ok(Self::Variable {
                        variable: text("variable")?,
                        op,
                        value: operand,
                    })
                } else if map.contains_key("calculation") {
                    Ok(Self::Calculation {
                        expression: Expression::parse(&text("calculation")?)?,
                        op,
                        value: operand,
                    })
                } else if let Some(subject) = map.get("value") {
                    Ok(Self::Value {
                        value: Value::from(subject),
                        op,
                        operand,
                    })
                } else {
                    Err(malformed(format!("no filter subject in {json}")))
                }
            }
            other => Err(malformed(format!("unsupported filter {other}"))),
        }
    }

    /// Evaluates the filter against `context`.
    ///
    /// `and`/`or` evaluate all children concurrently and combine afterwards;
    /// there is no short circuit.
    pub fn evaluate<'a>(
        &'a self,
        engine: &'a Engine,
        context: &'a Context,
        local_concept: Option<&'a str>,
    ) -> BoxFuture<'a, VarvResult<bool>> {
        async move {
            match self {
                Self::And(children) | Self::Or(children) => {
                    let results = join_all(
                        children
                            .iter()
                            .map(|c| c.evaluate(engine, context, local_concept)),
                    )
                    .await;
                    let values = results.into_iter().collect::<VarvResult<Vec<bool>>>()?;
                    Ok(match self {
                        Self::And(_) => values.iter().all(|v| *v),
                        _ => values.iter().any(|v| *v),
                    })
                }
                Self::Not(inner) => Ok(!inner.evaluate(engine, context, local_concept).await?),
                Self::Concept {
                    concept,
                    include_others,
                } => {
                    let Some(target) = context.target.as_deref() else {
                        return Ok(false);
                    };
                    Ok(match engine.get_concept_from_uuid(target).await? {
                        Some(found) if found.name() == concept => true,
                        Some(found) => *include_others && found.is_a(concept),
                        None => false,
                    })
                }
                Self::Property {
                    property,
                    op,
                    value,
                } => {
                    let lookup = engine
                        .resolve_property(context.target.as_deref(), local_concept, property)
                        .await?;
                    let subject_type = SubjectType::of_property(lookup.property.property_type());
                    subject_type.check(*op)?;
                    let subject = engine.get_property_value(&lookup).await?;
                    let operand = context.resolve(value)?;
                    let operand = lookup.property.type_cast(&operand).unwrap_or(operand);
                    compare(subject_type, &subject, *op, &operand)
                }
                Self::Variable {
                    variable,
                    op,
                    value,
                } => {
                    let subject = context.variable(variable)?.clone();
                    let operand = context.resolve(value)?;
                    compare(SubjectType::of_value(&subject), &subject, *op, &operand)
                }
                Self::Value { value, op, operand } => {
                    let subject = context.resolve(value)?;
                    let operand = context.resolve(operand)?;
                    compare(SubjectType::of_value(&subject), &subject, *op, &operand)
                }
                Self::Calculation {
                    expression,
                    op,
                    value,
                } => {
                    let subject = engine
                        .evaluate_expression(expression, context, local_concept)
                        .await?;
                    let operand = context.resolve(value)?;
                    compare(SubjectType::of_value(&subject), &subject, *op, &operand)
                }
            }
        }
        .boxed()
    }
}

fn as_number(v: &Value) -> VarvResult<f64> {
    match v {
        Value::Number(n) => Ok(*n),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| malformed(format!("cannot compare number with {v}"))),
        other => Err(malformed(format!("cannot compare number with {other}"))),
    }
}

/// Applies `op` after checking it against `subject_type`.
fn compare(subject_type: SubjectType, subject: &Value, op: FilterOp, operand: &Value) -> VarvResult<bool> {
    subject_type.check(op)?;
    if subject.is_null() && !matches!(op, FilterOp::Equals | FilterOp::Unequals) {
        return Ok(false);
    }
    match op {
        FilterOp::Equals => Ok(subject.same_as(operand)),
        FilterOp::Unequals => Ok(!subject.same_as(operand)),
        FilterOp::GreaterThan | FilterOp::LessThan | FilterOp::GreaterOrEquals | FilterOp::LessOrEquals => {
            let ordering = if subject_type == SubjectType::Number {
                as_number(subject)?.partial_cmp(&as_number(operand)?)
            } else {
                // Plain code-point ordering.
                Some(subject.to_text().as_str().cmp(operand.to_text().as_str()))
            };
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            Ok(match op {
                FilterOp::GreaterThan => ordering.is_gt(),
                FilterOp::LessThan => ordering.is_lt(),
                FilterOp::GreaterOrEquals => ordering.is_ge(),
                _ => ordering.is_le(),
            })
        }
        FilterOp::StartsWith => Ok(subject.to_text().starts_with(&operand.to_text())),
        FilterOp::EndsWith => Ok(subject.to_text().ends_with(&operand.to_text())),
        FilterOp::Includes => match subject {
            Value::Array(items) => Ok(items.iter().any(|i| i.same_as(operand))),
            _ => Ok(subject.to_text().contains(&operand.to_text())),
        },
        FilterOp::IncludesAny | FilterOp::IncludesAll => {
            let items = subject.as_array().unwrap_or_default();
            let wanted = match operand {
                Value::Array(w) => w.clone(),
                single => vec![single.clone()],
            };
            let has = |w: &Value| items.iter().any(|i| i.same_as(w));
            Ok(if op == FilterOp::IncludesAny {
                wanted.iter().any(has)
            } else {
                wanted.iter().all(has)
            })
        }
        FilterOp::Matches => {
            let re = cached_regex(&operand.to_text())?;
            Ok(re.is_match(&subject.to_text()))
        }
    }
}
