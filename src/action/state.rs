//! State mutation: `set`, `increment`, `decrement`, `toggle`, `calculate`.

use async_trait::async_trait;

use crate::action::{boxed, constructor, for_each_context, Accept, Action, ActionRegistry, ChainScope, Options, Slot};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{ResolutionError, VarvError, VarvResult};
use crate::expr::Expression;
use crate::value::Value;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("set", constructor(|json, _| boxed(Set::parse(json)?)));
    registry.register("increment", constructor(|json, _| boxed(Step::parse("increment", 1.0, json)?)));
    registry.register("decrement", constructor(|json, _| boxed(Step::parse("decrement", -1.0, json)?)));
    registry.register("toggle", constructor(|json, _| boxed(Toggle::parse(json)?)));
    registry.register("calculate", constructor(|json, _| boxed(Calculate::parse(json)?)));
}

/// Assignments of one `set` step: `$name` keys bind variables, the rest
/// write properties of the target.
#[derive(Debug, Clone)]
struct Set {
    assignments: Vec<(Slot, Value)>,
}

impl Set {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("set", json, None)?;
        let assignments = options
            .entries()
            .map(|(key, raw)| {
                let slot = match key.strip_prefix('$') {
                    Some(var) => Slot::Variable(var.to_string()),
                    None => Slot::Property(key.clone()),
                };
                (slot, Value::from(raw))
            })
            .collect();
        Ok(Self { assignments })
    }
}

#[async_trait]
impl Action for Set {
    fn name(&self) -> &str {
        "set"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |mut ctx| async move {
            for (slot, raw) in &self.assignments {
                let value = ctx.resolve(raw)?;
                match slot {
                    Slot::Variable(name) => ctx.set_variable(name.clone(), value),
                    Slot::Property(name) => {
                        let lookup = engine
                            .resolve_property(ctx.target.as_deref(), scope.local(), name)
                            .await?;
                        engine.set_property_value(&lookup, &value).await?;
                    }
                }
            }
            Ok::<_, VarvError>(ctx)
        })
        .await
    }
}

fn number_of(slot: &Slot, value: &Value) -> VarvResult<f64> {
    match value {
        Value::Null => Ok(0.0),
        Value::Number(n) => Ok(*n),
        other => Err(ResolutionError::WrongPropertyType {
            property: slot.name().to_string(),
            expected: "number".to_string(),
            actual: other.kind().name().to_string(),
        }
        .into()),
    }
}

/// `increment` / `decrement` by a fixed or variable amount.
#[derive(Debug, Clone)]
struct Step {
    name: &'static str,
    slot: Slot,
    by: Value,
    sign: f64,
}

impl Step {
    fn parse(name: &'static str, sign: f64, json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse(name, json, Some("property"))?;
        Ok(Self {
            name,
            slot: options.slot(&["of"])?,
            by: options.value("by").unwrap_or(Value::Number(1.0)),
            sign,
        })
    }
}

#[async_trait]
impl Action for Step {
    fn name(&self) -> &str {
        self.name
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |mut ctx| async move {
            let loaded = self.slot.load(engine, &ctx, scope, Accept::Any).await?;
            let current = number_of(&self.slot, &loaded.value)?;
            let by = ctx.resolve(&self.by)?;
            let by = by
                .as_f64()
                .ok_or_else(|| VarvError::invalid_action(self.name, format!("'by' must be a number, got {by}")))?;
            loaded
                .store(engine, &mut ctx, Value::Number(current + self.sign * by))
                .await?;
            Ok::<_, VarvError>(ctx)
        })
        .await
    }
}

#[derive(Debug, Clone)]
struct Toggle {
    slot: Slot,
}

impl Toggle {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("toggle", json, Some("property"))?;
        Ok(Self {
            slot: options.slot(&["of"])?,
        })
    }
}

#[async_trait]
impl Action for Toggle {
    fn name(&self) -> &str {
        "toggle"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |mut ctx| async move {
            let loaded = self.slot.load(engine, &ctx, scope, Accept::Any).await?;
            let current = match &loaded.value {
                Value::Null => false,
                Value::Boolean(b) => *b,
                other => {
                    return Err(VarvError::from(ResolutionError::WrongPropertyType {
                        property: self.slot.name().to_string(),
                        expected: "boolean".to_string(),
                        actual: other.kind().name().to_string(),
                    }))
                }
            };
            loaded.store(engine, &mut ctx, Value::Boolean(!current)).await?;
            Ok::<_, VarvError>(ctx)
        })
        .await
    }
}

/// Evaluates an expression into a variable (`as`, default `result`).
#[derive(Debug, Clone)]
struct Calculate {
    expression: Expression,
    variable: String,
}

impl Calculate {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("calculate", json, Some("expression"))?;
        let source = options
            .str("expression")?
            .ok_or_else(|| options.error("missing 'expression'"))?;
        Ok(Self {
            expression: Expression::parse(&source)?,
            variable: options.result_variable("result")?,
        })
    }
}

#[async_trait]
impl Action for Calculate {
    fn name(&self) -> &str {
        "calculate"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |ctx| async move {
            let value = engine.evaluate_expression(&self.expression, &ctx, scope.local()).await?;
            Ok::<_, VarvError>(ctx.with_variable(self.variable.clone(), value))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_splits_variables_and_properties() {
        let s = Set::parse(&json!({"$seen": true, "title": "$name"})).unwrap();
        assert_eq!(s.assignments.len(), 2);
        assert!(s
            .assignments
            .iter()
            .any(|(slot, _)| *slot == Slot::Variable("seen".into())));
        assert!(s
            .assignments
            .iter()
            .any(|(slot, v)| *slot == Slot::Property("title".into()) && *v == Value::from("$name")));
        assert!(Set::parse(&json!("title")).is_err());
    }

    #[test]
    fn test_step_defaults() {
        let s = Step::parse("increment", 1.0, &json!("count")).unwrap();
        assert_eq!(s.slot, Slot::Property("count".into()));
        assert_eq!(s.by, Value::Number(1.0));
        let s = Step::parse("decrement", -1.0, &json!({"variable": "n", "by": 5})).unwrap();
        assert_eq!(s.slot, Slot::Variable("n".into()));
        assert_eq!(s.by, Value::from(5));
    }

    #[test]
    fn test_number_of_rejects_text() {
        let slot = Slot::Variable("n".into());
        assert_eq!(number_of(&slot, &Value::Null).unwrap(), 0.0);
        assert!(number_of(&slot, &Value::from("3")).unwrap_err().is_resolution());
    }

    #[test]
    fn test_calculate_parses_expression() {
        let c = Calculate::parse(&json!({"expression": "price * 2", "as": "$total"})).unwrap();
        assert_eq!(c.variable, "total");
        assert!(Calculate::parse(&json!("1 +")).is_err());
    }
}
