//! `sort`: orders contexts by a property or variable.
//!
//! Strings compare case-insensitively first and fall back to the exact
//! text, so `"apple" < "Banana" < "banana"`. This differs from the filter
//! operators, which compare code points.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::action::{boxed, constructor, Accept, Action, ActionRegistry, ChainScope, Options, Slot};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{VarvError, VarvResult};
use crate::value::Value;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("sort", constructor(|json, _| boxed(Sort::parse(json)?)));
}

#[derive(Debug, Clone)]
struct Sort {
    slot: Slot,
    descending: bool,
}

impl Sort {
    fn parse(json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse("sort", json, Some("property"))?;
        let descending = match options.str("order")?.as_deref() {
            None | Some("asc" | "ascending") => false,
            Some("desc" | "descending") => true,
            Some(other) => return Err(options.error(format!("unknown order '{other}'"))),
        };
        Ok(Self {
            slot: options.slot(&["by"])?,
            descending,
        })
    }
}

fn text_order(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

fn compare(slot: &Slot, a: &Value, b: &Value) -> VarvResult<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Ok(Ordering::Equal),
        (Value::Null, _) => Ok(Ordering::Less),
        (_, Value::Null) => Ok(Ordering::Greater),
        (Value::Number(x), Value::Number(y)) => Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal)),
        (Value::String(x), Value::String(y)) => Ok(text_order(x, y)),
        (Value::Boolean(x), Value::Boolean(y)) => Ok(x.cmp(y)),
        _ => Err(VarvError::invalid_action(
            "sort",
            format!(
                "cannot compare {} with {} while sorting by '{}'",
                a.kind().name(),
                b.kind().name(),
                slot.name()
            ),
        )),
    }
}

#[async_trait]
impl Action for Sort {
    fn name(&self) -> &str {
        "sort"
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        let mut keyed = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let key = self.slot.load(engine, &ctx, scope, Accept::Any).await?.value;
            keyed.push((key, ctx));
        }
        // Validate every pair against the first key so mixed types fail
        // regardless of the input order.
        if let Some((first, _)) = keyed.first() {
            for (key, _) in &keyed[1..] {
                compare(&self.slot, first, key)?;
            }
        }
        let mut failure = None;
        keyed.sort_by(|(a, _), (b, _)| match compare(&self.slot, a, b) {
            Ok(order) if self.descending => order.reverse(),
            Ok(order) => order,
            Err(e) => {
                failure.get_or_insert(e);
                Ordering::Equal
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(keyed.into_iter().map(|(_, ctx)| ctx).collect())
    }
}
