//! Array and string utilities.
//!
//! Every action works on a slot: a property of the target (type-checked,
//! written back through the engine) or a chain variable (updated in the
//! context). The slot sits under `of`, `to`, `from` or `in`, or inline:
//!
//! ```text
//! {"append": {"to": {"property": "tags"}, "item": "c"}}
//! {"removeFirst": {"variable": "queue", "as": "next"}}
//! ```
//!
//! Results that are not written back go into a variable named by `as`
//! (default: the action name, `item` for the remove actions).

use async_trait::async_trait;

use crate::action::{boxed, constructor, for_each_context, Accept, Action, ActionRegistry, ChainScope, Options, Slot};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{VarvError, VarvResult};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Length,
    Append,
    Prepend,
    Insert,
    RemoveFirst,
    RemoveLast,
    RemoveItem,
    Items,
    Join,
    Slice,
    Index,
}

impl Op {
    const ALL: [Op; 11] = [
        Self::Length,
        Self::Append,
        Self::Prepend,
        Self::Insert,
        Self::RemoveFirst,
        Self::RemoveLast,
        Self::RemoveItem,
        Self::Items,
        Self::Join,
        Self::Slice,
        Self::Index,
    ];

    const fn name(self) -> &'static str {
        match self {
            Self::Length => "length",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Insert => "insert",
            Self::RemoveFirst => "removeFirst",
            Self::RemoveLast => "removeLast",
            Self::RemoveItem => "removeItem",
            Self::Items => "items",
            Self::Join => "join",
            Self::Slice => "slice",
            Self::Index => "index",
        }
    }

    const fn accepts(self) -> Accept {
        match self {
            Self::Length | Self::Append | Self::Prepend | Self::Insert | Self::Slice | Self::Index => {
                Accept::ArrayOrString
            }
            _ => Accept::Array,
        }
    }

    const fn default_variable(self) -> &'static str {
        match self {
            Self::RemoveFirst | Self::RemoveLast | Self::Items => "item",
            other => other.name(),
        }
    }

    const fn needs_item(self) -> bool {
        matches!(
            self,
            Self::Append | Self::Prepend | Self::Insert | Self::RemoveItem | Self::Index
        )
    }
}

pub(super) fn register(registry: &mut ActionRegistry) {
    for op in Op::ALL {
        registry.register(op.name(), constructor(move |json, _| boxed(ArrayAction::parse(op, json)?)));
    }
}

#[derive(Debug, Clone)]
struct ArrayAction {
    op: Op,
    slot: Slot,
    item: Value,
    /// `index` for insert, `start` for slice.
    start: Option<Value>,
    end: Option<Value>,
    separator: String,
    all: bool,
    variable: String,
}

impl ArrayAction {
    fn parse(op: Op, json: &serde_json::Value) -> VarvResult<Self> {
        let options = Options::parse(op.name(), json, Some("variable"))?;
        if op.needs_item() && !options.contains("item") {
            return Err(options.error("missing 'item'"));
        }
        if op == Op::Insert && !options.contains("index") {
            return Err(options.error("missing 'index'"));
        }
        Ok(Self {
            op,
            slot: options.slot(&["of", "to", "from", "in"])?,
            item: options.value("item").unwrap_or_default(),
            start: options.value(if op == Op::Insert { "index" } else { "start" }),
            end: options.value("end"),
            separator: options.str("separator")?.unwrap_or_else(|| ",".to_string()),
            all: options.bool("all", false)?,
            variable: options.result_variable(op.default_variable())?,
        })
    }

    fn number(&self, ctx: &Context, raw: &Value, what: &str) -> VarvResult<i64> {
        let value = ctx.resolve(raw)?;
        match value.as_f64() {
            Some(n) if n.fract() == 0.0 => Ok(n as i64),
            _ => Err(VarvError::invalid_action(
                self.op.name(),
                format!("'{what}' must be an integer, got {value}"),
            )),
        }
    }

    async fn run_one(&self, engine: &Engine, mut ctx: Context, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        let loaded = self.slot.load(engine, &ctx, scope, self.op.accepts()).await?;
        let item = ctx.resolve(&self.item)?;
        let mut seq = Seq::of(&loaded.value);

        match self.op {
            Op::Length => {
                let len = seq.len();
                ctx.set_variable(self.variable.clone(), len);
            }
            Op::Append | Op::Prepend | Op::Insert => {
                let at = match self.op {
                    Op::Append => seq.len(),
                    Op::Prepend => 0,
                    _ => match &self.start {
                        Some(raw) => relative_index(self.number(&ctx, raw, "index")?, seq.len()),
                        None => seq.len(),
                    },
                };
                seq.insert(at, item);
                loaded.store(engine, &mut ctx, seq.into_value()).await?;
            }
            Op::RemoveFirst | Op::RemoveLast => {
                let removed = if self.op == Op::RemoveFirst {
                    seq.remove(0)
                } else {
                    seq.len().checked_sub(1).and_then(|last| seq.remove(last))
                };
                if let Some(removed) = removed {
                    loaded.store(engine, &mut ctx, seq.into_value()).await?;
                    ctx.set_variable(self.variable.clone(), removed);
                } else {
                    ctx.set_variable(self.variable.clone(), Value::Null);
                }
            }
            Op::RemoveItem => {
                let before = seq.len();
                seq.remove_matching(&item, self.all);
                if seq.len() != before {
                    loaded.store(engine, &mut ctx, seq.into_value()).await?;
                }
            }
            Op::Items => {
                let Seq::Items(items) = seq else {
                    return Ok(Vec::new());
                };
                return Ok(items
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| {
                        ctx.clone()
                            .with_variable(self.variable.clone(), value)
                            .with_variable("index", i)
                    })
                    .collect());
            }
            Op::Join => {
                let Seq::Items(items) = seq else {
                    return Ok(vec![ctx]);
                };
                let joined = items.iter().map(Value::to_text).collect::<Vec<_>>().join(&self.separator);
                ctx.set_variable(self.variable.clone(), joined);
            }
            Op::Slice => {
                let len = seq.len();
                let start = match &self.start {
                    Some(raw) => relative_index(self.number(&ctx, raw, "start")?, len),
                    None => 0,
                };
                let end = match &self.end {
                    Some(raw) => relative_index(self.number(&ctx, raw, "end")?, len),
                    None => len,
                };
                ctx.set_variable(self.variable.clone(), seq.slice(start, end));
            }
            Op::Index => {
                let found = seq.position(&item).map_or(-1, |i| i as i64);
                ctx.set_variable(self.variable.clone(), found);
            }
        }
        Ok(vec![ctx])
    }
}

/// Position clamped to `0..=len`; negative counts from the end.
fn relative_index(index: i64, len: usize) -> usize {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { len_i + index } else { index };
    usize::try_from(resolved.clamp(0, len_i)).unwrap_or(0)
}

/// Working copy of a slot value as a sequence.
#[derive(Debug)]
enum Seq {
    Items(Vec<Value>),
    Chars(Vec<char>),
}

impl Seq {
    fn of(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::Items(items.clone()),
            Value::Null => Self::Items(Vec::new()),
            other => Self::Chars(other.to_text().chars().collect()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Items(v) => v.len(),
            Self::Chars(c) => c.len(),
        }
    }

    fn insert(&mut self, at: usize, item: Value) {
        match self {
            Self::Items(v) => v.insert(at, item),
            Self::Chars(c) => {
                let tail = c.split_off(at);
                c.extend(item.to_text().chars());
                c.extend(tail);
            }
        }
    }

    fn remove(&mut self, at: usize) -> Option<Value> {
        match self {
            Self::Items(v) if at < v.len() => Some(v.remove(at)),
            Self::Chars(c) if at < c.len() => Some(Value::String(c.remove(at).to_string())),
            _ => None,
        }
    }

    fn remove_matching(&mut self, item: &Value, all: bool) {
        if let Self::Items(v) = self {
            if all {
                v.retain(|x| !x.same_as(item));
            } else if let Some(i) = v.iter().position(|x| x.same_as(item)) {
                v.remove(i);
            }
        }
    }

    fn position(&self, item: &Value) -> Option<usize> {
        match self {
            Self::Items(v) => v.iter().position(|x| x.same_as(item)),
            Self::Chars(c) => {
                let needle: Vec<char> = item.to_text().chars().collect();
                if needle.is_empty() {
                    return Some(0);
                }
                c.windows(needle.len()).position(|w| w == needle.as_slice())
            }
        }
    }

    fn slice(&self, start: usize, end: usize) -> Value {
        let end = end.max(start);
        match self {
            Self::Items(v) => Value::Array(v[start..end].to_vec()),
            Self::Chars(c) => Value::String(c[start..end].iter().collect()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Items(v) => Value::Array(v),
            Self::Chars(c) => Value::String(c.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Action for ArrayAction {
    fn name(&self) -> &str {
        self.op.name()
    }

    async fn apply(&self, engine: &Engine, contexts: Vec<Context>, scope: &ChainScope) -> VarvResult<Vec<Context>> {
        for_each_context(contexts, |ctx| self.run_one(engine, ctx, scope)).await
    }
}
