//! Concept composition: `inject`, `join`, `pick` and `omit`.
//!
//! Extensions edit drafts in place. A concept's extensions run after those
//! of every concept it draws from, so an inject always sees its source in
//! final form. Injected and joined sources become part of the is-a set,
//! transitively; picked entries are plain copies.

use serde_json::Value as Json;
use tracing::{debug, warn};

use super::ConceptDraft;
use crate::error::{SpecError, VarvError, VarvResult};

/// One composition step declared under a concept's `extensions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// Copy schema and actions from each source; the concept is-a each.
    Inject(Vec<String>),
    /// Union of the sources plus the concept's own declarations.
    Join(Vec<String>),
    /// Copy only the named entries of one source, without an is-a link.
    Pick {
        concept: String,
        schema: Vec<String>,
        actions: Vec<String>,
    },
    /// Remove entries from this concept.
    Omit { schema: Vec<String>, actions: Vec<String> },
}

fn failed(extension: &str, reason: impl Into<String>) -> VarvError {
    SpecError::Extension {
        extension: extension.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn names(extension: &str, json: Option<&Json>) -> VarvResult<Vec<String>> {
    match json {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::String(name)) => Ok(vec![name.clone()]),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| failed(extension, format!("expected a name, got {item}")))
            })
            .collect(),
        Some(other) => Err(failed(extension, format!("expected a name or a list of names, got {other}"))),
    }
}

impl Extension {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Inject(_) => "inject",
            Self::Join(_) => "join",
            Self::Pick { .. } => "pick",
            Self::Omit { .. } => "omit",
        }
    }

    /// Concepts this extension reads from.
    #[must_use]
    pub fn sources(&self) -> Vec<&str> {
        match self {
            Self::Inject(sources) | Self::Join(sources) => sources.iter().map(String::as_str).collect(),
            Self::Pick { concept, .. } => vec![concept.as_str()],
            Self::Omit { .. } => Vec::new(),
        }
    }

    /// `{"inject": "A", "omit": {...}}` or `[{"inject": "A"}, {"omit": {...}}]`.
    pub fn parse_all(concept: &str, raw: &Json) -> VarvResult<Vec<Self>> {
        let mut out = Vec::new();
        match raw {
            Json::Null => {}
            Json::Object(map) => {
                for (op, args) in map {
                    out.push(Self::parse(concept, op, args)?);
                }
            }
            Json::Array(items) => {
                for item in items {
                    let Json::Object(map) = item else {
                        return Err(failed("extensions", format!("{concept}: expected an object, got {item}")));
                    };
                    for (op, args) in map {
                        out.push(Self::parse(concept, op, args)?);
                    }
                }
            }
            other => {
                return Err(failed(
                    "extensions",
                    format!("{concept}: expected an object or a list, got {other}"),
                ))
            }
        }
        Ok(out)
    }

    fn parse(concept: &str, op: &str, args: &Json) -> VarvResult<Self> {
        match op {
            "inject" | "join" => {
                let sources = match args {
                    Json::Object(map) => names(op, map.get("concepts"))?,
                    other => names(op, Some(other))?,
                };
                if sources.is_empty() {
                    return Err(failed(op, format!("{concept}: no source concepts")));
                }
                Ok(if op == "inject" {
                    Self::Inject(sources)
                } else {
                    Self::Join(sources)
                })
            }
            "pick" => {
                let Json::Object(map) = args else {
                    return Err(failed(op, format!("{concept}: expected an object, got {args}")));
                };
                let source = map
                    .get("concept")
                    .and_then(Json::as_str)
                    .ok_or_else(|| failed(op, format!("{concept}: 'concept' is required")))?;
                Ok(Self::Pick {
                    concept: source.to_string(),
                    schema: names(op, map.get("schema"))?,
                    actions: names(op, map.get("actions"))?,
                })
            }
            "omit" => match args {
                Json::Object(map) => Ok(Self::Omit {
                    schema: names(op, map.get("schema"))?,
                    actions: names(op, map.get("actions"))?,
                }),
                other => Ok(Self::Omit {
                    schema: names(op, Some(other))?,
                    actions: Vec::new(),
                }),
            },
            other => Err(failed(other, format!("{concept}: unknown extension"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    Active,
    Done,
}

/// Applies every draft's extensions, sources first.
pub(super) fn apply(drafts: &mut [ConceptDraft]) -> VarvResult<()> {
    let mut state = vec![Visit::Pending; drafts.len()];
    for index in 0..drafts.len() {
        visit(drafts, &mut state, index)?;
    }
    Ok(())
}

fn position(drafts: &[ConceptDraft], extension: &Extension, owner: &str, name: &str) -> VarvResult<usize> {
    if name == owner {
        return Err(failed(extension.name(), format!("{owner}: a concept cannot extend itself")));
    }
    drafts
        .iter()
        .position(|d| d.name == name)
        .ok_or_else(|| failed(extension.name(), format!("{owner}: unknown concept '{name}'")))
}

fn visit(drafts: &mut [ConceptDraft], state: &mut [Visit], index: usize) -> VarvResult<()> {
    match state[index] {
        Visit::Done => return Ok(()),
        Visit::Active => {
            return Err(failed(
                "extensions",
                format!("cyclic composition through '{}'", drafts[index].name),
            ))
        }
        Visit::Pending => state[index] = Visit::Active,
    }

    let owner = drafts[index].name.clone();
    let extensions = std::mem::take(&mut drafts[index].extensions);
    for extension in &extensions {
        for source in extension.sources() {
            let source = position(drafts, extension, &owner, source)?;
            visit(drafts, state, source)?;
        }
    }
    for extension in &extensions {
        apply_one(drafts, index, extension)?;
        debug!(concept = %owner, extension = extension.name(), "extension applied");
    }
    drafts[index].extensions = extensions;
    state[index] = Visit::Done;
    Ok(())
}

fn apply_one(drafts: &mut [ConceptDraft], index: usize, extension: &Extension) -> VarvResult<()> {
    let owner = drafts[index].name.clone();
    match extension {
        Extension::Inject(sources) | Extension::Join(sources) => {
            for name in sources {
                let source = drafts[position(drafts, extension, &owner, name)?].clone();
                include(&mut drafts[index], &source);
            }
        }
        Extension::Pick {
            concept,
            schema,
            actions,
        } => {
            let source = drafts[position(drafts, extension, &owner, concept)?].clone();
            let target = &mut drafts[index];
            for name in schema {
                let entry = source
                    .schema
                    .get(name)
                    .ok_or_else(|| failed("pick", format!("{owner}: '{concept}' has no property '{name}'")))?;
                if target.schema.contains_key(name) {
                    warn!(concept = %owner, property = %name, "picked property already declared, keeping own");
                    continue;
                }
                target.schema.insert(name.clone(), entry.clone());
                if let Some(stores) = source.mappings.get(name) {
                    target.mappings.entry(name.clone()).or_insert_with(|| stores.clone());
                }
            }
            for name in actions {
                let entry = source
                    .actions
                    .get(name)
                    .ok_or_else(|| failed("pick", format!("{owner}: '{concept}' has no action '{name}'")))?;
                if !target.actions.contains_key(name) {
                    target.actions.insert(name.clone(), entry.clone());
                }
            }
        }
        Extension::Omit { schema, actions } => {
            let target = &mut drafts[index];
            for name in schema.iter().filter(|n| !target.schema.contains_key(*n)) {
                warn!(concept = %owner, property = %name, "omit: no such property");
            }
            for name in actions.iter().filter(|n| !target.actions.contains_key(*n)) {
                warn!(concept = %owner, action = %name, "omit: no such action");
            }
            target.schema.retain(|name, _| !schema.contains(name));
            target.actions.retain(|name, _| !actions.contains(name));
            target.mappings.retain(|name, _| !schema.contains(name));
        }
    }
    Ok(())
}

/// Merges `source` into `target`; the target's own entries win.
fn include(target: &mut ConceptDraft, source: &ConceptDraft) {
    for (name, entry) in &source.schema {
        if target.schema.contains_key(name) {
            continue;
        }
        target.schema.insert(name.clone(), entry.clone());
        if let Some(stores) = source.mappings.get(name) {
            target.mappings.entry(name.clone()).or_insert_with(|| stores.clone());
        }
    }
    for (name, entry) in &source.actions {
        if !target.actions.contains_key(name) {
            target.actions.insert(name.clone(), entry.clone());
        }
    }
    target.others.insert(source.name.clone());
    target
        .others
        .extend(source.others.iter().filter(|n| **n != target.name).cloned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drafts(spec: Json) -> Vec<ConceptDraft> {
        let Json::Object(map) = spec else { panic!("object expected") };
        map.iter()
            .map(|(name, json)| ConceptDraft::parse(name, json).unwrap())
            .collect()
    }

    fn find<'a>(drafts: &'a [ConceptDraft], name: &str) -> &'a ConceptDraft {
        drafts.iter().find(|d| d.name == name).unwrap()
    }

    #[test]
    fn test_inject_copies_and_links_transitively() {
        let mut all = drafts(json!({
            "Cat": {"extensions": {"inject": "Animal"}, "schema": {"lives": "number"}},
            "Animal": {"extensions": {"inject": "Named"}, "schema": {"legs": "number"}, "actions": {"walk": []}},
            "Named": {"schema": {"name": "string"}}
        }));
        apply(&mut all).unwrap();
        let cat = find(&all, "Cat");
        assert_eq!(cat.property_names(), vec!["lives", "legs", "name"]);
        assert_eq!(cat.behaviour_names(), vec!["walk"]);
        assert!(cat.others().contains("Animal"));
        assert!(cat.others().contains("Named"));
    }

    #[test]
    fn test_own_declarations_override_injected() {
        let mut all = drafts(json!({
            "Base": {"schema": {"x": "string"}, "actions": {"go": ["a"]}},
            "Child": {"schema": {"x": "number"}, "actions": {"go": ["b"]}, "extensions": {"inject": ["Base"]}}
        }));
        apply(&mut all).unwrap();
        let child = find(&all, "Child");
        assert_eq!(child.schema["x"], json!("number"));
        assert_eq!(child.actions["go"], json!(["b"]));
    }

    #[test]
    fn test_join_unions_sources() {
        let mut all = drafts(json!({
            "A": {"schema": {"a": "string"}},
            "B": {"schema": {"b": "string"}},
            "AB": {"extensions": {"join": ["A", "B"]}}
        }));
        apply(&mut all).unwrap();
        let ab = find(&all, "AB");
        assert_eq!(ab.property_names(), vec!["a", "b"]);
        assert_eq!(ab.others().iter().cloned().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_pick_copies_without_is_a() {
        let mut all = drafts(json!({
            "Source": {"schema": {"a": "string", "b": "number"}, "actions": {"go": [], "stop": []}},
            "Target": {"extensions": {"pick": {"concept": "Source", "schema": ["b"], "actions": "go"}}}
        }));
        apply(&mut all).unwrap();
        let target = find(&all, "Target");
        assert_eq!(target.property_names(), vec!["b"]);
        assert_eq!(target.behaviour_names(), vec!["go"]);
        assert!(target.others().is_empty());

        let mut bad = drafts(json!({
            "Source": {},
            "Target": {"extensions": {"pick": {"concept": "Source", "schema": ["missing"]}}}
        }));
        assert!(apply(&mut bad).unwrap_err().is_spec());
    }

    #[test]
    fn test_later_extensions_see_earlier_ones() {
        let mut all = drafts(json!({
            "Base": {"schema": {"a": "string", "b": "string"}},
            "Slim": {"extensions": [{"inject": "Base"}, {"omit": {"schema": ["b"]}}]}
        }));
        apply(&mut all).unwrap();
        let slim = find(&all, "Slim");
        assert_eq!(slim.property_names(), vec!["a"]);
        assert!(slim.others().contains("Base"));
        // the source itself is untouched
        assert_eq!(find(&all, "Base").property_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_source_and_cycles_fail() {
        let mut unknown = drafts(json!({"A": {"extensions": {"inject": "Nope"}}}));
        assert!(apply(&mut unknown).is_err());

        let mut cycle = drafts(json!({
            "A": {"extensions": {"inject": "B"}},
            "B": {"extensions": {"inject": "A"}}
        }));
        assert!(apply(&mut cycle).is_err());

        let mut own = drafts(json!({"A": {"extensions": {"inject": "A"}}}));
        assert!(apply(&mut own).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_operation() {
        assert!(Extension::parse_all("A", &json!({"mixin": "B"})).is_err());
        assert_eq!(
            Extension::parse_all("A", &json!([{"inject": ["B", "C"]}])).unwrap(),
            vec![Extension::Inject(vec!["B".into(), "C".into()])]
        );
    }
}
