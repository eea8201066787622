//! Specification loading: JSON to finalized concepts.
//!
//! Loading runs in three passes over the `concepts` section:
//! 1. parse every entry into a [`ConceptDraft`]
//! 2. apply composition extensions, sources before the concepts using them
//! 3. finalize each draft into a [`Concept`] with properties, behaviours
//!    and datastore mappings
//!
//! Nothing here touches a datastore; the engine registers and backs the
//! result.

mod extensions;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::{debug, warn};

use crate::action::ActionRegistry;
use crate::behaviour::Behaviour;
use crate::concept::Concept;
use crate::config::DatastoreDecl;
use crate::error::{SpecError, VarvError, VarvResult};
use crate::property::Property;
use crate::trigger::TriggerRegistry;

pub use extensions::Extension;

const CONCEPT_KEYS: [&str; 7] = [
    "schema",
    "structure",
    "actions",
    "behaviours",
    "mappings",
    "defaultMappings",
    "extensions",
];

const ROOT_KEYS: [&str; 3] = ["concepts", "dataStores", "defaultMappings"];

fn invalid(reason: impl Into<String>) -> VarvError {
    SpecError::Invalid {
        reason: reason.into(),
    }
    .into()
}

/// Result of loading one specification document.
#[derive(Debug, Default)]
pub struct LoadedSpec {
    /// Datastores declared under `dataStores`, in declaration order.
    pub datastores: Vec<DatastoreDecl>,
    /// Finalized concepts in declaration order.
    pub concepts: Vec<Arc<Concept>>,
}

/// A concept while extensions are still being applied.
#[derive(Debug, Clone, Default)]
pub struct ConceptDraft {
    name: String,
    schema: Map<String, Json>,
    actions: Map<String, Json>,
    mappings: BTreeMap<String, Vec<String>>,
    default_mappings: Option<Vec<String>>,
    extensions: Vec<Extension>,
    others: BTreeSet<String>,
}

impl ConceptDraft {
    /// Parses one `concepts.<name>` entry.
    pub fn parse(name: &str, json: &Json) -> VarvResult<Self> {
        let mut draft = Self {
            name: name.to_string(),
            ..Self::default()
        };
        let map = match json {
            Json::Null => return Ok(draft),
            Json::Object(map) => map,
            other => return Err(invalid(format!("concept '{name}' must be an object, got {other}"))),
        };
        for key in map.keys().filter(|k| !CONCEPT_KEYS.contains(&k.as_str())) {
            warn!(concept = %name, %key, "ignoring unknown concept key");
        }

        draft.schema = section(name, map, &["schema", "structure"])?;
        draft.actions = section(name, map, &["actions", "behaviours"])?;
        if let Some(mappings) = map.get("mappings") {
            let Json::Object(mappings) = mappings else {
                return Err(invalid(format!("concept '{name}': mappings must be an object")));
            };
            for (property, stores) in mappings {
                draft
                    .mappings
                    .insert(property.clone(), store_names(name, property, stores)?);
            }
        }
        if let Some(stores) = map.get("defaultMappings") {
            draft.default_mappings = Some(store_names(name, "defaultMappings", stores)?);
        }
        if let Some(raw) = map.get("extensions") {
            draft.extensions = Extension::parse_all(name, raw)?;
        }
        Ok(draft)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Property names in declaration order.
    #[must_use]
    pub fn property_names(&self) -> Vec<&str> {
        self.schema.keys().map(String::as_str).collect()
    }

    /// Behaviour names in declaration order.
    #[must_use]
    pub fn behaviour_names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Concepts this draft includes.
    #[must_use]
    pub fn others(&self) -> &BTreeSet<String> {
        &self.others
    }
}

fn section(concept: &str, map: &Map<String, Json>, keys: &[&str]) -> VarvResult<Map<String, Json>> {
    match keys.iter().find_map(|k| map.get(*k)) {
        None | Some(Json::Null) => Ok(Map::new()),
        Some(Json::Object(section)) => Ok(section.clone()),
        Some(other) => Err(invalid(format!(
            "concept '{concept}': '{}' must be an object, got {other}",
            keys[0]
        ))),
    }
}

fn store_names(concept: &str, key: &str, json: &Json) -> VarvResult<Vec<String>> {
    match json {
        Json::String(store) => Ok(vec![store.clone()]),
        Json::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    invalid(format!("concept '{concept}': mapping '{key}' lists a non-string {item}"))
                })
            })
            .collect(),
        other => Err(invalid(format!(
            "concept '{concept}': mapping '{key}' must be a name or a list, got {other}"
        ))),
    }
}

fn entries(value: Option<&Json>) -> Vec<Json> {
    match value {
        None | Some(Json::Null) => Vec::new(),
        Some(Json::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
    }
}

/// Turns specification JSON into concepts.
#[derive(Debug, Clone, Copy)]
pub struct ConceptLoader<'a> {
    actions: &'a ActionRegistry,
    triggers: &'a TriggerRegistry,
    default_mappings: &'a [String],
}

impl<'a> ConceptLoader<'a> {
    /// `default_mappings` back every property of a concept that declares
    /// neither a mapping nor `defaultMappings`.
    #[must_use]
    pub fn new(actions: &'a ActionRegistry, triggers: &'a TriggerRegistry, default_mappings: &'a [String]) -> Self {
        Self {
            actions,
            triggers,
            default_mappings,
        }
    }

    /// Loads a whole specification document.
    pub fn load(&self, spec: &Json) -> VarvResult<LoadedSpec> {
        let root = match spec {
            Json::Object(root) => root,
            Json::Null => return Ok(LoadedSpec::default()),
            other => return Err(invalid(format!("specification must be an object, got {other}"))),
        };
        for key in root.keys().filter(|k| !ROOT_KEYS.contains(&k.as_str())) {
            warn!(%key, "ignoring unknown specification key");
        }
        let datastores = parse_datastores(root.get("dataStores"))?;
        let root_defaults = match root.get("defaultMappings") {
            None | Some(Json::Null) => None,
            Some(stores) => Some(store_names("<root>", "defaultMappings", stores)?),
        };
        let mut drafts = self.drafts(root.get("concepts"))?;
        extensions::apply(&mut drafts)?;

        let concepts = drafts
            .iter()
            .map(|draft| self.finalize(draft, root_defaults.as_deref()).map(Arc::new))
            .collect::<VarvResult<Vec<_>>>()?;
        check_references(&concepts);
        debug!(concepts = concepts.len(), datastores = datastores.len(), "specification parsed");
        Ok(LoadedSpec { datastores, concepts })
    }

    fn drafts(&self, concepts: Option<&Json>) -> VarvResult<Vec<ConceptDraft>> {
        match concepts {
            None | Some(Json::Null) => Ok(Vec::new()),
            Some(Json::Object(map)) => map
                .iter()
                .map(|(name, json)| ConceptDraft::parse(name, json))
                .collect(),
            Some(other) => Err(invalid(format!("'concepts' must be an object, got {other}"))),
        }
    }

    /// Builds the final concept from a fully extended draft.
    ///
    /// Unmapped properties use the concept's `defaultMappings`, then the
    /// document's, then the engine's.
    pub fn finalize(&self, draft: &ConceptDraft, root_defaults: Option<&[String]>) -> VarvResult<Concept> {
        let fallback: Vec<String> = draft
            .default_mappings
            .clone()
            .unwrap_or_else(|| root_defaults.unwrap_or(self.default_mappings).to_vec());

        let mut properties = Vec::with_capacity(draft.schema.len());
        let mut mappings = BTreeMap::new();
        for (name, schema) in &draft.schema {
            let property = Property::from_schema(name, schema)?;
            if property.is_derived() {
                if draft.mappings.contains_key(name) {
                    warn!(concept = %draft.name, property = %name, "derived property mapping ignored");
                }
            } else {
                let stores = draft.mappings.get(name).cloned().unwrap_or_else(|| fallback.clone());
                mappings.insert(name.clone(), stores);
            }
            properties.push(Arc::new(property));
        }
        for name in draft.mappings.keys().filter(|n| !draft.schema.contains_key(*n)) {
            warn!(concept = %draft.name, property = %name, "mapping for an undeclared property");
        }

        let behaviours = draft
            .actions
            .iter()
            .map(|(name, decl)| self.behaviour(&draft.name, name, decl).map(Arc::new))
            .collect::<VarvResult<Vec<_>>>()?;

        Ok(Concept::new(
            draft.name.clone(),
            properties,
            behaviours,
            draft.others.clone(),
            mappings,
            &fallback,
        ))
    }

    /// `[steps...]` runs only when invoked; `{"when": [...], "then": [...]}`
    /// also reacts to its triggers.
    fn behaviour(&self, concept: &str, name: &str, decl: &Json) -> VarvResult<Behaviour> {
        let (when, then) = match decl {
            Json::Array(steps) => (Vec::new(), steps.clone()),
            Json::Object(map) => {
                for key in map.keys().filter(|k| *k != "when" && *k != "then") {
                    warn!(%concept, behaviour = %name, %key, "ignoring unknown behaviour key");
                }
                (entries(map.get("when")), entries(map.get("then")))
            }
            other => {
                return Err(invalid(format!(
                    "behaviour '{concept}.{name}' must be a step list or a when/then object, got {other}"
                )))
            }
        };
        let triggers = when
            .iter()
            .map(|entry| self.triggers.parse(entry))
            .collect::<VarvResult<Vec<_>>>()?;
        let chain = self.actions.parse_chain(&then)?;
        Ok(Behaviour::new(name, concept, triggers, chain))
    }
}

fn parse_datastores(section: Option<&Json>) -> VarvResult<Vec<DatastoreDecl>> {
    let map = match section {
        None | Some(Json::Null) => return Ok(Vec::new()),
        Some(Json::Object(map)) => map,
        Some(other) => return Err(invalid(format!("'dataStores' must be an object, got {other}"))),
    };
    map.iter()
        .map(|(name, decl)| {
            let kind = decl
                .get("type")
                .and_then(Json::as_str)
                .ok_or_else(|| invalid(format!("datastore '{name}' needs a string 'type'")))?;
            Ok(DatastoreDecl {
                name: name.clone(),
                kind: kind.to_string(),
                options: decl.get("options").cloned().unwrap_or(Json::Null),
            })
        })
        .collect()
}

fn check_references(concepts: &[Arc<Concept>]) {
    let known: BTreeSet<&str> = concepts.iter().map(|c| c.name()).collect();
    for concept in concepts {
        for property in concept.properties() {
            if let Some(referenced) = property.property_type().referenced_concept() {
                if !known.contains(referenced) {
                    warn!(
                        concept = %concept.name(),
                        property = %property.name(),
                        %referenced,
                        "property references a concept not declared in this specification"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(spec: &Json) -> VarvResult<LoadedSpec> {
        let actions = ActionRegistry::default();
        let triggers = TriggerRegistry::default();
        let defaults = vec!["memory".to_string()];
        ConceptLoader::new(&actions, &triggers, &defaults).load(spec)
    }

    #[test]
    fn test_parses_datastores_and_concepts_in_order() {
        let loaded = load(&json!({
            "dataStores": {"cache": {"type": "memory", "options": {"skipUnchanged": false}}},
            "concepts": {
                "Todo": {"schema": {"text": "string", "done": "boolean"}},
                "List": {"schema": {"items": {"array": {"items": "Todo"}}}}
            }
        }))
        .unwrap();
        assert_eq!(loaded.datastores, vec![DatastoreDecl {
            name: "cache".into(),
            kind: "memory".into(),
            options: json!({"skipUnchanged": false}),
        }]);
        let names: Vec<&str> = loaded.concepts.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["Todo", "List"]);
        assert_eq!(loaded.concepts[0].property_names(), vec!["text", "done"]);
    }

    #[test]
    fn test_mapping_precedence() {
        let loaded = load(&json!({"concepts": {
            "A": {
                "schema": {"x": "string", "y": "string", "total": {"number": {"derive": "1 + 1"}}},
                "mappings": {"x": ["cache", "memory"]},
                "defaultMappings": "disk"
            },
            "B": {"schema": {"z": "number"}}
        }}))
        .unwrap();
        let a = &loaded.concepts[0];
        assert_eq!(a.mapped_datastores("x"), ["cache", "memory"]);
        assert_eq!(a.mapped_datastores("y"), ["disk"]);
        assert!(a.mapped_datastores("total").is_empty());
        assert_eq!(a.datastores(), ["cache", "memory", "disk"]);
        assert_eq!(loaded.concepts[1].mapped_datastores("z"), ["memory"]);
    }

    #[test]
    fn test_document_default_mappings_sit_between_concept_and_engine() {
        let loaded = load(&json!({
            "dataStores": {"shared": {"type": "memory"}},
            "defaultMappings": ["shared"],
            "concepts": {
                "Doc": {"schema": {"body": "string"}},
                "Note": {"schema": {"text": "string"}, "defaultMappings": "memory"},
                "Pin": {}
            }
        }))
        .unwrap();
        assert_eq!(loaded.concepts[0].mapped_datastores("body"), ["shared"]);
        assert_eq!(loaded.concepts[1].mapped_datastores("text"), ["memory"]);
        assert_eq!(loaded.concepts[2].datastores(), ["shared"]);

        assert!(load(&json!({"defaultMappings": 3})).is_err());
    }

    #[test]
    fn test_behaviour_forms() {
        let loaded = load(&json!({"concepts": {"Todo": {
            "schema": {"done": "boolean"},
            "actions": {
                "finish": [{"set": {"done": true}}],
                "onNew": {"when": {"appeared": "Todo"}, "then": ["finish"]}
            }
        }}}))
        .unwrap();
        let todo = &loaded.concepts[0];
        let finish = todo.behaviour("finish").unwrap();
        assert!(finish.triggers().is_empty());
        assert_eq!(finish.chain().len(), 1);
        let on_new = todo.behaviour("onNew").unwrap();
        assert_eq!(on_new.triggers().len(), 1);
        assert_eq!(on_new.triggers()[0].name(), "appeared");
        assert_eq!(on_new.chain().steps()[0].name(), "finish");
    }

    #[test]
    fn test_rejects_malformed_sections() {
        assert!(load(&json!([])).unwrap_err().is_spec());
        assert!(load(&json!({"concepts": {"A": {"schema": []}}})).is_err());
        assert!(load(&json!({"dataStores": {"x": {"options": {}}}})).is_err());
        assert!(load(&json!({"concepts": {"A": {"actions": {"go": 3}}}})).is_err());
        assert!(load(&json!({"concepts": {"A": {"actions": {"go": {"when": [{"hover": 1}]}}}}})).is_err());
        assert!(load(&json!({"concepts": {"A": {"mappings": {"x": 1}}}})).is_err());
    }

    #[test]
    fn test_structure_alias_and_null_concept() {
        let loaded = load(&json!({"concepts": {"A": {"structure": {"x": "number"}}, "Marker": null}})).unwrap();
        assert_eq!(loaded.concepts[0].property_names(), vec!["x"]);
        assert!(loaded.concepts[1].properties().is_empty());
        assert_eq!(loaded.concepts[1].datastores(), ["memory"]);
    }
}
