//! Engine configuration.

use serde::Deserialize;

use crate::error::{SpecError, VarvResult};

/// A datastore the engine creates even when no specification declares it.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatastoreDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl DatastoreDecl {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            options: serde_json::Value::Null,
        }
    }
}

/// Runtime knobs for an [`Engine`](crate::Engine).
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Delay before a scheduled reload runs; further requests restart it.
    pub reload_debounce_ms: u64,
    /// Broadcast buffer of the event bus.
    pub event_capacity: usize,
    /// Datastores for concepts that declare no mappings.
    pub default_mappings: Vec<String>,
    pub default_datastores: Vec<DatastoreDecl>,
    /// Limit for behaviours invoking behaviours.
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reload_debounce_ms: 250,
            event_capacity: 1024,
            default_mappings: vec!["memory".to_string()],
            default_datastores: vec![DatastoreDecl::new("memory", "memory")],
            max_call_depth: 64,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> VarvResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| SpecError::Invalid {
            reason: format!("engine config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> VarvResult<()> {
        let invalid = |reason: String| SpecError::Invalid {
            reason: format!("engine config: {reason}"),
        };
        if self.event_capacity == 0 {
            return Err(invalid("eventCapacity must be positive".to_string()).into());
        }
        if self.max_call_depth == 0 {
            return Err(invalid("maxCallDepth must be positive".to_string()).into());
        }
        let mut seen = std::collections::BTreeSet::new();
        for decl in &self.default_datastores {
            if decl.name.trim().is_empty() {
                return Err(invalid("default datastore with empty name".to_string()).into());
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(invalid(format!("duplicate default datastore '{}'", decl.name)).into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_mappings, vec!["memory".to_string()]);
        assert_eq!(config.reload_debounce_ms, 250);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"reloadDebounceMs": 10}"#).unwrap();
        assert_eq!(config.reload_debounce_ms, 10);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_json_str(r#"{"eventCapacity": 0}"#).is_err());
        let dup = r#"{"defaultDatastores": [{"name": "m", "type": "memory"}, {"name": "m", "type": "memory"}]}"#;
        assert!(EngineConfig::from_json_str(dup).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }
}
