//! Concept type map and UUID cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::concept::Concept;
use crate::error::{lock_err, VarvResult};

/// Process-wide directory of concept types and known instances.
///
/// Types keep their registration order; the global property scan walks
/// them in that order.
#[derive(Debug, Default)]
pub struct Registry {
    types: RwLock<Vec<Arc<Concept>>>,
    instances: RwLock<HashMap<String, Arc<Concept>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a concept. A different concept under a taken name replaces
    /// the old one in place, with a warning.
    pub fn register_concept(&self, concept: Arc<Concept>) -> VarvResult<()> {
        let mut types = self.types.write().map_err(|_| lock_err("concept types"))?;
        match types.iter_mut().find(|c| c.name() == concept.name()) {
            Some(slot) => {
                if !Arc::ptr_eq(slot, &concept) {
                    warn!(concept = %concept.name(), "concept re-registered, replacing the previous definition");
                    *slot = concept;
                }
            }
            None => types.push(concept),
        }
        Ok(())
    }

    /// Removes a concept type and forgets its cached instances.
    pub fn deregister_concept(&self, name: &str) -> VarvResult<Option<Arc<Concept>>> {
        let removed = {
            let mut types = self.types.write().map_err(|_| lock_err("concept types"))?;
            types
                .iter()
                .position(|c| c.name() == name)
                .map(|i| types.remove(i))
        };
        if removed.is_some() {
            let mut instances = self.instances.write().map_err(|_| lock_err("instance cache"))?;
            instances.retain(|_, c| c.name() != name);
        }
        Ok(removed)
    }

    pub fn concept(&self, name: &str) -> VarvResult<Option<Arc<Concept>>> {
        let types = self.types.read().map_err(|_| lock_err("concept types"))?;
        Ok(types.iter().find(|c| c.name() == name).cloned())
    }

    /// Every registered concept in registration order.
    pub fn concepts(&self) -> VarvResult<Vec<Arc<Concept>>> {
        Ok(self.types.read().map_err(|_| lock_err("concept types"))?.clone())
    }

    pub fn cache_instance(&self, uuid: &str, concept: Arc<Concept>) -> VarvResult<()> {
        self.instances
            .write()
            .map_err(|_| lock_err("instance cache"))?
            .insert(uuid.to_string(), concept);
        Ok(())
    }

    pub fn evict_instance(&self, uuid: &str) -> VarvResult<Option<Arc<Concept>>> {
        Ok(self
            .instances
            .write()
            .map_err(|_| lock_err("instance cache"))?
            .remove(uuid))
    }

    pub fn cached_concept(&self, uuid: &str) -> VarvResult<Option<Arc<Concept>>> {
        Ok(self
            .instances
            .read()
            .map_err(|_| lock_err("instance cache"))?
            .get(uuid)
            .cloned())
    }

    /// Number of cached instances.
    pub fn instance_count(&self) -> VarvResult<usize> {
        Ok(self.instances.read().map_err(|_| lock_err("instance cache"))?.len())
    }

    /// Forgets every type and instance.
    pub fn reset(&self) -> VarvResult<()> {
        self.types.write().map_err(|_| lock_err("concept types"))?.clear();
        self.instances.write().map_err(|_| lock_err("instance cache"))?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn concept(name: &str) -> Arc<Concept> {
        Arc::new(Concept::new(
            name,
            Vec::new(),
            Vec::new(),
            BTreeSet::new(),
            BTreeMap::new(),
            &["memory".to_string()],
        ))
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let registry = Registry::new();
        registry.register_concept(concept("A")).unwrap();
        registry.register_concept(concept("B")).unwrap();
        let replacement = concept("A");
        registry.register_concept(Arc::clone(&replacement)).unwrap();

        let names: Vec<String> = registry
            .concepts()
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(Arc::ptr_eq(&registry.concept("A").unwrap().unwrap(), &replacement));
    }

    #[test]
    fn test_deregister_evicts_instances() {
        let registry = Registry::new();
        let a = concept("A");
        registry.register_concept(Arc::clone(&a)).unwrap();
        registry.cache_instance("u1", a).unwrap();
        registry.cache_instance("u2", concept("B")).unwrap();

        assert!(registry.deregister_concept("A").unwrap().is_some());
        assert!(registry.cached_concept("u1").unwrap().is_none());
        assert!(registry.cached_concept("u2").unwrap().is_some());
        assert!(registry.deregister_concept("A").unwrap().is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = Registry::new();
        let a = concept("A");
        registry.register_concept(Arc::clone(&a)).unwrap();
        registry.cache_instance("u1", a).unwrap();
        registry.reset().unwrap();
        assert!(registry.concepts().unwrap().is_empty());
        assert_eq!(registry.instance_count().unwrap(), 0);
    }
}
