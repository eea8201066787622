//! Datastore type registry and the observerless write guard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::datastore::{Datastore, DatastoreError, MemoryDatastore};
use crate::event::EventBus;

/// Handles a store factory receives.
#[derive(Clone)]
pub struct DatastoreContext {
    /// Bus observed writes are reported on.
    pub events: EventBus,
}

/// Builds a datastore from its declared name and options.
pub type DatastoreFactory = Arc<
    dyn Fn(&str, &serde_json::Value, &DatastoreContext) -> Result<Arc<dyn Datastore>, DatastoreError>
        + Send
        + Sync,
>;

/// Maps datastore type names (`"memory"`, ...) to factories.
#[derive(Clone)]
pub struct DatastoreRegistry {
    factories: BTreeMap<String, DatastoreFactory>,
}

impl Default for DatastoreRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            MemoryDatastore::KIND,
            Arc::new(|name: &str, options: &serde_json::Value, ctx: &DatastoreContext| {
                let store = MemoryDatastore::from_options(name, options, ctx.events.clone())?;
                Ok(Arc::new(store) as Arc<dyn Datastore>)
            }),
        );
        registry
    }
}

impl DatastoreRegistry {
    /// A registry without the builtin memory store.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registers (or replaces) the factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: DatastoreFactory) {
        self.factories.insert(kind.into(), factory);
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Instantiates a store, `None` if `kind` is unknown.
    pub fn create(
        &self,
        kind: &str,
        name: &str,
        options: &serde_json::Value,
        ctx: &DatastoreContext,
    ) -> Option<Result<Arc<dyn Datastore>, DatastoreError>> {
        self.factories.get(kind).map(|factory| factory(name, options, ctx))
    }
}

/// Scoped suppression of a store's change observer.
///
/// While any [`ObserverGuard`] is alive the observer is off. The guard
/// re-enables it when dropped, including on early return and panic unwind.
#[derive(Debug, Default)]
pub struct ObserverSwitch {
    suppressed: AtomicUsize,
}

impl ObserverSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no observerless section is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst) == 0
    }

    /// Disables the observer until the returned guard drops.
    #[must_use]
    pub fn suppress(&self) -> ObserverGuard<'_> {
        self.suppressed.fetch_add(1, Ordering::SeqCst);
        ObserverGuard { switch: self }
    }

    /// Runs `f` with the observer disabled.
    pub fn observerless<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.suppress();
        f()
    }
}

/// Keeps an [`ObserverSwitch`] suppressed while alive.
#[derive(Debug)]
pub struct ObserverGuard<'a> {
    switch: &'a ObserverSwitch,
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        self.switch.suppressed.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observerless_reenables_after_return() {
        let switch = ObserverSwitch::new();
        let seen = switch.observerless(|| switch.is_enabled());
        assert!(!seen);
        assert!(switch.is_enabled());
    }

    #[test]
    fn test_observerless_reenables_after_panic() {
        let switch = ObserverSwitch::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            switch.observerless(|| panic!("write failed"));
        }));
        assert!(result.is_err());
        assert!(switch.is_enabled());
    }

    #[test]
    fn test_nested_guards() {
        let switch = ObserverSwitch::new();
        let outer = switch.suppress();
        {
            let _inner = switch.suppress();
            assert!(!switch.is_enabled());
        }
        assert!(!switch.is_enabled());
        drop(outer);
        assert!(switch.is_enabled());
    }

    #[test]
    fn test_default_registry_has_memory() {
        let registry = DatastoreRegistry::default();
        assert!(registry.contains("memory"));
        assert!(!DatastoreRegistry::empty().contains("memory"));
    }
}
