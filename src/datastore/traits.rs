//! The datastore contract.
//!
//! Concrete backends live outside the core; the engine only drives this trait.
//! A datastore:
//! - installs a [`PropertyBackend`](crate::property::PropertyBackend) on every
//!   property it maps (`create_backing_store`)
//! - answers which concept a UUID belongs to and which instances exist
//! - observes instance appearance and disappearance for the concepts it maps

use async_trait::async_trait;
use thiserror::Error;

use crate::concept::Concept;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::VarvResult;
use crate::filter::Filter;
use crate::property::Property;

/// Errors raised by datastore backends.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DatastoreError {
    /// Backend cannot be reached.
    #[error("Datastore '{datastore}' unavailable: {reason}")]
    Unavailable { datastore: String, reason: String },

    /// Property is not mapped into this store.
    #[error("Datastore '{datastore}' does not map {concept}.{property}")]
    NotMapped {
        datastore: String,
        concept: String,
        property: String,
    },

    /// Instance unknown to this store.
    #[error("Datastore '{datastore}' has no instance {uuid}")]
    UnknownInstance { datastore: String, uuid: String },

    /// Options given to the store factory are unusable.
    #[error("Invalid options for datastore '{datastore}': {reason}")]
    InvalidOptions { datastore: String, reason: String },

    /// Backend error.
    #[error("Datastore '{datastore}' error: {reason}")]
    Backend { datastore: String, reason: String },
}

impl DatastoreError {
    pub(crate) fn backend(datastore: &str, reason: impl Into<String>) -> Self {
        Self::Backend {
            datastore: datastore.to_string(),
            reason: reason.into(),
        }
    }
}

/// Arguments of an instance query.
#[derive(Debug, Clone, Copy)]
pub struct InstanceQuery<'a> {
    /// Concept names to match, already expanded polymorphically.
    pub type_names: &'a [String],
    pub filter: Option<&'a Filter>,
    /// Context the filter is evaluated in; each candidate becomes its target.
    pub context: &'a Context,
    pub limit: Option<usize>,
    pub local_concept: Option<&'a str>,
}

impl<'a> InstanceQuery<'a> {
    #[must_use]
    pub fn new(type_names: &'a [String], context: &'a Context) -> Self {
        Self {
            type_names,
            filter: None,
            context,
            limit: None,
            local_concept: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Option<&'a Filter>) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_local_concept(mut self, local_concept: Option<&'a str>) -> Self {
        self.local_concept = local_concept;
        self
    }
}

/// Storage backend contract.
///
/// # Safety Considerations
/// - Implementations must not hold locks across `.await`
/// - Writes made by the framework must not be re-reported by the store's own
///   observers (see [`ObserverSwitch`](super::ObserverSwitch))
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Name the store was declared under.
    fn name(&self) -> &str;

    /// Type name the store was created from (`"memory"`, ...).
    fn kind(&self) -> &str;

    async fn init(&self) -> Result<(), DatastoreError>;

    async fn destroy(&self) -> Result<(), DatastoreError>;

    /// Discovers persisted instances as `(concept, uuid)` pairs.
    async fn load_backing_store(&self) -> Result<Vec<(String, String)>, DatastoreError>;

    /// Starts backing `concept.property`, installing its get/set backend.
    async fn create_backing_store(
        &self,
        concept: &Concept,
        property: &Property,
    ) -> Result<(), DatastoreError>;

    /// Stops backing `concept.property` and removes its backend.
    async fn remove_backing_store(
        &self,
        concept: &Concept,
        property: &Property,
    ) -> Result<(), DatastoreError>;

    /// Concept name this store associates with `uuid`.
    async fn lookup_concept(&self, uuid: &str) -> Result<Option<String>, DatastoreError>;

    /// UUIDs of matching instances in store order.
    async fn lookup_instances(&self, engine: &Engine, query: &InstanceQuery<'_>) -> VarvResult<Vec<String>>;

    async fn count_instances(&self, engine: &Engine, query: &InstanceQuery<'_>) -> VarvResult<usize> {
        Ok(self.lookup_instances(engine, query).await?.len())
    }

    async fn exists_instance(&self, engine: &Engine, query: &InstanceQuery<'_>) -> VarvResult<bool> {
        let query = query.with_limit(Some(1));
        Ok(!self.lookup_instances(engine, &query).await?.is_empty())
    }

    /// True if this store backs any property of `concept`.
    fn is_concept_mapped(&self, concept: &Concept) -> bool {
        self.is_concept_type_mapped(concept.name())
    }

    fn is_property_mapped(&self, concept: &str, property: &str) -> bool;

    /// True if this store maps the concept type named `concept`.
    fn is_concept_type_mapped(&self, concept: &str) -> bool;

    /// An instance of a mapped concept was created.
    async fn instance_appeared(&self, concept: &str, uuid: &str) -> Result<(), DatastoreError>;

    /// An instance of a mapped concept was deleted.
    async fn instance_disappeared(&self, concept: &str, uuid: &str) -> Result<(), DatastoreError>;
}
