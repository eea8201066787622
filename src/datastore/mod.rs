//! Datastore contract, registry and the in-memory reference backend.

mod memory;
mod registry;
mod traits;

pub use memory::MemoryDatastore;
pub use registry::{
    DatastoreContext, DatastoreFactory, DatastoreRegistry, ObserverGuard, ObserverSwitch,
};
pub use traits::{Datastore, DatastoreError, InstanceQuery};
