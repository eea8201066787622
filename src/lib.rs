//! # Varv - a reactive concept runtime
//!
//! Varv runs declarative applications described as JSON. A specification
//! declares *concepts* (entity types with typed properties), maps each
//! property onto one or more *datastores*, and attaches *behaviours*:
//! trigger-driven chains of actions that query and mutate instances.
//!
//! ## Core Concepts
//!
//! - **Concept**: a named type with properties, behaviours and an is-a set
//!   built from composition (`inject`, `join`)
//! - **Property**: a typed field whose reads race its datastores and whose
//!   writes fan out to all of them
//! - **Context**: the unit flowing through a chain, a target UUID plus
//!   variables
//! - **Behaviour**: triggers (`appeared`, `stateChanged`, `interval`, ...)
//!   bound to an action chain
//! - **Engine**: registry, resolver, event bus and reload coordinator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use serde_json::json;
//! use varv::{Context, Engine};
//!
//! let engine = Engine::with_defaults()?;
//! engine.load_spec(&json!({
//!     "concepts": {
//!         "Todo": {
//!             "schema": {"text": "string", "done": {"boolean": {"default": false}}},
//!             "actions": {
//!                 "finishAll": [{"select": {"concept": "Todo"}}, {"set": {"done": true}}]
//!             }
//!         }
//!     }
//! })).await?;
//! engine.dispatch("Todo", "finishAll", vec![Context::new()]).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod context;
pub mod error;
pub mod value;

// Declarations
pub mod concept;
pub mod expr;
pub mod filter;
pub mod property;

// Execution
pub mod action;
pub mod behaviour;
pub mod trigger;

// Storage
pub mod datastore;
pub mod fanout;

// Runtime
pub mod config;
pub mod engine;
pub mod event;
pub mod loader;

// Re-export primary types at crate root for convenience
pub use action::{Action, ActionChain, ActionRegistry, ChainScope};
pub use behaviour::{Behaviour, ChainOutcome};
pub use concept::Concept;
pub use config::{DatastoreDecl, EngineConfig};
pub use context::Context;
pub use datastore::{Datastore, DatastoreError, DatastoreRegistry, InstanceQuery, MemoryDatastore};
pub use engine::{
    Engine, FileSpec, LoadSummary, PropertyLookup, ReloadListener, ReloadReport, SpecSource, StaticSpec,
};
pub use error::{
    ExpressionError, FilterError, ResolutionError, SpecError, StopError, ValidationError, VarvError, VarvResult,
};
pub use event::{EngineEvent, EventBus};
pub use expr::Expression;
pub use filter::{Filter, FilterOp};
pub use property::{Property, PropertyType};
pub use trigger::{Trigger, TriggerRegistry};
pub use value::Value;
