//! Engine events and the in-process broadcast bus.
//!
//! Triggers and datastores observe the same stream: instance lifecycle,
//! property changes, runtime type switches and reload completion.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::context::Context;
use crate::value::Value;

/// Process-wide event published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A concept instance was created or discovered at load.
    Appeared { concept: String, uuid: String },

    /// A concept instance was deleted.
    Disappeared { concept: String, uuid: String },

    /// A property value changed.
    PropertyChanged {
        concept: String,
        uuid: String,
        property: String,
        value: Value,
        previous: Value,
    },

    /// An instance changed concept type in place.
    TypeChanged { uuid: String, from: String, to: String },

    /// A reload finished and behaviours are live again.
    EngineReloaded { generation: u64 },
}

impl EngineEvent {
    /// Wire name (`appeared`, `disappeared`, ...).
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Appeared { .. } => "appeared",
            Self::Disappeared { .. } => "disappeared",
            Self::PropertyChanged { .. } => "stateChanged",
            Self::TypeChanged { .. } => "typeChanged",
            Self::EngineReloaded { .. } => "engineReloaded",
        }
    }

    /// Instance the event is about.
    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::Appeared { uuid, .. }
            | Self::Disappeared { uuid, .. }
            | Self::PropertyChanged { uuid, .. }
            | Self::TypeChanged { uuid, .. } => Some(uuid),
            Self::EngineReloaded { .. } => None,
        }
    }

    /// Concept the instance belongs to; the new type for `TypeChanged`.
    #[must_use]
    pub fn concept(&self) -> Option<&str> {
        match self {
            Self::Appeared { concept, .. }
            | Self::Disappeared { concept, .. }
            | Self::PropertyChanged { concept, .. } => Some(concept),
            Self::TypeChanged { to, .. } => Some(to),
            Self::EngineReloaded { .. } => None,
        }
    }

    /// Builds the context a trigger hands to its chain.
    ///
    /// The target is the instance; `concept` and, for property changes,
    /// `property` / `value` / `previousValue` are bound as variables. The
    /// serialized event is kept as the context's native event.
    #[must_use]
    pub fn to_context(&self) -> Context {
        let mut ctx = match self.uuid() {
            Some(uuid) => Context::with_target(uuid),
            None => Context::new(),
        };
        if let Some(concept) = self.concept() {
            ctx.set_variable("concept", concept);
        }
        if let Self::PropertyChanged {
            property,
            value,
            previous,
            ..
        } = self
        {
            ctx.set_variable("property", property.as_str());
            ctx.set_variable("value", value.clone());
            ctx.set_variable("previousValue", previous.clone());
        }
        ctx.event = serde_json::to_value(self).ok().map(Value::from);
        ctx
    }
}

/// In-process event bus based on a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publishes to all live subscribers, returning how many received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_delivers_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let delivered = bus.publish(EngineEvent::Appeared {
            concept: "Todo".into(),
            uuid: "u1".into(),
        });
        assert_eq!(delivered, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "appeared");
        assert_eq!(event.uuid(), Some("u1"));
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(EngineEvent::EngineReloaded { generation: 1 }), 0);
    }

    #[test]
    fn test_property_change_context() {
        let ctx = EngineEvent::PropertyChanged {
            concept: "Todo".into(),
            uuid: "u1".into(),
            property: "done".into(),
            value: Value::from(true),
            previous: Value::from(false),
        }
        .to_context();
        assert_eq!(ctx.target.as_deref(), Some("u1"));
        assert_eq!(ctx.variables.get("value"), Some(&Value::from(true)));
        assert_eq!(ctx.variables.get("previousValue"), Some(&Value::from(false)));
        assert!(ctx.event.is_some());
    }
}
