//! Builtin triggers: `appeared`, `disappeared`, `stateChanged`, `interval`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{lock_err, SpecError, VarvError, VarvResult};
use crate::event::EngineEvent;
use crate::trigger::{Trigger, TriggerBinding, TriggerRegistry};

pub(super) fn register(registry: &mut TriggerRegistry) {
    for kind in [EventKind::Appeared, EventKind::Disappeared, EventKind::StateChanged] {
        registry.register(
            kind.name(),
            Arc::new(move |options: &serde_json::Value| {
                Ok(Arc::new(EventTrigger::parse(kind, options)?) as Arc<dyn Trigger>)
            }),
        );
    }
    registry.register(
        IntervalTrigger::NAME,
        Arc::new(|options: &serde_json::Value| Ok(Arc::new(IntervalTrigger::parse(options)?) as Arc<dyn Trigger>)),
    );
}

fn bad_options(trigger: &str, reason: impl Into<String>) -> VarvError {
    SpecError::InvalidTrigger {
        trigger: trigger.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Task slot shared by the builtin triggers.
#[derive(Debug, Default)]
struct Worker {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn start(&self, handle: JoinHandle<()>) -> VarvResult<()> {
        let mut slot = self.handle.lock().map_err(|_| lock_err("trigger worker"))?;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

fn spawn(name: &str, future: impl std::future::Future<Output = ()> + Send + 'static) -> VarvResult<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| VarvError::internal(format!("trigger '{name}' needs a tokio runtime: {e}")))?;
    Ok(runtime.spawn(future))
}

/// Engine events a trigger can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Appeared,
    Disappeared,
    StateChanged,
}

impl EventKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Appeared => "appeared",
            Self::Disappeared => "disappeared",
            Self::StateChanged => "stateChanged",
        }
    }
}

/// Reacts to instance lifecycle or property change events.
///
/// The concept matches polymorphically: an instance whose concept is-a the
/// declared one fires too. Without a declared concept the behaviour's own
/// concept is used.
#[derive(Debug)]
pub struct EventTrigger {
    kind: EventKind,
    concept: Option<String>,
    property: Option<String>,
    worker: Worker,
}

impl EventTrigger {
    pub fn new(kind: EventKind, concept: Option<String>, property: Option<String>) -> Self {
        Self {
            kind,
            concept,
            property,
            worker: Worker::default(),
        }
    }

    /// `"Concept"` for lifecycle triggers, `"property"` for `stateChanged`,
    /// or an object with `concept` / `property`.
    pub fn parse(kind: EventKind, options: &serde_json::Value) -> VarvResult<Self> {
        let text = |key: &str, map: &serde_json::Map<String, serde_json::Value>| -> VarvResult<Option<String>> {
            match map.get(key) {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(bad_options(kind.name(), format!("'{key}' must be a string, got {other}"))),
            }
        };
        match options {
            serde_json::Value::Null => Ok(Self::new(kind, None, None)),
            serde_json::Value::String(s) if kind == EventKind::StateChanged => {
                Ok(Self::new(kind, None, Some(s.clone())))
            }
            serde_json::Value::String(s) => Ok(Self::new(kind, Some(s.clone()), None)),
            serde_json::Value::Object(map) => {
                let property = text("property", map)?;
                if property.is_some() && kind != EventKind::StateChanged {
                    return Err(bad_options(kind.name(), "'property' only applies to stateChanged"));
                }
                Ok(Self::new(kind, text("concept", map)?, property))
            }
            other => Err(bad_options(kind.name(), format!("unsupported options {other}"))),
        }
    }

    fn matches(&self, binding: &TriggerBinding, event: &EngineEvent) -> bool {
        let (event_concept, event_property) = match (self.kind, event) {
            (EventKind::Appeared, EngineEvent::Appeared { concept, .. })
            | (EventKind::Disappeared, EngineEvent::Disappeared { concept, .. }) => (concept, None),
            (EventKind::StateChanged, EngineEvent::PropertyChanged { concept, property, .. }) => {
                (concept, Some(property))
            }
            _ => return false,
        };
        if let (Some(wanted), Some(actual)) = (&self.property, event_property) {
            if wanted != actual {
                return false;
            }
        }
        let wanted = self.concept.as_deref().unwrap_or(binding.concept());
        if event_concept == wanted {
            return true;
        }
        binding
            .engine()
            .and_then(|engine| engine.get_concept(event_concept))
            .is_some_and(|c| c.is_a(wanted))
    }
}

impl Trigger for EventTrigger {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn enable(&self, binding: TriggerBinding) -> VarvResult<()> {
        let engine = binding
            .engine()
            .ok_or_else(|| VarvError::internal("trigger enabled after engine shutdown"))?;
        let mut events = engine.subscribe();
        drop(engine);

        let trigger = Self::new(self.kind, self.concept.clone(), self.property.clone());
        let handle = spawn(self.kind.name(), async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(trigger = trigger.kind.name(), skipped, "trigger lagged behind the event bus");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !trigger.matches(&binding, &event) {
                    continue;
                }
                debug!(trigger = trigger.kind.name(), event = event.name(), concept = binding.concept(), "trigger fired");
                if binding.engine().is_none() {
                    break;
                }
                binding.fire(event.to_context()).await;
            }
        })?;
        self.worker.start(handle)
    }

    fn disable(&self) {
        self.worker.stop();
    }

    fn is_enabled(&self) -> bool {
        self.worker.is_running()
    }
}

/// Fires a target-less context every `n` milliseconds.
#[derive(Debug)]
pub struct IntervalTrigger {
    period: Duration,
    worker: Worker,
}

impl IntervalTrigger {
    pub const NAME: &'static str = "interval";

    pub fn new(period: Duration) -> Self {
        Self {
            period,
            worker: Worker::default(),
        }
    }

    /// `1000` or `{"interval": 1000}`.
    pub fn parse(options: &serde_json::Value) -> VarvResult<Self> {
        let millis = match options {
            serde_json::Value::Object(map) => map.get(Self::NAME).and_then(serde_json::Value::as_u64),
            other => other.as_u64(),
        };
        match millis {
            Some(ms) if ms > 0 => Ok(Self::new(Duration::from_millis(ms))),
            _ => Err(bad_options(Self::NAME, format!("expected a positive period in ms, got {options}"))),
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Trigger for IntervalTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn enable(&self, binding: TriggerBinding) -> VarvResult<()> {
        let period = self.period;
        let handle = spawn(Self::NAME, async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if binding.engine().is_none() {
                    break;
                }
                binding.fire(Context::new()).await;
            }
        })?;
        self.worker.start(handle)
    }

    fn disable(&self) {
        self.worker.stop();
    }

    fn is_enabled(&self) -> bool {
        self.worker.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_trigger_forms() {
        let t = EventTrigger::parse(EventKind::Appeared, &json!("Todo")).unwrap();
        assert_eq!(t.concept.as_deref(), Some("Todo"));

        let t = EventTrigger::parse(EventKind::StateChanged, &json!("done")).unwrap();
        assert_eq!(t.property.as_deref(), Some("done"));
        assert!(t.concept.is_none());

        let t = EventTrigger::parse(EventKind::StateChanged, &json!({"concept": "Todo", "property": "done"})).unwrap();
        assert_eq!(t.concept.as_deref(), Some("Todo"));

        assert!(EventTrigger::parse(EventKind::Appeared, &json!({"property": "done"})).is_err());
        assert!(EventTrigger::parse(EventKind::Appeared, &json!(1)).is_err());
    }

    #[test]
    fn test_interval_forms() {
        assert_eq!(IntervalTrigger::parse(&json!(250)).unwrap().period(), Duration::from_millis(250));
        assert_eq!(
            IntervalTrigger::parse(&json!({"interval": 10})).unwrap().period(),
            Duration::from_millis(10)
        );
        assert!(IntervalTrigger::parse(&json!(0)).is_err());
        assert!(IntervalTrigger::parse(&json!("soon")).is_err());
    }

    #[test]
    fn test_enable_without_runtime_fails() {
        let t = IntervalTrigger::new(Duration::from_millis(5));
        assert!(spawn("interval", async {}).is_err());
        assert!(!t.is_enabled());
    }
}
