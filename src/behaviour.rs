//! Behaviours: triggers bound to an action chain.

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::action::{ActionChain, ChainScope};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{lock_err, VarvError, VarvResult};
use crate::trigger::{Trigger, TriggerBinding};

/// How a chain run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed(Vec<Context>),
    /// A step signalled an intentional stop.
    Stopped { reason: String },
}

impl ChainOutcome {
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    /// Final contexts; empty when stopped.
    #[must_use]
    pub fn contexts(&self) -> &[Context] {
        match self {
            Self::Completed(contexts) => contexts,
            Self::Stopped { .. } => &[],
        }
    }
}

/// A named reactive rule on a concept.
pub struct Behaviour {
    name: String,
    concept: String,
    triggers: Vec<Arc<dyn Trigger>>,
    chain: ActionChain,
    enabled: RwLock<bool>,
}

impl fmt::Debug for Behaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behaviour")
            .field("name", &self.name)
            .field("concept", &self.concept)
            .field("triggers", &self.triggers.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("steps", &self.chain.len())
            .finish()
    }
}

impl Behaviour {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concept: impl Into<String>,
        triggers: Vec<Arc<dyn Trigger>>,
        chain: ActionChain,
    ) -> Self {
        Self {
            name: name.into(),
            concept: concept.into(),
            triggers,
            chain,
            enabled: RwLock::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning concept.
    #[must_use]
    pub fn concept(&self) -> &str {
        &self.concept
    }

    #[must_use]
    pub fn chain(&self) -> &ActionChain {
        &self.chain
    }

    #[must_use]
    pub fn triggers(&self) -> &[Arc<dyn Trigger>] {
        &self.triggers
    }

    /// Runs the chain on `contexts` with this behaviour's concept as the
    /// local scope. A stop signal is an outcome, not an error.
    pub async fn run(&self, engine: &Engine, contexts: Vec<Context>) -> VarvResult<ChainOutcome> {
        let scope = ChainScope::for_behaviour(self);
        match self.chain.run(engine, contexts, &scope).await {
            Ok(contexts) => Ok(ChainOutcome::Completed(contexts)),
            Err(VarvError::Stop(stop)) => Ok(ChainOutcome::Stopped { reason: stop.reason }),
            Err(e) => Err(e),
        }
    }

    /// Trigger-side entry point: runs the chain and logs a failure instead
    /// of returning it.
    pub async fn dispatch(&self, engine: &Engine, contexts: Vec<Context>) -> Option<ChainOutcome> {
        match self.run(engine, contexts).await {
            Ok(outcome) => {
                if let ChainOutcome::Stopped { reason } = &outcome {
                    debug!(behaviour = %self.name, concept = %self.concept, %reason, "chain stopped");
                }
                Some(outcome)
            }
            Err(e) => {
                error!(behaviour = %self.name, concept = %self.concept, error = %e, "behaviour failed");
                None
            }
        }
    }

    /// Enables every trigger.
    pub fn enable(self: &Arc<Self>, engine: &Arc<Engine>) -> VarvResult<()> {
        {
            let mut enabled = self.enabled.write().map_err(|_| lock_err("behaviour"))?;
            if *enabled {
                return Ok(());
            }
            *enabled = true;
        }
        for trigger in &self.triggers {
            trigger.enable(TriggerBinding::new(engine, self))?;
        }
        Ok(())
    }

    pub fn disable(&self) -> VarvResult<()> {
        let mut enabled = self.enabled.write().map_err(|_| lock_err("behaviour"))?;
        if !*enabled {
            return Ok(());
        }
        *enabled = false;
        for trigger in &self.triggers {
            trigger.disable();
        }
        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.read().map(|e| *e).unwrap_or(false)
    }
}
