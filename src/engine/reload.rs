//! Reloading from specification sources.
//!
//! A reload tears everything down and rebuilds from the registered
//! [`SpecSource`]s: triggers off, datastores destroyed, registry reset,
//! fragments fetched and merged, the result loaded. Reloads are serialized
//! through a FIFO lock, so a request made while one is running waits for
//! it. [`Engine::schedule_reload`] debounces bursts of requests into one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::merge::{merge_all, resolve_merge_conflicts};
use super::{Engine, LoadSummary};
use crate::error::{lock_err, SpecError, VarvError, VarvResult};
use crate::event::EngineEvent;

/// A provider of one specification fragment.
#[async_trait]
pub trait SpecSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> VarvResult<serde_json::Value>;
}

/// A fragment held in memory.
#[derive(Debug, Clone)]
pub struct StaticSpec {
    name: String,
    spec: serde_json::Value,
}

impl StaticSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[async_trait]
impl SpecSource for StaticSpec {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> VarvResult<serde_json::Value> {
        Ok(self.spec.clone())
    }
}

/// A JSON fragment read from disk on every reload.
#[derive(Debug, Clone)]
pub struct FileSpec {
    name: String,
    path: PathBuf,
}

impl FileSpec {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
        }
    }

    fn failed(&self, reason: impl Into<String>) -> VarvError {
        SpecError::Source {
            source_name: self.name.clone(),
            reason: reason.into(),
        }
        .into()
    }
}

#[async_trait]
impl SpecSource for FileSpec {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> VarvResult<serde_json::Value> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.failed(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| self.failed(e.to_string()))
    }
}

/// Outcome of one reload, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    /// Sequence number among finished reloads, starting at 1.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub summary: Option<LoadSummary>,
    /// Paths of merge conflicts settled by keeping the last fragment.
    pub unresolved_conflicts: Vec<String>,
    pub error: Option<String>,
}

impl ReloadReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Notified after every reload.
pub trait ReloadListener: Send + Sync {
    fn reload_finished(&self, report: &ReloadReport);
}

impl<F> ReloadListener for F
where
    F: Fn(&ReloadReport) + Send + Sync,
{
    fn reload_finished(&self, report: &ReloadReport) {
        self(report);
    }
}

#[derive(Default)]
pub(super) struct ReloadState {
    lock: Mutex<()>,
    requested: AtomicU64,
    completed: AtomicU64,
    sources: RwLock<Vec<Arc<dyn SpecSource>>>,
    listeners: RwLock<Vec<Arc<dyn ReloadListener>>>,
}

struct Rebuilt {
    sources: usize,
    summary: LoadSummary,
    unresolved: Vec<String>,
}

impl Engine {
    /// Appends a source; fragments merge in registration order.
    pub fn add_source(&self, source: Arc<dyn SpecSource>) -> VarvResult<()> {
        self.reload
            .sources
            .write()
            .map_err(|_| lock_err("spec sources"))?
            .push(source);
        Ok(())
    }

    pub fn clear_sources(&self) -> VarvResult<()> {
        self.reload
            .sources
            .write()
            .map_err(|_| lock_err("spec sources"))?
            .clear();
        Ok(())
    }

    pub fn add_reload_listener(&self, listener: Arc<dyn ReloadListener>) -> VarvResult<()> {
        self.reload
            .listeners
            .write()
            .map_err(|_| lock_err("reload listeners"))?
            .push(listener);
        Ok(())
    }

    /// Number of reloads that have finished, failed ones included.
    #[must_use]
    pub fn completed_reloads(&self) -> u64 {
        self.reload.completed.load(Ordering::SeqCst)
    }

    /// Rebuilds the engine from its sources, waiting for any reload
    /// already running.
    ///
    /// Listeners hear about failures too; the error is also returned.
    pub async fn reload(&self) -> VarvResult<ReloadReport> {
        let _serial = self.reload.lock.lock().await;
        let started_at = Utc::now();
        let outcome = self.rebuild().await;
        let generation = self.reload.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let finished_at = Utc::now();

        let report = match &outcome {
            Ok(rebuilt) => ReloadReport {
                generation,
                started_at,
                finished_at,
                sources: rebuilt.sources,
                summary: Some(rebuilt.summary),
                unresolved_conflicts: rebuilt.unresolved.clone(),
                error: None,
            },
            Err(e) => ReloadReport {
                generation,
                started_at,
                finished_at,
                sources: 0,
                summary: None,
                unresolved_conflicts: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        match &outcome {
            Ok(_) => {
                info!(generation, elapsed_ms = report.duration().num_milliseconds(), "reload finished");
                self.publish(EngineEvent::EngineReloaded { generation });
            }
            Err(e) => error!(generation, error = %e, "reload failed"),
        }
        self.notify(&report);
        outcome.map(|_| report)
    }

    async fn rebuild(&self) -> VarvResult<Rebuilt> {
        self.disable_behaviours()?;
        for store in self.take_datastores()? {
            if let Err(e) = store.destroy().await {
                warn!(datastore = %store.name(), error = %e, "datastore destroy failed");
            }
        }
        self.registry.reset()?;

        let sources = self
            .reload
            .sources
            .read()
            .map_err(|_| lock_err("spec sources"))?
            .clone();
        let mut fragments = Vec::with_capacity(sources.len());
        for source in &sources {
            fragments.push(source.fetch().await?);
            debug!(source = %source.name(), "fragment fetched");
        }
        let (spec, unresolved) = resolve_merge_conflicts(merge_all(fragments));
        let summary = self.load_spec(&spec).await?;
        Ok(Rebuilt {
            sources: sources.len(),
            summary,
            unresolved,
        })
    }

    fn notify(&self, report: &ReloadReport) {
        let listeners = match self.reload.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                warn!("reload listeners unavailable");
                return;
            }
        };
        for listener in listeners {
            listener.reload_finished(report);
        }
    }

    /// Requests a reload after the configured debounce delay.
    ///
    /// A later request restarts the delay, so a burst collapses into one
    /// reload. The handle resolves to the report, or `None` when the
    /// request was superseded, the engine went away, or the reload failed.
    pub fn schedule_reload(&self) -> VarvResult<JoinHandle<Option<ReloadReport>>> {
        let ticket = self.reload.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = Duration::from_millis(self.config.reload_debounce_ms);
        let engine = self.me.clone();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VarvError::internal(format!("scheduling a reload needs a tokio runtime: {e}")))?;
        Ok(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let engine = engine.upgrade()?;
            if engine.reload.requested.load(Ordering::SeqCst) != ticket {
                debug!(ticket, "reload request superseded");
                return None;
            }
            engine.reload().await.ok()
        }))
    }
}
