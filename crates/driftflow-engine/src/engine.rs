//! Engine facade
//!
//! Wires the graph builder, state store, planner and executor together so
//! callers deal with declarations and reports only.

use crate::apply::{ApplyReport, CancelHandle, Executor, ExecutorOptions, call_with_retry};
use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::plan::{ChangeSet, Planner};
use crate::provider::ProviderRegistry;
use crate::resource::{ResourceDeclaration, ResourceId};
use crate::state::{LockInfo, StateLock, StateSnapshot, StateStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub executor: ExecutorOptions,

    /// Lease taken on the state lock; must outlast a full apply
    pub lock_lease: Duration,

    /// Name recorded as lock holder
    pub holder: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorOptions::default(),
            lock_lease: Duration::from_secs(3600),
            holder: default_holder(),
        }
    }
}

fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}@pid{}", user, std::process::id())
}

/// Result of comparing recorded state with live objects
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Live object matches the record
    pub unchanged: Vec<ResourceId>,
    /// Record updated from the live object
    pub drifted: Vec<ResourceId>,
    /// Live object is gone; record removed
    pub removed: Vec<ResourceId>,
    /// Read failed; record left as is
    pub failed: Vec<(ResourceId, String)>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Reconciliation engine bound to one state store
pub struct Engine {
    store: Arc<StateStore>,
    registry: ProviderRegistry,
    options: EngineOptions,
    cancel: CancelHandle,
}

impl Engine {
    pub fn new(store: StateStore, registry: ProviderRegistry, options: EngineOptions) -> Self {
        Self {
            store: Arc::new(store),
            registry,
            options,
            cancel: CancelHandle::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Handle that stops the current apply from starting further entries
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Compute the change set that would converge state to `declarations`
    ///
    /// Read-only: no lock is taken and no provider is called.
    pub async fn plan(&self, declarations: Vec<ResourceDeclaration>) -> Result<ChangeSet> {
        let graph = ResourceGraph::build(declarations)?;
        let snapshot = self.store.snapshot().await?;
        Planner::new(&self.registry).plan(&graph, &snapshot)
    }

    /// Change set that deletes every recorded resource
    pub async fn plan_destroy(&self) -> Result<ChangeSet> {
        let snapshot = self.store.snapshot().await?;
        Planner::new(&self.registry).plan_destroy(&snapshot)
    }

    /// Plan and apply `declarations` under the state lock
    ///
    /// The plan is computed after the lock is taken so it reflects the state
    /// the executor will write against.
    pub async fn apply(&self, declarations: Vec<ResourceDeclaration>) -> Result<ApplyReport> {
        let graph = ResourceGraph::build(declarations)?;
        let lock = self.lock().await?;
        let result = async {
            let snapshot = self.store.snapshot().await?;
            let plan = Planner::new(&self.registry).plan(&graph, &snapshot)?;
            tracing::info!("Plan: {}", plan.summary());
            self.executor().execute(&plan, &lock).await
        }
        .await;
        release(lock).await;
        result
    }

    /// Apply a change set computed earlier
    ///
    /// Entries whose record moved on since planning fail with a version
    /// conflict instead of overwriting newer state.
    pub async fn apply_plan(&self, plan: &ChangeSet) -> Result<ApplyReport> {
        let lock = self.lock().await?;
        let result = self.executor().execute(plan, &lock).await;
        release(lock).await;
        result
    }

    /// Delete every recorded resource, dependents first
    pub async fn destroy(&self) -> Result<ApplyReport> {
        let lock = self.lock().await?;
        let result = async {
            let snapshot = self.store.snapshot().await?;
            let plan = Planner::new(&self.registry).plan_destroy(&snapshot)?;
            tracing::info!("Destroy plan: {}", plan.summary());
            self.executor().execute(&plan, &lock).await
        }
        .await;
        release(lock).await;
        result
    }

    /// Reconcile recorded state with live objects through `Provider::read`
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let lock = self.lock().await?;
        let result = self.refresh_locked(&lock).await;
        release(lock).await;
        result
    }

    async fn refresh_locked(&self, lock: &StateLock) -> Result<RefreshReport> {
        let token = lock.token();
        let snapshot: StateSnapshot = self.store.snapshot().await?;
        let retry = &self.options.executor.retry;
        let timeout = self.options.executor.call_timeout;
        let mut report = RefreshReport::default();

        for record in snapshot.iter() {
            let provider = match self.registry.get(&record.provider) {
                Ok(provider) => provider,
                Err(e) => {
                    report.failed.push((record.id.clone(), e.to_string()));
                    continue;
                }
            };

            let what = format!("read {}", record.id);
            let (result, _) = call_with_retry(retry, timeout, &what, || {
                provider.read(&record.id, &record.attributes)
            })
            .await;

            match result {
                Ok(Some(live)) if live == record.attributes => {
                    report.unchanged.push(record.id.clone());
                }
                Ok(Some(live)) => {
                    tracing::info!("Drift detected on {}", record.id);
                    let mut updated = record.clone();
                    updated.attributes = live;
                    self.store
                        .write(&token, updated, Some(record.version))
                        .await?;
                    report.drifted.push(record.id.clone());
                }
                Ok(None) => {
                    tracing::warn!("{} no longer exists; removing it from state", record.id);
                    self.store.delete(&token, &record.id).await?;
                    report.removed.push(record.id.clone());
                }
                Err(e) => {
                    tracing::error!("Failed to read {}: {}", record.id, e);
                    report.failed.push((record.id.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Current lock holder, if any
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.store.lock_info().await
    }

    /// Remove a stale lock left by a crashed run
    pub async fn force_unlock(&self) -> Result<bool> {
        self.store.force_unlock().await
    }

    async fn lock(&self) -> Result<StateLock> {
        self.store
            .acquire_lock(&self.options.holder, self.options.lock_lease)
            .await
    }

    fn executor(&self) -> Executor {
        Executor::new(
            Arc::clone(&self.store),
            self.registry.clone(),
            self.options.executor.clone(),
        )
        .with_cancel(self.cancel.clone())
    }
}

async fn release(lock: StateLock) {
    if let Err(e) = lock.release().await {
        tracing::warn!("Failed to release state lock: {}", e);
    }
}
