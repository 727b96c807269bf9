//! DriftFlow reconciliation engine
//!
//! This crate converges remote resources toward a declared graph. It keeps
//! the last known state of every managed resource, computes the minimal set
//! of changes and applies them with bounded parallelism in dependency order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  DriftFlow CLI                   │
//! │          (drift plan/apply/destroy/refresh)      │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                driftflow-engine                  │
//! │  ┌──────────────┐  ┌──────────────┐             │
//! │  │ Graph Builder│─▶│   Planner    │◀─┐          │
//! │  └──────────────┘  └──────┬───────┘  │          │
//! │                           │          │          │
//! │  ┌──────────────┐  ┌──────▼───────┐  │          │
//! │  │ State Store  │◀─│   Executor   │  │          │
//! │  │ (state+lock) │──┼──────────────┼──┘          │
//! │  └──────────────┘  └──────┬───────┘             │
//! │  ┌────────────────────────▼─────────────────┐   │
//! │  │         trait Provider { ... }           │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────────────────────────┬─────────────────────┘
//!                             │
//!                     ┌───────▼───────┐
//!                     │ local provider│
//!                     └───────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use driftflow_engine::{Engine, EngineOptions, ProviderRegistry, ResourceDeclaration, StateStore};
//!
//! # async fn run(registry: ProviderRegistry) -> driftflow_engine::Result<()> {
//! let engine = Engine::new(StateStore::for_project("."), registry, EngineOptions::default());
//! let decls = vec![ResourceDeclaration::new("application", "api", "local")];
//! let report = engine.apply(decls).await?;
//! println!("{:?}", report.outcome());
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod engine;
pub mod error;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod resource;
pub mod state;

#[cfg(test)]
mod testing;

// Re-exports
pub use apply::{
    ApplyOutcome, ApplyReport, CancelHandle, EntryResult, EntryStatus, Executor, ExecutorOptions,
};
pub use engine::{Engine, EngineOptions, RefreshReport};
pub use error::{EngineError, RemoteError, Result};
pub use graph::ResourceGraph;
pub use plan::{ActionType, ChangeSet, ChangeSetEntry, PlanSummary, Planner};
pub use provider::{
    Provider, ProviderRegistry, RemoteResult, ReplaceMode, ResourceSchema, RetryConfig,
};
pub use resource::{AttributeValue, Attributes, ResourceDeclaration, ResourceId, ResourceNode};
pub use state::{LockInfo, LockToken, StateLock, StateRecord, StateSnapshot, StateStore};
