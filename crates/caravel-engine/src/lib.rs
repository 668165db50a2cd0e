//! Caravel Engine
//!
//! The run core: reconciliation of desired specs against recorded state,
//! and dependency-ordered, failure-isolated execution of the resulting
//! operations.
//!
//! A run is bounded - build a graph, apply (or destroy, or preview),
//! report. There is no perpetual reconciliation loop.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Scheduler                            │
//! │  apply / destroy / preview over one ResourceGraph        │
//! │  - Kahn cycle check before any dispatch                  │
//! │  - bounded workers, completions over an mpsc channel     │
//! │  - failures isolate: dependents block, siblings proceed  │
//! └──────────────────────────────────────────────────────────┘
//!                             │ plan per node
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Reconciler                           │
//! │  desired spec + recorded state + diff policy → Action    │
//! └──────────────────────────────────────────────────────────┘
//!                             │ chosen operation
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Provider adapters                        │
//! │  create / read / update / delete per resource kind       │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod error;
mod reconcile;
mod report;
mod scheduler;

pub use error::EngineError;
pub use reconcile::{Action, PlanError, changed_fields, plan};
pub use report::{NodeFailure, PlannedAction, PreviewReport, RunReport};
pub use scheduler::{RunOptions, Scheduler};
