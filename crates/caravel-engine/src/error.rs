//! Engine errors.
//!
//! Per-node provider failures are not errors at this level: they are
//! isolated to their branch and reported in the run report. What surfaces
//! here either aborts the run before any provider call (static validation)
//! or is a fatal engine defect.

use caravel_graph::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("no provider registered for kind '{kind}'")]
  UnknownKind { kind: String },

  /// An input reference failed to resolve after its dependencies applied.
  /// Either an engine defect or a reference to an output key the provider
  /// never returned; not recoverable within the run.
  #[error("unresolved input {reference} for '{urn}'")]
  DependencyUnresolved { urn: String, reference: String },

  /// An output cell was resolved twice.
  #[error("output '{key}' of '{urn}' resolved twice")]
  ResolutionConflict { urn: String, key: String },

  #[error("state store operation failed: {source}")]
  Store {
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

impl EngineError {
  pub(crate) fn store<E>(source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store {
      source: Box::new(source),
    }
  }

  /// Whether this failure belongs to the static-validation class that
  /// aborts before any provider call (process exit code 2).
  pub fn is_static(&self) -> bool {
    matches!(self, Self::Graph(_) | Self::UnknownKind { .. })
  }
}
