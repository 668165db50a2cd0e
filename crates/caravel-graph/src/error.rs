//! Graph construction errors.

use thiserror::Error;

/// Static validation failures caught before any provider call.
#[derive(Debug, Error)]
pub enum GraphError {
  /// The combined explicit and implicit edge set is not a DAG.
  #[error("dependency cycle detected among: {nodes:?}")]
  CycleDetected { nodes: Vec<String> },

  /// The same `(kind, name)` identity was declared twice in one run.
  #[error("resource '{urn}' declared twice")]
  DuplicateNode { urn: String },
}
