//! Aggregate run reports.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::reconcile::Action;

/// One failed node with its error.
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
  pub urn: String,
  pub error: String,
}

/// Outcome of an apply or destroy run.
///
/// Partial success is reported, not collapsed into total failure:
/// [`RunReport::success`] is false only if at least one node failed.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
  pub execution_id: String,
  /// Created, updated or replaced this run.
  pub applied: Vec<String>,
  /// Unchanged; outputs served from recorded state.
  pub unchanged: Vec<String>,
  pub deleted: Vec<String>,
  pub failed: Vec<NodeFailure>,
  /// Skipped because an upstream dependency failed.
  pub blocked: Vec<String>,
  /// Never dispatched because the run was cancelled.
  pub skipped: Vec<String>,
  pub cancelled: bool,
  /// Stack exports, already redacted for display.
  pub exports: BTreeMap<String, String>,
}

impl RunReport {
  pub fn success(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Planned action for one node.
#[derive(Debug, Clone)]
pub struct PlannedAction {
  pub urn: String,
  pub action: Action,
}

/// Outcome of a preview: one planned action per node, no provider calls.
#[derive(Debug, Default)]
pub struct PreviewReport {
  pub execution_id: String,
  pub actions: Vec<PlannedAction>,
  /// Nodes whose plan itself failed (e.g. forbidden replacement).
  pub errors: Vec<NodeFailure>,
}

impl PreviewReport {
  pub fn action_for(&self, urn: &str) -> Option<&Action> {
    self
      .actions
      .iter()
      .find(|planned| planned.urn == urn)
      .map(|planned| &planned.action)
  }
}
