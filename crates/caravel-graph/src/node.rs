//! Resource identity, lifecycle status and the declared node itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use caravel_value::ValueCell;
use serde::{Deserialize, Serialize};

use crate::spec::{OutputRef, SpecValue};

/// Identity of a resource within a run: `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
  pub kind: String,
  pub name: String,
}

impl NodeId {
  pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      name: name.into(),
    }
  }

  /// Stable display form, `kind::name`. Also the key under which the
  /// resource is recorded in persisted state.
  pub fn urn(&self) -> String {
    format!("{}::{}", self.kind, self.name)
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}::{}", self.kind, self.name)
  }
}

/// Lifecycle status of a node within a single run.
///
/// Only the scheduler transitions status; Blocked and Failed are terminal
/// for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  Pending,
  Runnable,
  Applying,
  Applied,
  Failed,
  Blocked,
  Deleted,
}

/// A declared resource: desired spec, dependency identities and the output
/// cells dependents read from.
///
/// Output cells are created on first reference, so a cell exists as soon as
/// any dependent (or export) names the output - resolved or not.
#[derive(Debug)]
pub struct ResourceNode {
  id: NodeId,
  spec: SpecValue,
  depends_on: Vec<NodeId>,
  outputs: Mutex<HashMap<String, Arc<ValueCell>>>,
}

impl ResourceNode {
  pub(crate) fn new(id: NodeId, spec: SpecValue, depends_on: Vec<NodeId>) -> Self {
    Self {
      id,
      spec,
      depends_on,
      outputs: Mutex::new(HashMap::new()),
    }
  }

  pub fn id(&self) -> &NodeId {
    &self.id
  }

  pub fn spec(&self) -> &SpecValue {
    &self.spec
  }

  /// Explicit and implicit dependencies, deduplicated.
  pub fn depends_on(&self) -> &[NodeId] {
    &self.depends_on
  }

  /// The cell for one output key, created on first use.
  pub fn output_cell(&self, key: &str) -> Arc<ValueCell> {
    let mut outputs = self.lock_outputs();
    outputs
      .entry(key.to_string())
      .or_insert_with(|| Arc::new(ValueCell::new()))
      .clone()
  }

  /// A reference to one output, suitable for embedding in another spec.
  pub fn output(&self, key: &str) -> OutputRef {
    OutputRef::new(self.id.clone(), key, self.output_cell(key))
  }

  /// Snapshot of the cells referenced so far.
  pub fn cells(&self) -> Vec<(String, Arc<ValueCell>)> {
    self
      .lock_outputs()
      .iter()
      .map(|(key, cell)| (key.clone(), cell.clone()))
      .collect()
  }

  fn lock_outputs(&self) -> MutexGuard<'_, HashMap<String, Arc<ValueCell>>> {
    match self.outputs.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}
