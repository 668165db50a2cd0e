//! Declaration-time graph construction.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::ResourceGraph;
use crate::node::{NodeId, ResourceNode};
use crate::spec::{OutputRef, SpecValue};

/// Handle to a declared resource.
///
/// Later declarations use handles to express explicit dependencies and to
/// read outputs, so a dependency can only ever point at a resource that
/// already exists in the graph.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
  node: Arc<ResourceNode>,
}

impl ResourceHandle {
  pub fn id(&self) -> &NodeId {
    self.node.id()
  }

  /// A reference to one of this resource's outputs.
  pub fn output(&self, key: &str) -> OutputRef {
    self.node.output(key)
  }
}

/// Records implicit dependencies while a spec closure runs.
#[derive(Debug, Default)]
pub struct SpecContext {
  reads: Vec<NodeId>,
}

impl SpecContext {
  /// Read another resource's output into the spec under construction.
  ///
  /// Registers an implicit dependency on the output's owner and yields a
  /// placeholder; the scheduler substitutes the real value when this node
  /// actually runs.
  pub fn read(&mut self, reference: &OutputRef) -> SpecValue {
    self.reads.push(reference.owner().clone());
    SpecValue::Ref(reference.clone())
  }
}

/// Builds the resource graph for one run.
///
/// Declaration has no side effects beyond graph mutation; provider calls
/// only happen once a scheduler consumes the finished graph.
#[derive(Debug, Default)]
pub struct Builder {
  nodes: Vec<Arc<ResourceNode>>,
  ids: HashSet<NodeId>,
  edges: Vec<(NodeId, NodeId)>,
  exports: Vec<(String, OutputRef)>,
}

impl Builder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare one resource.
  ///
  /// The spec closure runs immediately; any [`SpecContext::read`] it
  /// performs becomes an implicit dependency edge alongside the explicit
  /// `depends_on` handles.
  pub fn declare<F>(
    &mut self,
    kind: &str,
    name: &str,
    spec: F,
    depends_on: &[&ResourceHandle],
  ) -> Result<ResourceHandle, GraphError>
  where
    F: FnOnce(&mut SpecContext) -> SpecValue,
  {
    let id = NodeId::new(kind, name);
    if !self.ids.insert(id.clone()) {
      return Err(GraphError::DuplicateNode { urn: id.urn() });
    }

    let mut ctx = SpecContext::default();
    let spec = spec(&mut ctx);

    let mut deps: Vec<NodeId> = Vec::new();
    for handle in depends_on {
      if !deps.contains(handle.id()) {
        deps.push(handle.id().clone());
      }
    }
    for read in ctx.reads {
      if !deps.contains(&read) {
        deps.push(read);
      }
    }

    for dep in &deps {
      self.edges.push((dep.clone(), id.clone()));
    }

    let node = Arc::new(ResourceNode::new(id, spec, deps));
    self.nodes.push(node.clone());
    Ok(ResourceHandle { node })
  }

  /// Register a stack-level output, included (redacted) in the run report.
  pub fn export(&mut self, name: &str, reference: OutputRef) {
    self.exports.push((name.to_string(), reference));
  }

  /// Finish declaration and validate the graph.
  pub fn finish(self) -> Result<ResourceGraph, GraphError> {
    let graph = ResourceGraph::new(self.nodes, self.edges, self.exports);
    graph.verify_acyclic()?;
    Ok(graph)
  }
}
