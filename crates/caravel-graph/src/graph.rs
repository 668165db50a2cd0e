//! Graph structure for traversal and analysis.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::GraphError;
use crate::node::{NodeId, ResourceNode};
use crate::spec::OutputRef;

/// The directed acyclic graph of one run's resources.
///
/// Adjacency points from a dependency to its dependents, so traversal in
/// edge direction walks from producers to consumers.
#[derive(Debug)]
pub struct ResourceGraph {
  nodes: HashMap<NodeId, Arc<ResourceNode>>,
  /// Declaration order; dispatch ties break in this order.
  order: Vec<NodeId>,
  adjacency: HashMap<NodeId, Vec<NodeId>>,
  reverse_adjacency: HashMap<NodeId, Vec<NodeId>>,
  exports: Vec<(String, OutputRef)>,
}

impl ResourceGraph {
  pub(crate) fn new(
    nodes: Vec<Arc<ResourceNode>>,
    edges: Vec<(NodeId, NodeId)>,
    exports: Vec<(String, OutputRef)>,
  ) -> Self {
    let order: Vec<NodeId> = nodes.iter().map(|node| node.id().clone()).collect();

    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut reverse_adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for id in &order {
      adjacency.entry(id.clone()).or_default();
      reverse_adjacency.entry(id.clone()).or_default();
    }
    for (from, to) in edges {
      adjacency.entry(from.clone()).or_default().push(to.clone());
      reverse_adjacency.entry(to).or_default().push(from);
    }

    Self {
      nodes: nodes
        .into_iter()
        .map(|node| (node.id().clone(), node))
        .collect(),
      order,
      adjacency,
      reverse_adjacency,
      exports,
    }
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn node(&self, id: &NodeId) -> Option<&Arc<ResourceNode>> {
    self.nodes.get(id)
  }

  /// Nodes in declaration order.
  pub fn nodes(&self) -> impl Iterator<Item = &Arc<ResourceNode>> {
    self.order.iter().filter_map(|id| self.nodes.get(id))
  }

  /// Node identities in declaration order.
  pub fn ids(&self) -> &[NodeId] {
    &self.order
  }

  /// Direct dependents of a node.
  pub fn downstream(&self, id: &NodeId) -> &[NodeId] {
    self
      .adjacency
      .get(id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Direct dependencies of a node.
  pub fn upstream(&self, id: &NodeId) -> &[NodeId] {
    self
      .reverse_adjacency
      .get(id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn exports(&self) -> &[(String, OutputRef)] {
    &self.exports
  }

  /// All transitive dependents of a node, breadth-first.
  pub fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
    let mut seen: Vec<NodeId> = Vec::new();
    let mut queue: VecDeque<&NodeId> = self.downstream(id).iter().collect();
    while let Some(next) = queue.pop_front() {
      if seen.contains(next) {
        continue;
      }
      seen.push(next.clone());
      queue.extend(self.downstream(next));
    }
    seen
  }

  /// Unresolved-dependency count per node at run start.
  pub fn indegrees(&self) -> HashMap<NodeId, usize> {
    self
      .order
      .iter()
      .map(|id| (id.clone(), self.upstream(id).len()))
      .collect()
  }

  /// Topological order via Kahn's algorithm, declaration order among ties.
  ///
  /// Any node never reaching zero in-degree after all resolvable nodes are
  /// exhausted is part of a cycle.
  pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
    let mut indegree = self.indegrees();
    let mut queue: VecDeque<NodeId> = self
      .order
      .iter()
      .filter(|id| indegree.get(*id).copied() == Some(0))
      .cloned()
      .collect();

    let mut sorted = Vec::with_capacity(self.order.len());
    while let Some(id) = queue.pop_front() {
      for dependent in self.downstream(&id) {
        if let Some(count) = indegree.get_mut(dependent) {
          *count -= 1;
          if *count == 0 {
            queue.push_back(dependent.clone());
          }
        }
      }
      sorted.push(id);
    }

    if sorted.len() == self.order.len() {
      Ok(sorted)
    } else {
      let mut stuck: Vec<String> = self
        .order
        .iter()
        .filter(|id| !sorted.contains(id))
        .map(NodeId::urn)
        .collect();
      stuck.sort();
      Err(GraphError::CycleDetected { nodes: stuck })
    }
  }

  /// Static cycle check run before any dispatch.
  pub fn verify_acyclic(&self) -> Result<(), GraphError> {
    self.topo_order().map(|_| ())
  }
}
