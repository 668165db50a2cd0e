//! Caravel Graph
//!
//! This crate turns a set of resource declarations into a directed acyclic
//! graph ready for scheduling.
//!
//! Declarations are made through a [`Builder`]. A spec is a [`SpecValue`]
//! tree: JSON literals with holes ([`OutputRef`]) referencing outputs of
//! other resources that are not known until those resources have actually
//! run. Reading another resource's output while building a spec registers an
//! implicit dependency edge as a side effect - there is no runtime
//! reflection over the spec's shape.
//!
//! No provider calls happen here; declaration only mutates the graph.

mod builder;
mod error;
mod graph;
mod node;
mod spec;

pub use builder::{Builder, ResourceHandle, SpecContext};
pub use error::GraphError;
pub use graph::ResourceGraph;
pub use node::{NodeId, NodeStatus, ResourceNode};
pub use spec::{OutputRef, ResolveMode, ResolvedSpec, SpecError, SpecValue, unknown_marker};
