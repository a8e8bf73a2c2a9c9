//! Nodes and the propagation algorithm that drives them.
//!
//! A graph is stored as a `petgraph` graph of [`Node`]s with an edge from
//! every upstream node to each of its consumers. Edges never need to be
//! removed, so a node's `NodeIndex` doubles as its registration order.

mod node;
pub(crate) mod runner;

pub use crate::engine::node::{Arg, Handle, NodeKind};
pub(crate) use crate::engine::node::{Body, GraphId, Node};

pub(crate) type NodeGraph = petgraph::Graph<Node, ()>;
