use std::borrow::Cow;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::TaskResult;
use crate::context::{ExecutionContext, ExecutionScope};
use crate::core::{Args, Output, Stream, Value};
use crate::error::GraphError;

/// Type-erased node body shared by every node created from the same builder.
pub(crate) type Body = Rc<dyn Fn(&Args) -> TaskResult<Output>>;

/// Whether a node is driven by its upstream values or drives propagation
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Task,
    Source,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Task => "task",
            NodeKind::Source => "source",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a graph, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GraphId(u64);

impl GraphId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A lightweight reference to a node registered in a graph.
///
/// Handles are what the task and source builders return. Passing one as an
/// argument to another builder wires the two nodes together: the referenced
/// node becomes upstream of the new one, and its output for each propagated
/// value is substituted for the argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) graph: GraphId,
    pub(crate) index: NodeIndex,
    pub(crate) task_id: Arc<str>,
}

impl Handle {
    pub(crate) fn new(graph: GraphId, index: NodeIndex, task_id: Arc<str>) -> Self {
        Self {
            graph,
            index,
            task_id,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns the underlying `NodeIndex` of the node in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

/// A declared keyword argument: either a literal value passed through as-is
/// or a reference to an upstream node.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Node(Handle),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Literal(value)
    }
}

impl From<Handle> for Arg {
    fn from(handle: Handle) -> Self {
        Arg::Node(handle)
    }
}

impl From<&Handle> for Arg {
    fn from(handle: &Handle) -> Self {
        Arg::Node(handle.clone())
    }
}

pub(crate) struct Node {
    pub name: Cow<'static, str>,
    pub task_id: Arc<str>,
    pub kind: NodeKind,
    pub kwargs: BTreeMap<String, Arg>,
    body: Body,
}

impl Node {
    pub(crate) fn new(
        kind: NodeKind,
        name: Cow<'static, str>,
        task_id: impl Into<Arc<str>>,
        body: Body,
        kwargs: BTreeMap<String, Arg>,
    ) -> Self {
        Self {
            name,
            task_id: task_id.into(),
            kind,
            kwargs,
            body,
        }
    }

    pub(crate) fn is_source(&self) -> bool {
        self.kind == NodeKind::Source
    }

    /// Arguments that reference other nodes.
    pub(crate) fn upstream_args(&self) -> impl Iterator<Item = (&str, &Handle)> {
        self.kwargs.iter().filter_map(|(name, arg)| match arg {
            Arg::Node(handle) => Some((name.as_str(), handle)),
            Arg::Literal(_) => None,
        })
    }

    /// Arguments passed through unchanged; for a source these are all of
    /// its arguments.
    pub(crate) fn literal_args(&self) -> Args {
        self.kwargs
            .iter()
            .filter_map(|(name, arg)| match arg {
                Arg::Literal(value) => Some((name.clone(), value.clone())),
                Arg::Node(_) => None,
            })
            .collect()
    }

    fn fail(&self, err: anyhow::Error) -> GraphError {
        tracing::error!(task_id = %self.task_id, "node failed: {err:#}");
        GraphError::Task(self.task_id.to_string(), err)
    }

    /// Runs the body once with already resolved arguments.
    ///
    /// A body returning a stream has it drained while the context is still
    /// active, and the collected elements are recorded as an array.
    pub(crate) fn execute_single(
        &self,
        args: &Args,
        context: &ExecutionContext,
    ) -> Result<Value, GraphError> {
        let span = tracing::debug_span!("task", task_id = %self.task_id);
        let _span = span.enter();
        let _scope = context.enter(self.task_id.clone());

        match (self.body)(args).map_err(|e| self.fail(e))? {
            Output::Value(value) => Ok(value),
            Output::Stream(stream) => stream
                .collect::<anyhow::Result<Vec<_>>>()
                .map(Value::Array)
                .map_err(|e| self.fail(e)),
        }
    }

    /// Invokes a source body and returns its stream of values, with the
    /// source's context held active until the stream is dropped.
    pub(crate) fn generate(&self, context: &ExecutionContext) -> Result<Generated<'_>, GraphError> {
        let scope = context.enter(self.task_id.clone());

        match (self.body)(&self.literal_args()).map_err(|e| self.fail(e))? {
            Output::Stream(stream) => Ok(Generated {
                node: self,
                stream,
                _scope: scope,
            }),
            Output::Value(_) => Err(GraphError::InvalidSourceResult(self.task_id.to_string())),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}

/// Values pulled from a running source. Each pull happens inside the
/// source's execution context.
pub(crate) struct Generated<'a> {
    node: &'a Node,
    stream: Stream,
    _scope: ExecutionScope,
}

impl Iterator for Generated<'_> {
    type Item = Result<Value, GraphError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream
            .next()
            .map(|item| item.map_err(|e| self.node.fail(e)))
    }
}
