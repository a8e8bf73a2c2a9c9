use std::borrow::Cow;
use std::cell::Ref;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use crate::TaskResult;
use crate::context::ExecutionContext;
use crate::core::{GraphState, State, TaskStates};
use crate::engine::runner;
use crate::engine::{GraphId, Handle, Node, NodeGraph, NodeKind};
use crate::error::{ContextError, GraphError};

type HookFn = dyn Fn(&Graph) -> TaskResult<()>;

/// A named callback run once every source of a graph has been drained.
///
/// Hooks run after all node bodies have returned, so the task-scoped
/// accessors of [`context`](crate::context) are unavailable inside them.
/// The final state is read through the `&Graph` argument instead.
#[derive(Clone)]
pub struct Hook {
    name: Cow<'static, str>,
    callback: Rc<HookFn>,
}

impl Hook {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, callback: F) -> Self
    where
        F: Fn(&Graph) -> TaskResult<()> + 'static,
    {
        Self {
            name: name.into(),
            callback: Rc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &Graph) -> Result<(), GraphError> {
        tracing::debug!(hook = %self.name, "running hook");
        (self.callback)(graph).map_err(|err| hook_error(&self.name, err))
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Hook").field(&self.name).finish()
    }
}

/// Reading task context from a hook gets a dedicated error pointing at the
/// graph argument. A `GraphError` raised by the hook is passed on as is.
fn hook_error(name: &str, err: anyhow::Error) -> GraphError {
    if matches!(
        err.downcast_ref::<ContextError>(),
        Some(ContextError::Unavailable)
    ) {
        return GraphError::HookContext(name.to_string());
    }

    match err.downcast::<GraphError>() {
        Ok(GraphError::Context(ContextError::Unavailable)) => {
            GraphError::HookContext(name.to_string())
        }
        Ok(err) => err,
        Err(err) => GraphError::Hook(name.to_string(), err),
    }
}

/// An executable graph of tasks and sources.
///
/// A `Graph` owns its nodes, the state each task accumulates, the state
/// shared by all of its tasks, and the hooks run when execution ends. Nodes
/// are normally added through [`TaskFn`](crate::TaskFn) and
/// [`SourceFn`](crate::SourceFn) while the graph is active in the
/// [`GraphContext`](crate::GraphContext); a [`GraphFn`](crate::GraphFn)
/// takes care of entering and leaving that context.
pub struct Graph {
    id: GraphId,
    name: String,
    pub(crate) nodes: NodeGraph,
    ids: HashMap<Arc<str>, NodeIndex>,
    context: ExecutionContext,
    hooks: Vec<Hook>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name, GraphState::default())
    }

    /// Creates an empty graph whose state maps are seeded from `state`.
    pub fn with_state(name: impl Into<String>, state: GraphState) -> Self {
        Self {
            id: GraphId::next(),
            name: name.into(),
            nodes: NodeGraph::new(),
            ids: HashMap::new(),
            context: ExecutionContext::new(state.graph_state, state.global_state),
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.node_count() == 0
    }

    /// Registers a node and wires an edge from each node it references.
    pub(crate) fn add_node(&mut self, node: Node) -> Result<Handle, GraphError> {
        if self.ids.contains_key(&node.task_id) {
            return Err(GraphError::DuplicateIdentifier {
                task_id: node.task_id.to_string(),
                graph: self.name.clone(),
            });
        }

        let mut upstream = Vec::new();
        for (arg, handle) in node.upstream_args() {
            let known = handle.graph == self.id
                && self
                    .nodes
                    .node_weight(handle.index)
                    .is_some_and(|existing| existing.task_id == handle.task_id);

            if !known {
                return Err(GraphError::UnknownNode(handle.task_id.to_string()));
            }

            if node.is_source() {
                return Err(GraphError::SourceWithUpstream {
                    task_id: node.task_id.to_string(),
                    arg: arg.to_string(),
                    upstream: handle.task_id.to_string(),
                });
            }

            upstream.push(handle.index);
        }

        tracing::debug!(
            graph = %self.name,
            task_id = %node.task_id,
            kind = %node.kind,
            "registering node"
        );

        let task_id = node.task_id.clone();
        let index = self.nodes.add_node(node);

        for dependency in upstream {
            self.nodes.update_edge(dependency, index, ());
        }

        self.ids.insert(task_id.clone(), index);
        Ok(Handle::new(self.id, index, task_id))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.ids.contains_key(task_id)
    }

    pub fn node(&self, task_id: &str) -> Option<NodeView<'_>> {
        self.ids.get(task_id).map(|&index| NodeView {
            graph: &self.nodes,
            index,
        })
    }

    /// All nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeView<'_>> {
        self.nodes.node_indices().map(|index| NodeView {
            graph: &self.nodes,
            index,
        })
    }

    /// Task ids of the source nodes, in registration order.
    pub fn source_ids(&self) -> Vec<&str> {
        runner::source_nodes(&self.nodes)
            .into_iter()
            .map(|index| &*self.nodes[index].task_id)
            .collect()
    }

    pub fn add_hook(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    /// Removes the first hook registered under `name`. Returns whether one
    /// was found.
    pub fn remove_hook(&mut self, name: &str) -> bool {
        match self.hooks.iter().position(|hook| hook.name == name) {
            Some(position) => {
                self.hooks.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn clear_hooks(&mut self) {
        self.hooks.clear();
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(Hook::name).collect()
    }

    /// Per-task state, keyed by `task_id`.
    pub fn graph_state(&self) -> Ref<'_, TaskStates> {
        self.context.task_states()
    }

    /// State shared by every node of the graph.
    pub fn global_state(&self) -> Ref<'_, State> {
        self.context.shared()
    }

    /// Copy of the state accumulated by a single task.
    pub fn task_state(&self, task_id: &str) -> Option<State> {
        self.context.task_states().get(task_id).cloned()
    }

    /// Snapshot of both state maps.
    pub fn state(&self) -> GraphState {
        GraphState::new(
            self.context.task_states().clone(),
            self.context.shared().clone(),
        )
    }

    /// Replaces both state maps.
    pub fn set_state(&mut self, state: GraphState) {
        self.context.replace(state.graph_state, state.global_state);
    }

    /// Merges `state` into the current maps; entries present in `state`
    /// overwrite existing ones.
    pub fn update_state(&mut self, state: GraphState) {
        self.context.extend(state.graph_state, state.global_state);
    }

    /// Drains every source in registration order, propagating each emitted
    /// value through the nodes downstream of it, then runs the hooks.
    ///
    /// The first failing node aborts execution. State written before the
    /// failure is kept and hooks are not run.
    pub fn execute(&mut self) -> Result<(), GraphError> {
        let span = tracing::info_span!("execute", graph = %self.name);
        let _span = span.enter();

        let sources = runner::source_nodes(&self.nodes);
        if sources.is_empty() {
            return Err(GraphError::NoSourceNodes);
        }

        runner::check_fan_in(&self.nodes, &sources)?;

        let start = Instant::now();
        let mut emitted = 0;
        for source in sources {
            emitted += runner::propagate_from_source(&self.nodes, &self.context, source)?;
        }

        tracing::info!(
            values = emitted,
            "finished in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        for hook in &self.hooks {
            hook.run(self)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.node_count())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a registered node.
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    graph: &'a NodeGraph,
    index: NodeIndex,
}

impl<'a> NodeView<'a> {
    /// Name of the builder that created the node.
    pub fn name(&self) -> &'a str {
        &self.graph[self.index].name
    }

    pub fn task_id(&self) -> &'a str {
        &self.graph[self.index].task_id
    }

    pub fn kind(&self) -> NodeKind {
        self.graph[self.index].kind
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Task ids of the nodes this one reads from, sorted.
    pub fn upstream(&self) -> Vec<&'a str> {
        self.neighbors(Direction::Incoming)
    }

    /// Task ids of the nodes reading from this one, sorted.
    pub fn downstream(&self) -> Vec<&'a str> {
        self.neighbors(Direction::Outgoing)
    }

    fn neighbors(&self, direction: Direction) -> Vec<&'a str> {
        let graph = self.graph;
        let mut ids: Vec<&'a str> = graph
            .neighbors_directed(self.index, direction)
            .map(|index| &*graph[index].task_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for NodeView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeView")
            .field("task_id", &self.task_id())
            .field("kind", &self.kind())
            .finish()
    }
}
