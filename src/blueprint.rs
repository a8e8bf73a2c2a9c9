use std::borrow::Cow;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::TaskResult;
use crate::context::GraphContext;
use crate::core::{Args, GraphState, Output, State, TaskStates, Value};
use crate::engine::{Arg, Body, Handle, Node, NodeKind};
use crate::error::GraphError;
use crate::graph::{Graph, Hook};

/// Keyword arguments for a single task or source invocation.
///
/// Every node needs a `task_id`, unique within its graph. The remaining
/// arguments are either literal values handed to the body unchanged, or
/// [`Handle`]s of nodes declared earlier, which become upstream of the new
/// node.
///
/// ```rust
/// use taskgraph::{Graph, GraphContext, Kwargs, SourceFn, TaskFn, Output};
/// use serde_json::json;
///
/// let numbers = SourceFn::new("numbers", |_| Ok(Output::stream(0..3)));
/// let double = TaskFn::new("double", |args| Ok(json!(args.get_as::<i64>("value")? * 2)));
///
/// let scope = GraphContext::enter(Graph::new("doubling"));
/// let source = numbers.call(Kwargs::new().task_id("numbers")).unwrap();
/// double.call(Kwargs::new().task_id("double").node("value", &source)).unwrap();
/// let graph = scope.finish().unwrap();
///
/// assert_eq!(graph.node("double").unwrap().upstream(), vec!["numbers"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Kwargs {
    task_id: Option<String>,
    args: BTreeMap<String, Arg>,
}

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Adds a literal argument.
    pub fn value(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arg(name, Arg::Literal(value.into()))
    }

    /// Adds an argument resolved to the output of `handle` for each value.
    pub fn node(self, name: impl Into<String>, handle: &Handle) -> Self {
        self.arg(name, handle)
    }

    pub fn arg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.args.insert(name.into(), arg.into());
        self
    }
}

fn wrap<F, R>(body: F) -> Body
where
    F: Fn(&Args) -> TaskResult<R> + 'static,
    R: Into<Output>,
{
    Rc::new(move |args: &Args| -> TaskResult<Output> { body(args).map(Into::into) })
}

/// Registers a node built from `body` and `kwargs` into the innermost active
/// graph.
fn declare(
    kind: NodeKind,
    name: &Cow<'static, str>,
    body: &Body,
    kwargs: Kwargs,
) -> Result<Handle, GraphError> {
    let Kwargs { task_id, args } = kwargs;

    GraphContext::with_current(|graph| {
        let task_id = task_id.ok_or_else(|| GraphError::MissingIdentifier(name.clone()))?;
        graph.add_node(Node::new(kind, name.clone(), task_id, body.clone(), args))
    })
}

/// A reusable task body.
///
/// Each [`call`](Self::call) declares a new task node in the active graph.
/// The task runs once for every value that reaches it from upstream, with
/// its [`Handle`] arguments replaced by the outputs of those nodes.
#[derive(Clone)]
pub struct TaskFn {
    name: Cow<'static, str>,
    body: Body,
}

impl TaskFn {
    pub fn new<F, R>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: Fn(&Args) -> TaskResult<R> + 'static,
        R: Into<Output>,
    {
        Self {
            name: name.into(),
            body: wrap(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, kwargs: Kwargs) -> Result<Handle, GraphError> {
        declare(NodeKind::Task, &self.name, &self.body, kwargs)
    }
}

impl std::fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskFn").field(&self.name).finish()
    }
}

/// A reusable source body. The body must return [`Output::Stream`]; every
/// element it yields is propagated through the graph before the next one
/// is pulled.
#[derive(Clone)]
pub struct SourceFn {
    name: Cow<'static, str>,
    body: Body,
}

impl SourceFn {
    pub fn new<F, R>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: Fn(&Args) -> TaskResult<R> + 'static,
        R: Into<Output>,
    {
        Self {
            name: name.into(),
            body: wrap(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a source node. Sources accept literal arguments only.
    pub fn call(&self, kwargs: Kwargs) -> Result<Handle, GraphError> {
        declare(NodeKind::Source, &self.name, &self.body, kwargs)
    }
}

impl std::fmt::Debug for SourceFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceFn").field(&self.name).finish()
    }
}

/// A graph declaration.
///
/// The body declares tasks and sources with [`TaskFn::call`] and
/// [`SourceFn::call`]. Every [`call`](Self::call) evaluates the body against
/// a fresh [`Graph`] named after this builder, seeded with the configured
/// state and hooks, and returns it ready to execute.
///
/// ```rust
/// use taskgraph::{Args, GraphFn, Hook, Kwargs, Output, SourceFn};
///
/// let numbers = SourceFn::new("numbers", |args| {
///     let count = args.get_as::<i64>("count")?;
///     Ok(Output::stream(0..count))
/// });
///
/// let pipeline = GraphFn::new("pipeline", move |_| {
///     numbers.call(Kwargs::new().task_id("numbers").value("count", 3))?;
///     Ok(())
/// })
/// .on_execute_end(Hook::new("done", |graph| {
///     assert!(graph.graph_state().contains_key("numbers"));
///     Ok(())
/// }));
///
/// let mut graph = pipeline.call(Args::new()).unwrap();
/// graph.execute().unwrap();
/// ```
#[derive(Clone)]
pub struct GraphFn {
    name: Cow<'static, str>,
    body: Rc<dyn Fn(&Args) -> TaskResult<()>>,
    hooks: Vec<Hook>,
    state: GraphState,
}

impl GraphFn {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: Fn(&Args) -> TaskResult<()> + 'static,
    {
        Self {
            name: name.into(),
            body: Rc::new(body),
            hooks: Vec::new(),
            state: GraphState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a hook run after every successful execution of the graph.
    pub fn on_execute_end(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn on_execute_end_all(mut self, hooks: impl IntoIterator<Item = Hook>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    /// Initial per-task state of every graph built.
    pub fn graph_state(mut self, graph_state: TaskStates) -> Self {
        self.state.graph_state = graph_state;
        self
    }

    /// Initial shared state of every graph built.
    pub fn global_state(mut self, global_state: State) -> Self {
        self.state.global_state = global_state;
        self
    }

    pub fn state(mut self, state: GraphState) -> Self {
        self.state = state;
        self
    }

    /// Builds the graph with no call arguments.
    pub fn build(&self) -> Result<Graph, GraphError> {
        self.call(Args::new())
    }

    /// Builds the graph. `args` are merged into the shared state and passed
    /// to the body.
    ///
    /// The graph is only active while the body runs; it is popped from the
    /// [`GraphContext`] whether or not the body succeeds.
    pub fn call(&self, args: Args) -> Result<Graph, GraphError> {
        let mut graph = Graph::with_state(self.name.to_string(), self.state.clone());
        for hook in &self.hooks {
            graph.add_hook(hook.clone());
        }

        let shared: State = args.clone().into_iter().collect();
        graph.update_state(GraphState::new(TaskStates::new(), shared));

        let scope = GraphContext::enter(graph);
        let result = (self.body)(&args);
        let graph = scope.finish()?;

        match result {
            Ok(()) => {
                tracing::debug!(graph = %self.name, nodes = graph.len(), "graph declared");
                Ok(graph)
            }
            Err(err) => Err(match err.downcast::<GraphError>() {
                Ok(err) => err,
                Err(err) => GraphError::Declaration(self.name.to_string(), err),
            }),
        }
    }
}

impl std::fmt::Debug for GraphFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFn")
            .field("name", &self.name)
            .field("hooks", &self.hooks)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
