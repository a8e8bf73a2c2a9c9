use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::GraphError;
use crate::graph::Graph;

thread_local! {
    static ACTIVE: RefCell<Vec<Graph>> = const { RefCell::new(Vec::new()) };
}

/// The stack of graphs currently being declared on this thread.
///
/// A graph is moved onto the stack by [`GraphContext::enter`] and moved back
/// out by [`ActiveGraph::finish`]. While it sits on the stack, builders such
/// as [`TaskFn::call`](crate::TaskFn::call) register their nodes into it.
///
/// ```rust
/// use taskgraph::{Graph, GraphContext};
///
/// let scope = GraphContext::enter(Graph::new("outer"));
/// assert_eq!(GraphContext::current_name().unwrap(), "outer");
///
/// let graph = scope.finish().unwrap();
/// assert!(!GraphContext::is_active());
/// assert_eq!(graph.name(), "outer");
/// ```
pub struct GraphContext;

impl GraphContext {
    /// Pushes `graph` onto the stack and makes it the target of node
    /// registration until the returned guard is finished or dropped.
    pub fn enter(graph: Graph) -> ActiveGraph {
        tracing::trace!(graph = graph.name(), "entering graph context");

        let depth = ACTIVE.with_borrow_mut(|stack| {
            stack.push(graph);
            stack.len()
        });

        ActiveGraph {
            depth,
            done: false,
            _local: PhantomData,
        }
    }

    pub fn is_active() -> bool {
        Self::depth() > 0
    }

    /// Number of graphs currently on the stack.
    pub fn depth() -> usize {
        ACTIVE.with_borrow(Vec::len)
    }

    /// Name of the innermost active graph.
    pub fn current_name() -> Result<String, GraphError> {
        ACTIVE.with_borrow(|stack| {
            stack
                .last()
                .map(|graph| graph.name().to_string())
                .ok_or(GraphError::NoActiveGraph)
        })
    }

    /// Runs `f` against the innermost active graph.
    ///
    /// `f` must not call back into user code: the stack stays borrowed for
    /// the duration of the call.
    pub(crate) fn with_current<R>(
        f: impl FnOnce(&mut Graph) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        ACTIVE.with_borrow_mut(|stack| match stack.last_mut() {
            Some(graph) => f(graph),
            None => Err(GraphError::NoActiveGraph),
        })
    }
}

/// Guard returned by [`GraphContext::enter`].
///
/// Dropping the guard without calling [`finish`](Self::finish) pops the graph
/// and discards it.
#[must_use = "dropping the guard immediately pops the graph"]
pub struct ActiveGraph {
    depth: usize,
    done: bool,
    _local: PhantomData<*const ()>,
}

impl ActiveGraph {
    /// Pops the graph off the stack and returns it.
    ///
    /// Any graphs entered after this one and never popped are discarded too.
    pub fn finish(mut self) -> Result<Graph, GraphError> {
        self.done = true;
        self.take().ok_or(GraphError::NoActiveGraph)
    }

    fn take(&mut self) -> Option<Graph> {
        let depth = self.depth;

        let (graph, stale) = ACTIVE.with_borrow_mut(|stack| {
            if stack.len() < depth {
                return (None, Vec::new());
            }
            let stale = stack.split_off(depth);
            (stack.pop(), stale)
        });

        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "discarding graphs left on the stack");
        }
        drop(stale);

        graph
    }
}

impl Drop for ActiveGraph {
    fn drop(&mut self) {
        if !self.done {
            let graph = self.take();
            drop(graph);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_current() {
        let scope = GraphContext::enter(Graph::new("test"));
        assert_eq!(GraphContext::current_name().unwrap(), "test");

        let graph = scope.finish().unwrap();
        assert_eq!(graph.name(), "test");
        assert!(!GraphContext::is_active());
    }

    #[test]
    fn test_finish_restores_previous() {
        let outer = GraphContext::enter(Graph::new("test1"));
        let inner = GraphContext::enter(Graph::new("test2"));

        assert_eq!(GraphContext::current_name().unwrap(), "test2");
        inner.finish().unwrap();
        assert_eq!(GraphContext::current_name().unwrap(), "test1");
        outer.finish().unwrap();
        assert_eq!(GraphContext::depth(), 0);
    }

    #[test]
    fn test_current_without_context() {
        assert!(matches!(
            GraphContext::current_name(),
            Err(GraphError::NoActiveGraph)
        ));
        assert!(matches!(
            GraphContext::with_current(|_| Ok(())),
            Err(GraphError::NoActiveGraph)
        ));
    }

    #[test]
    fn test_drop_pops_graph() {
        {
            let _scope = GraphContext::enter(Graph::new("dropped"));
            assert!(GraphContext::is_active());
        }
        assert!(!GraphContext::is_active());
    }

    #[test]
    fn test_pop_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _scope = GraphContext::enter(Graph::new("panicking"));
            panic!("declaration failed");
        });

        assert!(result.is_err());
        assert_eq!(GraphContext::depth(), 0);
    }

    #[test]
    fn test_outer_finish_discards_leaked_inner() {
        let outer = GraphContext::enter(Graph::new("outer"));
        std::mem::forget(GraphContext::enter(Graph::new("leaked")));
        assert_eq!(GraphContext::depth(), 2);

        let graph = outer.finish().unwrap();
        assert_eq!(graph.name(), "outer");
        assert_eq!(GraphContext::depth(), 0);
    }
}
