use std::cell::{Ref, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::core::{State, TaskStates, Value};
use crate::error::ContextError;

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone)]
struct Frame {
    task_id: Arc<str>,
    context: ExecutionContext,
}

/// The state a graph exposes to its running nodes: the per-task state map
/// and the shared state map.
///
/// A graph owns exactly one `ExecutionContext`. Cloning it is cheap and
/// yields another handle to the same maps. Calling [`enter`](Self::enter)
/// makes the maps visible to the accessor functions of
/// [`context`](crate::context) until the returned scope is dropped.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    tasks: Rc<RefCell<TaskStates>>,
    shared: Rc<RefCell<State>>,
}

impl ExecutionContext {
    pub fn new(graph_state: TaskStates, global_state: State) -> Self {
        Self {
            tasks: Rc::new(RefCell::new(graph_state)),
            shared: Rc::new(RefCell::new(global_state)),
        }
    }

    /// Activates this context for `task_id`, creating the task's state entry
    /// if absent. The previous frame becomes visible again once the returned
    /// scope is dropped.
    pub fn enter(&self, task_id: impl Into<Arc<str>>) -> ExecutionScope {
        let task_id = task_id.into();

        if let Ok(mut tasks) = self.tasks.try_borrow_mut() {
            tasks.entry(task_id.to_string()).or_default();
        }

        let depth = FRAMES.with_borrow_mut(|frames| {
            frames.push(Frame {
                task_id,
                context: self.clone(),
            });
            frames.len()
        });

        ExecutionScope {
            depth,
            _local: PhantomData,
        }
    }

    /// Whether any node body is currently running on this thread.
    pub fn is_active() -> bool {
        FRAMES.with_borrow(|frames| !frames.is_empty())
    }

    pub fn task_states(&self) -> Ref<'_, TaskStates> {
        self.tasks.borrow()
    }

    pub fn shared(&self) -> Ref<'_, State> {
        self.shared.borrow()
    }

    pub(crate) fn replace(&self, graph_state: TaskStates, global_state: State) {
        *self.tasks.borrow_mut() = graph_state;
        *self.shared.borrow_mut() = global_state;
    }

    pub(crate) fn extend(&self, graph_state: TaskStates, global_state: State) {
        self.tasks.borrow_mut().extend(graph_state);
        self.shared.borrow_mut().extend(global_state);
    }
}

/// Guard returned by [`ExecutionContext::enter`]; pops the frame on drop.
#[must_use = "dropping the scope immediately deactivates the context"]
pub struct ExecutionScope {
    depth: usize,
    _local: PhantomData<*const ()>,
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        let stale = FRAMES.with_borrow_mut(|frames| {
            let at = (self.depth - 1).min(frames.len());
            frames.split_off(at)
        });
        drop(stale);
    }
}

fn current() -> Result<Frame, ContextError> {
    FRAMES
        .with_borrow(|frames| frames.last().cloned())
        .ok_or(ContextError::Unavailable)
}

/// The `task_id` of the node whose body is running.
pub fn current_task_id() -> Result<Arc<str>, ContextError> {
    current().map(|frame| frame.task_id)
}

/// Runs `f` with mutable access to the running node's own state.
///
/// The state persists across every invocation of the same node, so it can
/// be used to accumulate values over a stream:
///
/// ```rust,no_run
/// # use taskgraph::{context, TaskFn};
/// # use serde_json::json;
/// let running_sum = TaskFn::new("running_sum", |args| {
///     let number = args.get_as::<i64>("number")?;
///     let total = context::with_task_state(|state| {
///         let total = state.get("total").and_then(|v| v.as_i64()).unwrap_or(0) + number;
///         state.insert("total".into(), json!(total));
///         total
///     })?;
///     Ok(json!(total))
/// });
/// ```
pub fn with_task_state<R>(f: impl FnOnce(&mut State) -> R) -> Result<R, ContextError> {
    let frame = current()?;
    let mut tasks = frame
        .context
        .tasks
        .try_borrow_mut()
        .map_err(|_| ContextError::StateBusy("task_state"))?;

    Ok(f(tasks.entry(frame.task_id.to_string()).or_default()))
}

/// Snapshot of the running node's own state.
pub fn task_state() -> Result<State, ContextError> {
    with_task_state(|state| state.clone())
}

/// Runs `f` with mutable access to the state shared by every node of the
/// graph.
pub fn with_shared_state<R>(f: impl FnOnce(&mut State) -> R) -> Result<R, ContextError> {
    let frame = current()?;
    let mut shared = frame
        .context
        .shared
        .try_borrow_mut()
        .map_err(|_| ContextError::StateBusy("global_state"))?;

    Ok(f(&mut shared))
}

/// Snapshot of the shared state.
pub fn shared_state() -> Result<State, ContextError> {
    with_shared_state(|state| state.clone())
}

/// Reads a single key from the shared state.
pub fn read_shared(key: &str) -> Result<Option<Value>, ContextError> {
    with_shared_state(|state| state.get(key).cloned())
}

/// Reads a single key from the shared state, falling back to `default`.
pub fn read_shared_or(key: &str, default: impl Into<Value>) -> Result<Value, ContextError> {
    Ok(read_shared(key)?.unwrap_or_else(|| default.into()))
}

/// Writes a single key into the shared state and checks that the stored
/// value reads back unchanged.
pub fn write_shared(key: impl Into<String>, value: impl Into<Value>) -> Result<(), ContextError> {
    let key = key.into();
    let value = value.into();

    with_shared_state(|state| {
        state.insert(key.clone(), value.clone());

        match state.get(&key) {
            Some(stored) if *stored == value => Ok(()),
            _ => Err(ContextError::WriteRejected {
                key,
                value: value.to_string(),
            }),
        }
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> State {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_enter_exposes_frame() {
        let mut tasks = TaskStates::new();
        tasks.insert("test_id".into(), state(json!({"task_key": "task_value"})));
        let context = ExecutionContext::new(tasks, state(json!({"global_key": "global_value"})));

        let _scope = context.enter("test_id");

        assert_eq!(&*current_task_id().unwrap(), "test_id");
        assert_eq!(task_state().unwrap()["task_key"], json!("task_value"));
        assert_eq!(read_shared("global_key").unwrap(), Some(json!("global_value")));
    }

    #[test]
    fn test_scope_cleans_up() {
        let context = ExecutionContext::default();
        {
            let _scope = context.enter("test_id");
            assert!(ExecutionContext::is_active());
        }

        assert!(!ExecutionContext::is_active());
        assert_eq!(current_task_id(), Err(ContextError::Unavailable));
    }

    #[test]
    fn test_accessors_without_context() {
        assert_eq!(current_task_id(), Err(ContextError::Unavailable));
        assert_eq!(task_state(), Err(ContextError::Unavailable));
        assert_eq!(shared_state(), Err(ContextError::Unavailable));
        assert_eq!(write_shared("key", 1), Err(ContextError::Unavailable));
    }

    #[test]
    fn test_nested_scopes_restore_outer() {
        let first = ExecutionContext::new(TaskStates::new(), state(json!({"global1": "value1"})));
        let second = ExecutionContext::new(TaskStates::new(), state(json!({"global2": "value2"})));

        let _outer = first.enter("test1");
        with_task_state(|s| s.insert("task1".into(), json!("value1"))).unwrap();
        {
            let _inner = second.enter("test2");
            assert_eq!(&*current_task_id().unwrap(), "test2");
            assert!(task_state().unwrap().is_empty());
            assert_eq!(read_shared("global1").unwrap(), None);
        }

        assert_eq!(&*current_task_id().unwrap(), "test1");
        assert_eq!(task_state().unwrap()["task1"], json!("value1"));
        assert_eq!(read_shared("global1").unwrap(), Some(json!("value1")));
    }

    #[test]
    fn test_enter_creates_task_entry() {
        let context = ExecutionContext::default();
        let _scope = context.enter("fresh");
        assert!(context.task_states().contains_key("fresh"));
    }

    #[test]
    fn test_shared_state_is_same_map() {
        let context = ExecutionContext::default();
        {
            let _scope = context.enter("writer");
            write_shared("new_key", "new_value").unwrap();
        }
        assert_eq!(context.shared()["new_key"], json!("new_value"));
    }

    #[test]
    fn test_read_shared_default() {
        let shared = state(json!({"existing_key": "existing_value"}));
        let context = ExecutionContext::new(TaskStates::new(), shared);
        let _scope = context.enter("reader");

        let existing = read_shared_or("existing_key", "default").unwrap();
        assert_eq!(existing, json!("existing_value"));
        let missing = read_shared_or("missing_key", "default").unwrap();
        assert_eq!(missing, json!("default"));
        assert_eq!(read_shared("missing_key").unwrap(), None);
    }

    #[test]
    fn test_nested_state_borrow_is_reported() {
        let context = ExecutionContext::default();
        let _scope = context.enter("busy");

        let inner = with_task_state(|_| task_state()).unwrap();
        assert_eq!(inner, Err(ContextError::StateBusy("task_state")));
    }

    #[test]
    fn test_write_rejected_message() {
        let err = ContextError::WriteRejected {
            key: "key".into(),
            value: "\"value\"".into(),
        };
        assert_eq!(err.to_string(), "Failed to set global state: key=\"value\"");
    }
}
