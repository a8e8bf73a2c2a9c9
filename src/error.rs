use std::borrow::Cow;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' requires a 'task_id' argument.")]
    MissingIdentifier(Cow<'static, str>),

    #[error("Duplicate task_id '{task_id}' detected in graph '{graph}'")]
    DuplicateIdentifier { task_id: String, graph: String },

    #[error("No active graph context.")]
    NoActiveGraph,

    #[error("Source '{task_id}' cannot depend on node '{upstream}' (argument '{arg}')")]
    SourceWithUpstream {
        task_id: String,
        arg: String,
        upstream: String,
    },

    #[error("Node '{0}' does not belong to the active graph")]
    UnknownNode(String),

    #[error("Graph has no source nodes")]
    NoSourceNodes,

    #[error("Source '{0}' must return a stream of values")]
    InvalidSourceResult(String),

    #[error("Missing output of upstream node '{upstream}' while running '{task_id}'")]
    MissingUpstreamOutput { task_id: String, upstream: String },

    #[error(
        "Task '{task}' reached from source '{origin}' also depends on '{upstream}', \
         which that source does not feed; joining separate sources is not supported"
    )]
    UnsupportedFanIn {
        task: String,
        upstream: String,
        origin: String,
    },

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error(
        "Task context was accessed inside the hook '{0}'. \
         However, the graph instance parameter can be used to access context directly."
    )]
    HookContext(String),

    #[error("Hook '{0}':\n{1}")]
    Hook(String, anyhow::Error),

    #[error("Graph '{0}':\n{1}")]
    Declaration(String, anyhow::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl GraphError {
    /// Task id of the node that failed, if the error originated in a node body.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            GraphError::Task(task_id, _) => Some(task_id),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("No active task context")]
    Unavailable,

    #[error("Task context state '{0}' is already borrowed")]
    StateBusy(&'static str),

    #[error("Failed to set global state: {key}={value}")]
    WriteRejected { key: String, value: String },
}
