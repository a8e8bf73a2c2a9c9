#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
pub mod context;
mod core;
mod diagram;
mod engine;
mod error;
mod graph;
mod utils;

pub use crate::blueprint::{GraphFn, Kwargs, SourceFn, TaskFn};
pub use crate::context::{ExecutionContext, GraphContext};
pub use crate::core::{Args, GraphState, Output, State, Stream, TaskStates, Value};
pub use crate::diagram::{Description, EdgeDescription, Graphviz, NodeDescription};
pub use crate::engine::{Arg, Handle, NodeKind};
pub use crate::error::{ContextError, GraphError, RuntimeError};
pub use crate::graph::{Graph, Hook, NodeView};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// Result type returned by task, source, graph and hook bodies.
pub type TaskResult<T> = anyhow::Result<T>;
