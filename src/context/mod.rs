//! Dynamically scoped state used while a graph is declared and executed.
//!
//! Two independent stacks live here, both confined to the current thread:
//!
//! * [`GraphContext`] holds the graphs whose declaration body is currently
//!   running. Task and source builders register their nodes into the
//!   innermost one.
//! * The execution stack holds one frame per node body currently running.
//!   The free functions of this module ([`current_task_id`],
//!   [`with_task_state`], [`read_shared`], [`write_shared`], ...) read the
//!   innermost frame and fail with [`ContextError::Unavailable`] when no
//!   node is running.
//!
//! Every push hands out a guard ([`ActiveGraph`], [`ExecutionScope`]) which
//! pops the stack when dropped, so a failing or panicking body never leaves
//! a stale entry behind.
//!
//! [`ContextError::Unavailable`]: crate::ContextError::Unavailable

mod graph;
mod task;

pub use graph::{ActiveGraph, GraphContext};
pub use task::{
    ExecutionContext, ExecutionScope, current_task_id, read_shared, read_shared_or, shared_state,
    task_state, with_shared_state, with_task_state, write_shared,
};
