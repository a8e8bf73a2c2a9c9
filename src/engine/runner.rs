use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Bfs, DfsPostOrder};

use crate::context::ExecutionContext;
use crate::core::{Args, Value};
use crate::engine::{Arg, Node, NodeGraph};
use crate::error::GraphError;

/// Source nodes in registration order.
pub(crate) fn source_nodes(graph: &NodeGraph) -> Vec<NodeIndex> {
    graph
        .node_indices()
        .filter(|&index| graph[index].is_source())
        .collect()
}

/// Every node downstream of `source`, excluding `source` itself.
pub(crate) fn reachable_from(graph: &NodeGraph, source: NodeIndex) -> HashSet<NodeIndex> {
    let mut reachable = HashSet::new();
    let mut bfs = Bfs::new(graph, source);

    while let Some(index) = bfs.next(graph) {
        if index != source {
            reachable.insert(index);
        }
    }

    reachable
}

/// Orders `source` and everything downstream of it so that each node comes
/// after all of its upstream nodes within that subgraph. The source is
/// always first.
///
/// This is the reversed depth-first postorder over downstream edges.
pub(crate) fn topological_order(graph: &NodeGraph, source: NodeIndex) -> Vec<NodeIndex> {
    let mut order = Vec::new();
    let mut dfs = DfsPostOrder::new(graph, source);

    while let Some(index) = dfs.next(graph) {
        order.push(index);
    }

    order.reverse();
    order
}

/// Rejects any node that a source reaches but whose inputs are not all fed
/// by that same source. Such a node would be missing an upstream output
/// when the source's values are propagated.
pub(crate) fn check_fan_in(graph: &NodeGraph, sources: &[NodeIndex]) -> Result<(), GraphError> {
    for &source in sources {
        let reachable = reachable_from(graph, source);

        for index in topological_order(graph, source) {
            if index == source {
                continue;
            }

            for upstream in graph.neighbors_directed(index, Direction::Incoming) {
                if upstream != source && !reachable.contains(&upstream) {
                    return Err(GraphError::UnsupportedFanIn {
                        task: graph[index].task_id.to_string(),
                        upstream: graph[upstream].task_id.to_string(),
                        origin: graph[source].task_id.to_string(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Drains one source, pushing each value it emits through the whole
/// downstream subgraph before pulling the next one. Returns the number of
/// values emitted.
pub(crate) fn propagate_from_source(
    graph: &NodeGraph,
    context: &ExecutionContext,
    source: NodeIndex,
) -> Result<usize, GraphError> {
    let node = &graph[source];

    let span = tracing::info_span!("source", task_id = %node.task_id);
    let _span = span.enter();

    let order = topological_order(graph, source);
    let reachable = reachable_from(graph, source);
    tracing::debug!(nodes = order.len(), "propagating from source");

    let mut count = 0;
    for value in node.generate(context)? {
        propagate_value(graph, context, source, value?, &order, &reachable)?;
        count += 1;
    }

    tracing::debug!(values = count, "source exhausted");
    Ok(count)
}

/// Runs every node in `order` once for a single value emitted by `source`.
pub(crate) fn propagate_value(
    graph: &NodeGraph,
    context: &ExecutionContext,
    source: NodeIndex,
    value: Value,
    order: &[NodeIndex],
    reachable: &HashSet<NodeIndex>,
) -> Result<(), GraphError> {
    let mut outputs = HashMap::with_capacity(order.len());
    outputs.insert(source, value);

    for &index in order {
        if index == source || !reachable.contains(&index) {
            continue;
        }

        let node = &graph[index];
        let args = resolve_args(node, &outputs)?;
        let output = node.execute_single(&args, context)?;
        outputs.insert(index, output);
    }

    Ok(())
}

fn resolve_args(node: &Node, outputs: &HashMap<NodeIndex, Value>) -> Result<Args, GraphError> {
    node.kwargs
        .iter()
        .map(|(name, arg)| {
            let value = match arg {
                Arg::Literal(value) => value.clone(),
                Arg::Node(handle) => outputs.get(&handle.index).cloned().ok_or_else(|| {
                    GraphError::MissingUpstreamOutput {
                        task_id: node.task_id.to_string(),
                        upstream: handle.task_id.to_string(),
                    }
                })?,
            };
            Ok((name.clone(), value))
        })
        .collect()
}
