use std::fmt;

use serde::Serialize;

use crate::engine::NodeKind;
use crate::graph::Graph;

/// Structured description of a graph's shape, with nodes and edges sorted by
/// task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Description {
    pub graph: String,
    pub nodes: Vec<NodeDescription>,
    pub edges: Vec<EdgeDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EdgeDescription {
    pub from: String,
    pub to: String,
}

fn quote(id: &str) -> String {
    id.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Graph {
    pub fn description(&self) -> Description {
        let mut nodes: Vec<_> = self
            .nodes()
            .map(|view| NodeDescription {
                id: view.task_id().to_string(),
                kind: view.kind(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<_> = self
            .nodes
            .raw_edges()
            .iter()
            .map(|edge| EdgeDescription {
                from: self.nodes[edge.source()].task_id.to_string(),
                to: self.nodes[edge.target()].task_id.to_string(),
            })
            .collect();
        edges.sort();

        Description {
            graph: self.name().to_string(),
            nodes,
            edges,
        }
    }

    /// Serializes [`description`](Self::description) as JSON.
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        let description = self.description();
        if pretty {
            serde_json::to_string_pretty(&description)
        } else {
            serde_json::to_string(&description)
        }
    }

    /// Renders the graph in graphviz `dot` syntax.
    pub fn to_graphviz(&self) -> String {
        self.graphviz().to_string()
    }

    /// A `Display` adapter rendering the graph in graphviz `dot` syntax.
    pub fn graphviz(&self) -> Graphviz<'_> {
        Graphviz(self)
    }
}

/// Graphviz `dot` rendering of a [`Graph`]. Each node is labelled with its
/// kind and sources are drawn as boxes.
pub struct Graphviz<'a>(&'a Graph);

impl fmt::Display for Graphviz<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.0.description();

        writeln!(f, "digraph \"{}\" {{", quote(&description.graph))?;

        for node in &description.nodes {
            let id = quote(&node.id);
            match node.kind {
                NodeKind::Source => {
                    writeln!(f, r#"  "{id}" [label="{id}\n({})", shape=box];"#, node.kind)?
                }
                NodeKind::Task => writeln!(f, r#"  "{id}" [label="{id}\n({})"];"#, node.kind)?,
            }
        }

        for edge in &description.edges {
            writeln!(f, r#"  "{}" -> "{}";"#, quote(&edge.from), quote(&edge.to))?;
        }

        write!(f, "}}")
    }
}

/// Mermaid flowchart of the graph, nodes in registration order.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for view in self.nodes() {
            let name = view.task_id().replace('"', "#quot;");
            match view.kind() {
                NodeKind::Source => writeln!(f, "    {}[(\"{}\")]", view.index().index(), name)?,
                NodeKind::Task => writeln!(f, "    {}[\"{}\"]", view.index().index(), name)?,
            }
        }

        for edge in self.nodes.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Args, Output};
    use crate::engine::{Arg, Body, Node};
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn sample() -> Graph {
        let body: Body = Rc::new(|_: &Args| Ok(Output::stream([1])));
        let mut graph = Graph::new("sample");

        let source = graph
            .add_node(Node::new(NodeKind::Source, "numbers".into(), "source", body.clone(), BTreeMap::new()))
            .unwrap();

        for task_id in ["zeta", "alpha"] {
            let mut kwargs = BTreeMap::new();
            kwargs.insert("value".to_string(), Arg::from(&source));
            graph
                .add_node(Node::new(NodeKind::Task, "task".into(), task_id, body.clone(), kwargs))
                .unwrap();
        }

        graph
    }

    #[test]
    fn test_description_is_sorted() {
        let description = sample().description();

        let ids: Vec<_> = description.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "source", "zeta"]);
        assert_eq!(description.nodes[1].kind, NodeKind::Source);
        assert_eq!(
            description.edges,
            vec![
                EdgeDescription { from: "source".into(), to: "alpha".into() },
                EdgeDescription { from: "source".into(), to: "zeta".into() },
            ]
        );
    }

    #[test]
    fn test_to_json() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json(false).unwrap()).unwrap();

        assert_eq!(json["graph"], "sample");
        assert_eq!(json["nodes"][0], serde_json::json!({"id": "alpha", "type": "task"}));
        assert_eq!(json["nodes"][1]["type"], "source");
        assert_eq!(json["edges"][0], serde_json::json!({"from": "source", "to": "alpha"}));

        assert!(sample().to_json(true).unwrap().contains('\n'));
    }

    #[test]
    fn test_to_graphviz() {
        let dot = sample().to_graphviz();

        assert!(dot.starts_with("digraph \"sample\" {\n"));
        assert!(dot.contains(r#"  "source" [label="source\n(source)", shape=box];"#));
        assert!(dot.contains(r#"  "alpha" [label="alpha\n(task)"];"#));
        assert!(dot.contains(r#"  "source" -> "zeta";"#));
        assert!(dot.ends_with('}'));
    }

    #[test]
    fn test_to_graphviz_quotes_graph_name() {
        let graph = Graph::new("my pipeline-v2");
        let dot = graph.to_graphviz();

        assert_eq!(dot, "digraph \"my pipeline-v2\" {\n}");
        assert_eq!(graph.graphviz().to_string(), dot);

        let graph = Graph::new(r#"say "hi""#);
        assert!(graph.to_graphviz().starts_with(r#"digraph "say \"hi\"" {"#));
    }

    #[test]
    fn test_mermaid() {
        let mermaid = sample().to_string();

        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("    0[(\"source\")]"));
        assert!(mermaid.contains("    1[\"zeta\"]"));
        assert!(mermaid.contains("    0 --> 2"));
    }
}
