use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A dynamically typed value flowing between nodes.
pub type Value = serde_json::Value;

/// A mutable mapping of string keys to values, used both for the state of a
/// single task and for the state shared across the whole graph.
pub type State = serde_json::Map<String, Value>;

/// Per-task state, keyed by `task_id`.
pub type TaskStates = BTreeMap<String, State>;

/// A lazy, pull-based sequence of values produced by a node body.
///
/// Elements are pulled one at a time, so the producing closure may carry its
/// own state across elements. Each element may fail independently.
pub type Stream = Box<dyn Iterator<Item = anyhow::Result<Value>>>;

/// The result of invoking a node body.
///
/// A task body usually returns a plain [`Output::Value`], while a source body
/// must return an [`Output::Stream`].
pub enum Output {
    Value(Value),
    Stream(Stream),
}

impl Output {
    /// Wraps any iterator of values into a lazy stream.
    pub fn stream<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
        T: Into<Value>,
    {
        Output::Stream(Box::new(iter.into_iter().map(|item| Ok(item.into()))))
    }

    /// Wraps an iterator whose elements may fail.
    pub fn try_stream<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<Value>>,
        I::IntoIter: 'static,
    {
        Output::Stream(Box::new(iter.into_iter()))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Output::Stream(_))
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Value(value)
    }
}

impl Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Value(value) => f.debug_tuple("Output::Value").field(value).finish(),
            Output::Stream(_) => write!(f, "Output::Stream(*)"),
        }
    }
}

/// Keyword arguments passed to a node body, with every upstream reference
/// already replaced by the value that upstream produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Like [`get`](Self::get), but a missing argument is an error.
    pub fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{name}'"))
    }

    /// Deserializes an argument into a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.require(name)?;
        T::deserialize(value).map_err(|e| anyhow::anyhow!("argument '{name}': {e}"))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl IntoIterator for Args {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl FromIterator<(String, Value)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Snapshot of both state maps owned by a graph.
///
/// This is the shape used to seed a graph before execution and to export
/// whatever the tasks accumulated afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    #[serde(default)]
    pub graph_state: TaskStates,
    #[serde(default)]
    pub global_state: State,
}

impl GraphState {
    pub fn new(graph_state: TaskStates, global_state: State) -> Self {
        Self {
            graph_state,
            global_state,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Shallow merge: task entries and shared keys from `other` replace the
    /// ones already present.
    pub fn merge(&mut self, other: GraphState) {
        self.graph_state.extend(other.graph_state);
        self.global_state.extend(other.global_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_access() {
        let args = Args::new().with("number", 5).with("label", "five");

        assert_eq!(args.get("number"), Some(&json!(5)));
        assert_eq!(args.get_as::<String>("label").unwrap(), "five");
        assert!(args.get("missing").is_none());
        assert!(args.require("missing").is_err());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_args_get_as_wrong_type() {
        let args = Args::new().with("number", "not a number");
        let err = args.get_as::<i64>("number").unwrap_err();
        assert!(err.to_string().contains("argument 'number'"));
    }

    #[test]
    fn test_output_stream_is_lazy() {
        let output = Output::stream((0..3).map(|i| i * 2));
        let Output::Stream(stream) = output else {
            panic!("expected a stream");
        };

        let values: Vec<_> = stream.map(Result::unwrap).collect();
        assert_eq!(values, vec![json!(0), json!(2), json!(4)]);
    }

    #[test]
    fn test_graph_state_from_json() {
        let state = GraphState::from_json(
            r#"{"graph_state": {"task1": {"key": "value"}}, "global_state": {"global": 1}}"#,
        )
        .unwrap();

        assert_eq!(state.graph_state["task1"]["key"], json!("value"));
        assert_eq!(state.global_state["global"], json!(1));
    }

    #[test]
    fn test_graph_state_missing_fields_default() {
        let state = GraphState::from_json("{}").unwrap();
        assert_eq!(state, GraphState::default());
    }

    #[test]
    fn test_graph_state_merge() {
        let mut state = GraphState::from_json(
            r#"{"graph_state": {"task1": {"existing": "value"}}, "global_state": {"existing_global": "value"}}"#,
        )
        .unwrap();

        state.merge(
            GraphState::from_json(
                r#"{"graph_state": {"task2": {"new": "value"}}, "global_state": {"new_global": "value"}}"#,
            )
            .unwrap(),
        );

        assert_eq!(state.graph_state.len(), 2);
        assert_eq!(state.global_state.len(), 2);
        assert_eq!(state.global_state["new_global"], json!("value"));
    }
}
