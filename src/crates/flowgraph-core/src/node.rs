//! Node trait and execution primitives
//!
//! A node is a unit of work identified by a stable string id. It never
//! sees channels directly: the scheduler hands it an immutable
//! [`StateSnapshot`] plus a [`NodeContext`] carrying the values of its
//! input channels, and collects a [`NodeOutput`] in return: a state
//! delta, optional channel writes, and (for routers) a next-node hint.
//!
//! A node suspends itself by calling [`NodeContext::interrupt`]: the
//! first call returns the interrupt sentinel error, which the scheduler
//! turns into a suspended task; when the run is resumed with an answer,
//! the same call returns that answer instead.

use crate::error::{GraphError, Result};
use crate::state::StateSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Stable node identifier
pub type NodeId = String;

/// Virtual entry marker; `add_edge(START, n)` sets the entry point.
pub const START: &str = "__start__";
/// Virtual exit marker; routing to `END` terminates the run.
pub const END: &str = "__end__";

/// What a node is, opaque to the engine except for `Router`, whose
/// output names the next node instead of carrying a state delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Function,
    Agent,
    Tool,
    Router,
    End,
}

/// Output of one node invocation
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// State delta, merged through each key's reducer at commit
    pub delta: HashMap<String, Value>,
    /// Explicit channel writes
    pub writes: Vec<(String, Value)>,
    /// Router hint: id of the node to schedule next
    pub goto: Option<NodeId>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta from a JSON object; anything else produces an empty delta.
    pub fn update(value: Value) -> Self {
        let delta = match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        Self {
            delta,
            ..Self::default()
        }
    }

    pub fn from_delta(delta: HashMap<String, Value>) -> Self {
        Self {
            delta,
            ..Self::default()
        }
    }

    pub fn with_write(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.writes.push((channel.into(), value));
        self
    }

    pub fn with_goto(mut self, node: impl Into<NodeId>) -> Self {
        self.goto = Some(node.into());
        self
    }
}

/// Per-invocation context handed to a node
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub task_id: String,
    /// Super-step the invocation runs in
    pub step: i64,
    /// Nesting hierarchy for sub-graph tasks
    pub path: Vec<String>,
    /// Values of the node's input channels at dispatch time
    pub inputs: HashMap<String, Value>,
    /// Answer supplied by the caller when resuming this task
    pub resume: Option<Value>,
}

impl NodeContext {
    /// Suspend the task, surfacing `value` to the caller.
    ///
    /// Returns the caller's resume answer when the run was resumed for
    /// this task; otherwise returns the interrupt sentinel, which the
    /// scheduler records as a suspension rather than a failure.
    pub fn interrupt(&self, value: Value) -> Result<Value> {
        match &self.resume {
            Some(answer) => Ok(answer.clone()),
            None => Err(GraphError::interrupt(value)),
        }
    }

    pub fn input(&self, channel: &str) -> Option<&Value> {
        self.inputs.get(channel)
    }
}

/// A unit of work in the graph.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodeOutput>;
}

/// Adapter turning an async closure into a [`NodeHandler`].
pub struct FnNode<F>(F);

impl<F> FnNode<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> NodeHandler for FnNode<F>
where
    F: Fn(StateSnapshot, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput>> + Send,
{
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodeOutput> {
        (self.0)(snapshot, ctx).await
    }
}

/// Convenience for registering a closure-backed node.
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(StateSnapshot, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
{
    Arc::new(FnNode::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(resume: Option<Value>) -> NodeContext {
        NodeContext {
            node_id: "n".into(),
            task_id: "t".into(),
            step: 0,
            path: vec!["n".into()],
            inputs: HashMap::new(),
            resume,
        }
    }

    #[test]
    fn interrupt_suspends_then_returns_resume_value() {
        let first = ctx(None).interrupt(json!("need-approval"));
        match first {
            Err(GraphError::Interrupt(signal)) => {
                assert_eq!(signal.value, json!("need-approval"));
            }
            other => panic!("expected interrupt sentinel, got {other:?}"),
        }

        let second = ctx(Some(json!("approved"))).interrupt(json!("need-approval"));
        assert_eq!(second.unwrap(), json!("approved"));
    }

    #[test]
    fn update_flattens_objects_only() {
        let out = NodeOutput::update(json!({"a": 1, "b": "x"}));
        assert_eq!(out.delta.get("a"), Some(&json!(1)));
        assert_eq!(out.delta.len(), 2);

        let empty = NodeOutput::update(json!(["not", "an", "object"]));
        assert!(empty.delta.is_empty());
    }

    #[tokio::test]
    async fn closure_nodes_run_through_the_adapter() {
        let handler = node_fn(|snapshot: StateSnapshot, _ctx| async move {
            let count = snapshot
                .get("count")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            Ok(NodeOutput::update(json!({"count": count + 1})))
        });

        let snapshot = StateSnapshot::new(HashMap::from([("count".to_string(), json!(2))]));
        let out = handler.run(snapshot, ctx(None)).await.unwrap();
        assert_eq!(out.delta.get("count"), Some(&json!(3)));
    }
}
