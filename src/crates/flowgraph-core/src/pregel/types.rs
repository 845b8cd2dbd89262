//! Task types for the super-step scheduler

use crate::error::{GraphError, InterruptSignal};
use crate::node::{NodeHandler, NodeId, NodeKind, NodeOutput};
use crate::state::StateSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Record of a node-raised interrupt, serialized into the checkpoint's
/// pending writes under the reserved interrupt channel so that replay
/// re-raises it atomically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRecord {
    pub node_id: NodeId,
    pub task_id: String,
    pub step: i64,
    pub ts: DateTime<Utc>,
    pub value: Value,
    pub path: Vec<String>,
}

impl InterruptRecord {
    pub(crate) fn new(
        node_id: impl Into<NodeId>,
        task_id: impl Into<String>,
        step: i64,
        value: Value,
        path: Vec<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: task_id.into(),
            step,
            ts: Utc::now(),
            value,
            path,
        }
    }
}

/// One node invocation prepared for dispatch: everything the node sees
/// is snapshotted here, so concurrent tasks share nothing mutable.
pub struct TaskInvocation {
    pub id: String,
    pub node_id: NodeId,
    pub kind: NodeKind,
    /// Super-step the invocation belongs to
    pub step: i64,
    /// Nesting hierarchy; the composite identity of the task
    pub path: Vec<String>,
    /// Channels whose update triggered this task
    pub triggers: Vec<String>,
    pub snapshot: StateSnapshot,
    /// Values of the trigger channels at planning time
    pub inputs: HashMap<String, Value>,
    /// Caller-supplied answer when this task resumes an interrupt
    pub resume: Option<Value>,
    pub handler: Arc<dyn NodeHandler>,
}

impl fmt::Debug for TaskInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInvocation")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("kind", &self.kind)
            .field("triggers", &self.triggers)
            .finish()
    }
}

/// How one task ended. Suspension is first-class control flow, carried
/// next to completion and failure rather than thrown through it.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(NodeOutput),
    Suspended(InterruptSignal),
    Failed(GraphError),
}

/// A dispatched task together with its outcome
#[derive(Debug)]
pub struct FinishedTask {
    pub id: String,
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub path: Vec<String>,
    pub triggers: Vec<String>,
    pub outcome: TaskOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interrupt_record_round_trips_through_json() {
        let record = InterruptRecord::new(
            "approve",
            "3:approve",
            3,
            json!("need-approval"),
            vec!["approve".to_string()],
        );

        let value = serde_json::to_value(&record).unwrap();
        let decoded: InterruptRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record);
    }
}
