//! Error types for graph construction and execution
//!
//! The taxonomy mirrors how errors propagate through the engine:
//!
//! - [`GraphError::Validation`] - graph-shape problems, caught at
//!   compile time; nothing executes.
//! - [`GraphError::NodeExecution`] - a node body failed; the task is
//!   marked failed, the step still commits.
//! - [`GraphError::SchemaMismatch`] - a delta targeted an undeclared
//!   state key.
//! - [`GraphError::Checkpoint`] - the storage backend failed; the step
//!   aborts without committing.
//! - [`GraphError::Interrupt`] - not a failure: the sentinel a node
//!   returns to suspend its task for human input.
//!
//! The scheduler never swallows node errors, never retries
//! automatically, and never mutates a checkpoint on failure.

use flowgraph_checkpoint::CheckpointError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Payload of the interrupt sentinel: the value a suspending node
/// surfaces to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptSignal {
    pub value: serde_json::Value,
}

/// Errors that can occur during graph construction and execution
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid (unknown nodes, missing entry, ...)
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node body returned an error
    #[error("node '{node}' execution failed: {error}")]
    NodeExecution { node: String, error: String },

    /// General execution error
    #[error("execution failed: {0}")]
    Execution(String),

    /// A state delta targeted a key the schema does not declare
    #[error("state key '{key}' is not declared in the schema")]
    SchemaMismatch { key: String },

    /// Suspension sentinel raised by `NodeContext::interrupt`. First-
    /// class control flow, not a failure.
    #[error("node interrupted")]
    Interrupt(InterruptSignal),

    /// Checkpoint backend error; aborts the current step
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The run's cancellation signal fired
    #[error("run cancelled")]
    Cancelled,

    /// The run exceeded its configured step limit
    #[error("step limit of {0} super-steps exceeded")]
    StepLimitExceeded(usize),
}

impl GraphError {
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Build the interrupt sentinel carrying `value`.
    pub fn interrupt(value: serde_json::Value) -> Self {
        Self::Interrupt(InterruptSignal { value })
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interrupt_sentinel_carries_value() {
        let err = GraphError::interrupt(json!("need-approval"));
        assert!(err.is_interrupt());
        match err {
            GraphError::Interrupt(signal) => assert_eq!(signal.value, json!("need-approval")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn node_execution_display() {
        let err = GraphError::node_execution("fetch", "timeout");
        assert_eq!(err.to_string(), "node 'fetch' execution failed: timeout");
    }

    #[test]
    fn checkpoint_errors_convert() {
        let err: GraphError = CheckpointError::missing("lineage_id").into();
        assert!(matches!(err, GraphError::Checkpoint(_)));
    }
}
