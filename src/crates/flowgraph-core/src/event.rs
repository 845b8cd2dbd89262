//! Typed execution events
//!
//! The engine's only output is a stream of these events. They are
//! wire-agnostic: each carries a `type` tag so outer transports (SSE,
//! websockets, logs) can frame them without knowing the engine.
//! Emission order within a step is deterministic (node completions by
//! task id, then channel updates by channel name), which makes traces
//! replayable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One event in a run's output stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        lineage_id: Option<String>,
    },
    RunFinished {
        state: HashMap<String, Value>,
    },
    RunError {
        message: String,
    },
    NodeStarted {
        node_id: String,
        task_id: String,
    },
    NodeCompleted {
        node_id: String,
        task_id: String,
        /// State keys the node's delta touched, sorted
        delta_keys: Vec<String>,
    },
    ChannelUpdated {
        channel: String,
        version: i64,
    },
    InterruptRaised {
        node_id: String,
        value: Value,
    },
    CheckpointCommitted {
        checkpoint_id: String,
        step: i64,
    },
}

/// Stream handed to the caller of `run`
pub type EventStream = ReceiverStream<ExecutionEvent>;

/// Sending half used by the scheduler. Dropped receivers are fine: a
/// caller that stops listening does not stop the run.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl EventSender {
    pub(crate) fn channel(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, ReceiverStream::new(rx))
    }

    pub(crate) async fn emit(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_for_transport_framing() {
        let event = ExecutionEvent::InterruptRaised {
            node_id: "approve".into(),
            value: json!("need-approval"),
        };
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["type"], json!("interrupt_raised"));
        assert_eq!(encoded["node_id"], json!("approve"));

        let decoded: ExecutionEvent = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn emit_survives_a_dropped_receiver() {
        let (sender, stream) = EventSender::channel(4);
        drop(stream);
        sender
            .emit(ExecutionEvent::RunStarted { lineage_id: None })
            .await;
    }
}
