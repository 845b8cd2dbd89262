//! Run API: execute a compiled graph and consume its event stream
//!
//! [`CompiledGraph::run`] starts the scheduler on the runtime and hands
//! back the typed event stream; [`CompiledGraph::invoke`] drains that
//! stream and returns the final state. A durable run names a
//! `lineage_id` and carries a checkpointer; resuming an interrupted
//! lineage is the same call with a [`ResumeValue`] attached.

use crate::error::{GraphError, Result};
use crate::event::{EventSender, EventStream, ExecutionEvent};
use crate::graph::CompiledGraph;
use crate::pregel::loop_impl::PregelLoop;
use flowgraph_checkpoint::CheckpointSaver;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use futures::StreamExt;

/// Default cap on super-steps per run
pub const DEFAULT_STEP_LIMIT: usize = 25;

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Caller-supplied answer(s) for suspended tasks
#[derive(Debug, Clone)]
pub enum ResumeValue {
    /// One answer, delivered to every suspended task
    Single(Value),
    /// Answers keyed by the task id recorded in the interrupt
    PerTask(HashMap<String, Value>),
}

/// Options for one run
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Logical run identity; required for durable runs
    pub lineage_id: Option<String>,
    /// Branch label within the lineage (forks, retries, sub-graphs)
    pub namespace: Option<String>,
    /// Resume an interrupted lineage with these answers
    pub resume: Option<ResumeValue>,
    pub checkpointer: Option<Arc<dyn CheckpointSaver>>,
    pub step_limit: usize,
    /// Caller cancellation signal; flips to `true` to cancel
    pub cancel: Option<watch::Receiver<bool>>,
    pub event_buffer: usize,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("lineage_id", &self.lineage_id)
            .field("namespace", &self.namespace)
            .field("resume", &self.resume)
            .field("step_limit", &self.step_limit)
            .field("has_checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            ..Self::default()
        }
    }

    pub fn with_lineage_id(mut self, lineage_id: impl Into<String>) -> Self {
        self.lineage_id = Some(lineage_id.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(saver);
        self
    }

    /// Resume with a single answer for every suspended task.
    pub fn with_resume(mut self, value: Value) -> Self {
        self.resume = Some(ResumeValue::Single(value));
        self
    }

    /// Resume with per-task answers; unanswered tasks stay suspended.
    pub fn with_resume_map(mut self, map: HashMap<String, Value>) -> Self {
        self.resume = Some(ResumeValue::PerTask(map));
        self
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl CompiledGraph {
    /// Start a run and return its event stream.
    ///
    /// The stream opens with `RunStarted` and closes with either
    /// `RunFinished` (carrying the final state) or a terminal
    /// `RunError`. Node failures surface as mid-stream `RunError`
    /// events without ending the run.
    pub fn run(&self, initial_state: Value, options: RunOptions) -> Result<EventStream> {
        let initial: HashMap<String, Value> = match initial_state {
            Value::Object(map) => map.into_iter().collect(),
            Value::Null => HashMap::new(),
            other => {
                return Err(GraphError::Validation(format!(
                    "initial state must be a JSON object, got {other}"
                )))
            }
        };

        let buffer = if options.event_buffer == 0 {
            DEFAULT_EVENT_BUFFER
        } else {
            options.event_buffer
        };
        let (events, stream) = EventSender::channel(buffer);
        let lineage_id = options.lineage_id.clone();
        let graph = self.clone();

        tokio::spawn(async move {
            events
                .emit(ExecutionEvent::RunStarted { lineage_id })
                .await;
            let pregel = PregelLoop::new(graph, options, events.clone());
            match pregel.run(initial).await {
                Ok(state) => {
                    events.emit(ExecutionEvent::RunFinished { state }).await;
                }
                Err(error) => {
                    tracing::error!(%error, "run aborted");
                    events
                        .emit(ExecutionEvent::RunError {
                            message: error.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(stream)
    }

    /// Run to termination and return the final state.
    ///
    /// An interrupted run returns the state as of suspension; inspect
    /// the event stream (or the checkpoint metadata) to distinguish a
    /// pause from completion.
    pub async fn invoke(
        &self,
        initial_state: Value,
        options: RunOptions,
    ) -> Result<HashMap<String, Value>> {
        let mut stream = self.run(initial_state, options)?;

        let mut final_state = None;
        let mut last_error = None;
        while let Some(event) = stream.next().await {
            match event {
                ExecutionEvent::RunFinished { state } => final_state = Some(state),
                ExecutionEvent::RunError { message } => last_error = Some(message),
                _ => {}
            }
        }

        match final_state {
            Some(state) => Ok(state),
            None => Err(GraphError::Execution(
                last_error.unwrap_or_else(|| "run ended without a result".into()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::node::{node_fn, NodeKind, NodeOutput, END, START};
    use crate::state::{StateSchema, ValueType};
    use serde_json::json;

    fn counter_graph() -> CompiledGraph {
        let mut schema = StateSchema::new();
        schema.add_simple_field("count", ValueType::Number);

        let bump = node_fn(|snapshot: crate::state::StateSnapshot, _| async move {
            let count = snapshot.get("count").and_then(Value::as_i64).unwrap_or(0);
            Ok(NodeOutput::update(json!({"count": count + 1})))
        });

        let mut builder = GraphBuilder::new().with_schema(schema);
        builder
            .add_node("bump", NodeKind::Function, bump)
            .add_edge(START, "bump")
            .add_edge("bump", END);
        builder.compile().unwrap()
    }

    #[tokio::test]
    async fn run_opens_with_run_started_and_closes_with_run_finished() {
        let graph = counter_graph();
        let mut stream = graph.run(json!({"count": 4}), RunOptions::new()).unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, ExecutionEvent::RunStarted { .. }));

        let mut last = first;
        while let Some(event) = stream.next().await {
            last = event;
        }
        match last {
            ExecutionEvent::RunFinished { state } => {
                assert_eq!(state.get("count"), Some(&json!(5)));
            }
            other => panic!("expected RunFinished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_returns_the_final_state() {
        let graph = counter_graph();
        let state = graph.invoke(json!(null), RunOptions::new()).await.unwrap();
        assert_eq!(state.get("count"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn non_object_initial_state_is_rejected() {
        let graph = counter_graph();
        let err = graph.run(json!([1, 2]), RunOptions::new()).unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }
}
