//! Concurrent task dispatch
//!
//! All invocations of a super-step run in parallel on the runtime's
//! worker pool; the scheduler itself stays single-threaded for commit
//! and persistence. Each task watches the run's cancellation signal, so
//! a cancelled run still drains every outstanding invocation and hands
//! the scheduler a complete picture for the post-step commit.

use super::types::{FinishedTask, TaskInvocation, TaskOutcome};
use crate::error::GraphError;
use crate::node::NodeContext;
use tokio::sync::watch;
use tokio::task::JoinSet;

pub(crate) struct TaskExecutor;

impl TaskExecutor {
    /// Run every invocation to completion (or cancellation) and return
    /// the finished tasks sorted by task id.
    pub(crate) async fn dispatch(
        invocations: Vec<TaskInvocation>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Vec<FinishedTask> {
        let mut join_set: JoinSet<FinishedTask> = JoinSet::new();

        for invocation in invocations {
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let TaskInvocation {
                    id,
                    node_id,
                    kind,
                    step,
                    path,
                    triggers,
                    snapshot,
                    inputs,
                    resume,
                    handler,
                } = invocation;

                tracing::debug!(task = %id, node = %node_id, step, "dispatching task");

                let ctx = NodeContext {
                    node_id: node_id.clone(),
                    task_id: id.clone(),
                    step,
                    path: path.clone(),
                    inputs,
                    resume,
                };

                let outcome = match cancel {
                    Some(mut rx) => {
                        tokio::select! {
                            result = handler.run(snapshot, ctx) => Self::outcome_of(result),
                            _ = wait_for_cancel(&mut rx) => {
                                TaskOutcome::Failed(GraphError::Cancelled)
                            }
                        }
                    }
                    None => Self::outcome_of(handler.run(snapshot, ctx).await),
                };

                if let TaskOutcome::Failed(error) = &outcome {
                    tracing::warn!(task = %id, node = %node_id, %error, "task failed");
                }

                FinishedTask {
                    id,
                    node_id,
                    kind,
                    path,
                    triggers,
                    outcome,
                }
            });
        }

        let mut finished = Vec::new();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(task) => finished.push(task),
                Err(join_error) => {
                    tracing::error!(%join_error, "task aborted outside the engine");
                }
            }
        }

        finished.sort_by(|a, b| a.id.cmp(&b.id));
        finished
    }

    fn outcome_of(result: crate::error::Result<crate::node::NodeOutput>) -> TaskOutcome {
        match result {
            Ok(output) => TaskOutcome::Completed(output),
            Err(GraphError::Interrupt(signal)) => TaskOutcome::Suspended(signal),
            Err(error) => TaskOutcome::Failed(error),
        }
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    // Sender gone without cancelling: park forever, the task branch of
    // the select resolves instead.
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeKind, NodeOutput};
    use crate::state::StateSnapshot;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn invocation(id: &str, handler: Arc<dyn crate::node::NodeHandler>) -> TaskInvocation {
        TaskInvocation {
            id: id.to_string(),
            node_id: id.to_string(),
            kind: NodeKind::Function,
            step: 0,
            path: vec![id.to_string()],
            triggers: vec![],
            snapshot: StateSnapshot::default(),
            inputs: HashMap::new(),
            resume: None,
            handler,
        }
    }

    #[tokio::test]
    async fn tasks_run_concurrently_and_sort_by_id() {
        let slow = node_fn(|_, _| async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(NodeOutput::update(json!({"who": "slow"})))
        });
        let fast = node_fn(|_, _| async { Ok(NodeOutput::update(json!({"who": "fast"}))) });

        let finished = TaskExecutor::dispatch(
            vec![invocation("z-slow", slow), invocation("a-fast", fast)],
            None,
        )
        .await;

        let ids: Vec<&str> = finished.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a-fast", "z-slow"]);
        assert!(finished
            .iter()
            .all(|t| matches!(t.outcome, TaskOutcome::Completed(_))));
    }

    #[tokio::test]
    async fn interrupts_and_failures_map_to_outcomes() {
        let suspends = node_fn(|_, ctx: crate::node::NodeContext| async move {
            let answer = ctx.interrupt(json!("pause"))?;
            Ok(NodeOutput::update(json!({"answer": answer})))
        });
        let fails = node_fn(|_, _| async {
            Err(GraphError::node_execution("fails", "boom"))
        });

        let finished = TaskExecutor::dispatch(
            vec![invocation("a", suspends), invocation("b", fails)],
            None,
        )
        .await;

        assert!(matches!(
            &finished[0].outcome,
            TaskOutcome::Suspended(signal) if signal.value == json!("pause")
        ));
        assert!(matches!(&finished[1].outcome, TaskOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn cancellation_drains_outstanding_tasks() {
        let (tx, rx) = watch::channel(false);
        let hang = node_fn(|_, _| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(NodeOutput::new())
        });

        let handle = tokio::spawn(TaskExecutor::dispatch(
            vec![invocation("hung", hang)],
            Some(rx),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let finished = handle.await.unwrap();
        assert_eq!(finished.len(), 1);
        assert!(matches!(
            &finished[0].outcome,
            TaskOutcome::Failed(GraphError::Cancelled)
        ));
    }
}
