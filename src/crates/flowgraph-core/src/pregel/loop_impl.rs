//! The super-step scheduler
//!
//! One `PregelLoop` drives one run: plan the trigger set, dispatch the
//! invocations in parallel, collect their outcomes, commit writes and
//! state deltas deterministically, acknowledge consumed channels,
//! persist a checkpoint, emit events, repeat. Progress across
//! super-steps is serial (only node bodies run concurrently), which is
//! what keeps channel versions globally monotonic.
//!
//! Commit order within a step:
//!
//! 1. explicit channel writes, sorted `(sequence, task_id)`
//! 2. state deltas through the reducers, tasks by id, keys ascending
//! 3. routing writes (plain edges, conditional edges, router hints)
//!    evaluated against the freshly committed state
//! 4. `versions_seen` bumps to post-update versions
//! 5. acknowledge consumed channels (skipping ones rewritten this step)
//! 6. checkpoint persisted via `put_full`, suspended work travelling as
//!    pending writes under the reserved interrupt channel

use super::algo::{
    acknowledge_consumed, apply_channel_writes, bump_versions_seen, plan_step, ChannelWrite,
    PlannedNode,
};
use super::executor::TaskExecutor;
use super::types::{FinishedTask, InterruptRecord, TaskInvocation, TaskOutcome};
use crate::channels::ChannelManager;
use crate::error::{GraphError, Result};
use crate::event::{EventSender, ExecutionEvent};
use crate::graph::{branch_channel, CompiledGraph, INTERRUPT_CHANNEL};
use crate::node::{NodeId, NodeKind, NodeOutput, END};
use crate::runner::{ResumeValue, RunOptions};
use crate::state::StateSnapshot;
use flowgraph_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointError, CheckpointMetadata, CheckpointSource,
    PendingWrite,
};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

struct CompletedTask {
    id: String,
    node_id: NodeId,
    kind: NodeKind,
    triggers: Vec<String>,
    output: NodeOutput,
}

struct StepSummary {
    finish: bool,
    all_suspended: bool,
    cancelled: bool,
}

pub(crate) struct PregelLoop {
    graph: CompiledGraph,
    options: RunOptions,
    events: EventSender,
    manager: ChannelManager,
    state: HashMap<String, Value>,
    versions_seen: HashMap<String, HashMap<String, i64>>,
    /// Unanswered interrupts, re-attached to every checkpoint until the
    /// owning task resumes
    outstanding: Vec<InterruptRecord>,
    /// node id -> answer for the next invocation of that node
    resume_for: HashMap<NodeId, Value>,
    last_checkpoint_id: Option<String>,
    step: i64,
}

impl PregelLoop {
    pub(crate) fn new(graph: CompiledGraph, options: RunOptions, events: EventSender) -> Self {
        Self {
            graph,
            options,
            events,
            manager: ChannelManager::new(),
            state: HashMap::new(),
            versions_seen: HashMap::new(),
            outstanding: Vec::new(),
            resume_for: HashMap::new(),
            last_checkpoint_id: None,
            step: 0,
        }
    }

    /// Drive the run to termination and return the final state.
    pub(crate) async fn run(mut self, initial: HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        if self.options.checkpointer.is_some() && self.options.lineage_id.is_none() {
            return Err(GraphError::Validation(
                "a durable run requires a lineage_id".into(),
            ));
        }

        let resuming = self.init(initial).await?;
        let mut first_step = !resuming;

        loop {
            if self.step >= self.options.step_limit as i64 {
                return Err(GraphError::StepLimitExceeded(self.options.step_limit));
            }

            let invocations = if first_step {
                first_step = false;
                vec![self.entry_invocation()]
            } else {
                let planned = plan_step(&self.graph, &self.manager, &self.versions_seen, self.step - 1);
                self.build_invocations(planned)
            };

            if invocations.is_empty() {
                break;
            }

            for invocation in &invocations {
                self.events
                    .emit(ExecutionEvent::NodeStarted {
                        node_id: invocation.node_id.clone(),
                        task_id: invocation.id.clone(),
                    })
                    .await;
            }

            let finished =
                TaskExecutor::dispatch(invocations, self.options.cancel.clone()).await;
            let summary = self.commit(finished).await?;

            if summary.cancelled {
                return Err(GraphError::Cancelled);
            }
            if summary.finish || summary.all_suspended {
                break;
            }
            self.step += 1;
        }

        Ok(self.state)
    }

    /// Build channels and either seed a fresh run or rehydrate from the
    /// latest checkpoint. Returns whether this run resumes one.
    async fn init(&mut self, initial: HashMap<String, Value>) -> Result<bool> {
        self.graph.build_channels(&self.manager);

        let Some(resume) = self.options.resume.clone() else {
            self.state = self.graph.schema().initial_state(initial)?;
            return Ok(false);
        };

        let saver = self
            .options
            .checkpointer
            .as_ref()
            .ok_or_else(|| GraphError::Validation("resume requires a checkpointer".into()))?;
        let lineage_id = self
            .options
            .lineage_id
            .as_ref()
            .ok_or_else(|| GraphError::Validation("resume requires a lineage_id".into()))?;

        let mut config = CheckpointConfig::new().with_lineage_id(lineage_id.clone());
        if let Some(ns) = &self.options.namespace {
            config = config.with_namespace(ns.clone());
        }
        let tuple = saver
            .get_tuple(&config)
            .await?
            .ok_or_else(|| GraphError::Execution("no checkpoint to resume from".into()))?;

        self.manager
            .restore(&tuple.checkpoint.channel_values, &tuple.checkpoint.channel_versions);
        self.state = tuple.checkpoint.state.clone();
        self.versions_seen = tuple.checkpoint.versions_seen.clone();
        self.step = tuple.metadata.step.unwrap_or(0) + 1;
        self.last_checkpoint_id = Some(tuple.checkpoint.id.clone());

        // Route the caller's answers to the suspended tasks recorded in
        // the checkpoint; anything unanswered stays suspended.
        for write in &tuple.pending_writes {
            if write.channel != INTERRUPT_CHANNEL {
                continue;
            }
            let Ok(record) = serde_json::from_value::<InterruptRecord>(write.value.clone()) else {
                tracing::warn!(task = %write.task_id, "malformed interrupt record in checkpoint");
                continue;
            };
            let answer = match &resume {
                ResumeValue::Single(value) => Some(value.clone()),
                ResumeValue::PerTask(map) => map.get(&record.task_id).cloned(),
            };
            match answer {
                Some(value) => {
                    self.resume_for.insert(record.node_id.clone(), value);
                }
                None => self.outstanding.push(record),
            }
        }

        Ok(true)
    }

    fn entry_invocation(&mut self) -> TaskInvocation {
        let entry = self.graph.entry().to_string();
        let spec = self.graph.node(&entry).expect("validated at compile time");
        let kind = spec.kind;
        let handler = spec.handler.clone();
        let resume = self.resume_for.remove(&entry);
        TaskInvocation {
            id: format!("{}:{}", self.step, entry),
            node_id: entry.clone(),
            kind,
            step: self.step,
            path: vec![entry],
            triggers: Vec::new(),
            snapshot: StateSnapshot::new(self.state.clone()),
            inputs: HashMap::new(),
            resume,
            handler,
        }
    }

    fn build_invocations(&mut self, planned: Vec<PlannedNode>) -> Vec<TaskInvocation> {
        let mut invocations = Vec::with_capacity(planned.len());
        for plan in planned {
            let Some(spec) = self.graph.node(&plan.node_id) else {
                continue;
            };
            let kind = spec.kind;
            let handler = spec.handler.clone();
            let resume = self.resume_for.remove(&plan.node_id);
            invocations.push(TaskInvocation {
                id: format!("{}:{}", self.step, plan.node_id),
                node_id: plan.node_id.clone(),
                kind,
                step: self.step,
                path: vec![plan.node_id],
                triggers: plan.triggers,
                snapshot: StateSnapshot::new(self.state.clone()),
                inputs: plan.inputs,
                resume,
                handler,
            });
        }
        invocations
    }

    async fn commit(&mut self, finished: Vec<FinishedTask>) -> Result<StepSummary> {
        let step = self.step;
        let task_count = finished.len();

        let mut completed: Vec<CompletedTask> = Vec::new();
        let mut failed: Vec<(NodeId, String, String)> = Vec::new();
        let mut new_interrupts: Vec<InterruptRecord> = Vec::new();
        let mut consumed: Vec<String> = Vec::new();
        let mut cancelled = false;

        for task in finished {
            match task.outcome {
                TaskOutcome::Completed(output) => {
                    consumed.extend(task.triggers.iter().cloned());
                    completed.push(CompletedTask {
                        id: task.id,
                        node_id: task.node_id,
                        kind: task.kind,
                        triggers: task.triggers,
                        output,
                    });
                }
                TaskOutcome::Suspended(signal) => {
                    consumed.extend(task.triggers.iter().cloned());
                    new_interrupts.push(InterruptRecord::new(
                        task.node_id,
                        task.id,
                        step,
                        signal.value,
                        task.path,
                    ));
                }
                // Cancelled tasks never ran: their triggers stay live
                // and unacknowledged so a replay re-dispatches them.
                TaskOutcome::Failed(GraphError::Cancelled) => {
                    cancelled = true;
                }
                TaskOutcome::Failed(error) => {
                    consumed.extend(task.triggers.iter().cloned());
                    failed.push((task.node_id, task.id, error.to_string()));
                }
            }
        }

        // 1. Explicit channel writes, in task order then write order.
        let mut sequence: u64 = 0;
        let mut writes: Vec<ChannelWrite> = Vec::new();
        for task in &completed {
            for (channel, value) in &task.output.writes {
                sequence += 1;
                writes.push(ChannelWrite {
                    channel: channel.clone(),
                    value: value.clone(),
                    sequence,
                    task_id: task.id.clone(),
                });
            }
        }
        let mut updated = apply_channel_writes(&self.manager, writes, step);

        // 2. State deltas through the reducers. A delta touching an
        //    undeclared key fails its task; the step still commits.
        let mut routed: Vec<&CompletedTask> = Vec::new();
        for task in &completed {
            match task
                .output
                .delta
                .keys()
                .find(|key| !self.graph.schema().has_field(key))
            {
                Some(bad_key) => {
                    failed.push((
                        task.node_id.clone(),
                        task.id.clone(),
                        GraphError::SchemaMismatch {
                            key: bad_key.clone(),
                        }
                        .to_string(),
                    ));
                }
                None => {
                    self.graph
                        .schema()
                        .apply(&mut self.state, task.output.delta.clone())?;
                    routed.push(task);
                }
            }
        }

        // 3. Routing against the committed state.
        let mut finish = false;
        let snapshot = StateSnapshot::new(self.state.clone());
        let mut routing: Vec<ChannelWrite> = Vec::new();
        for task in &routed {
            if task.kind == NodeKind::End {
                finish = true;
            }
            for target in self.graph.direct_targets_of(&task.node_id) {
                if target == END {
                    finish = true;
                    continue;
                }
                let (channel, value) = self.graph.edge_write(&task.node_id, target);
                sequence += 1;
                routing.push(ChannelWrite {
                    channel,
                    value,
                    sequence,
                    task_id: task.id.clone(),
                });
            }
            let mut dynamic_target = None;
            if let Some(edge) = self.graph.conditional_edge(&task.node_id) {
                dynamic_target = Some(edge.resolve(&snapshot));
            } else if let Some(goto) = &task.output.goto {
                dynamic_target = Some(goto.clone());
            }
            if let Some(target) = dynamic_target {
                if target == END {
                    finish = true;
                } else {
                    sequence += 1;
                    routing.push(ChannelWrite {
                        channel: branch_channel(&task.node_id, &target),
                        value: Value::String(task.node_id.clone()),
                        sequence,
                        task_id: task.id.clone(),
                    });
                }
            }
        }
        updated.extend(apply_channel_writes(&self.manager, routing, step));

        // 4. Post-update versions seen, for everything that actually ran.
        for task in &completed {
            bump_versions_seen(&mut self.versions_seen, &task.node_id, &task.triggers, &self.manager);
        }

        // 5. Acknowledge what this step consumed. Suspended tasks'
        //    triggers are acknowledged too (they must not re-trigger in
        //    this run); their missing versions_seen bump is what
        //    re-dispatches them on resume.
        acknowledge_consumed(&self.manager, consumed.iter(), &updated);

        self.outstanding.extend(new_interrupts.clone());

        // 6. Persist before planning the next step.
        let committed = self.persist(step).await?;

        for task in &completed {
            let mut delta_keys: Vec<String> = task.output.delta.keys().cloned().collect();
            delta_keys.sort();
            self.events
                .emit(ExecutionEvent::NodeCompleted {
                    node_id: task.node_id.clone(),
                    task_id: task.id.clone(),
                    delta_keys,
                })
                .await;
        }
        for (_, _, message) in &failed {
            self.events
                .emit(ExecutionEvent::RunError {
                    message: message.clone(),
                })
                .await;
        }
        for record in &new_interrupts {
            self.events
                .emit(ExecutionEvent::InterruptRaised {
                    node_id: record.node_id.clone(),
                    value: record.value.clone(),
                })
                .await;
        }
        for (channel, version) in &updated {
            self.events
                .emit(ExecutionEvent::ChannelUpdated {
                    channel: channel.clone(),
                    version: *version,
                })
                .await;
        }
        if let Some(checkpoint_id) = committed {
            self.events
                .emit(ExecutionEvent::CheckpointCommitted {
                    checkpoint_id,
                    step,
                })
                .await;
        }

        Ok(StepSummary {
            finish,
            all_suspended: task_count > 0 && new_interrupts.len() == task_count,
            cancelled,
        })
    }

    /// Persist one checkpoint for this step. Unanswered interrupts ride
    /// along as pending writes so replay re-raises them atomically.
    async fn persist(&mut self, step: i64) -> Result<Option<String>> {
        let (Some(saver), Some(lineage_id)) =
            (&self.options.checkpointer, &self.options.lineage_id)
        else {
            return Ok(None);
        };

        let (values, versions) = self.manager.snapshot();
        let checkpoint_id = Uuid::new_v4().to_string();
        let mut checkpoint = Checkpoint::new(
            checkpoint_id.clone(),
            values,
            versions.clone(),
            self.versions_seen.clone(),
            self.state.clone(),
        );
        if let Some(parent) = &self.last_checkpoint_id {
            checkpoint = checkpoint.with_parent(parent.clone());
        }

        let source = if self.outstanding.is_empty() {
            CheckpointSource::Loop
        } else {
            CheckpointSource::Interrupt
        };
        let metadata = CheckpointMetadata::new().with_source(source).with_step(step);

        let mut pending = Vec::with_capacity(self.outstanding.len());
        for record in &self.outstanding {
            let value = serde_json::to_value(record).map_err(CheckpointError::from)?;
            pending.push(PendingWrite {
                task_id: record.task_id.clone(),
                task_path: record.path.clone(),
                channel: INTERRUPT_CHANNEL.to_string(),
                value,
                sequence: 0,
            });
        }

        let mut config = CheckpointConfig::new().with_lineage_id(lineage_id.clone());
        if let Some(ns) = &self.options.namespace {
            config = config.with_namespace(ns.clone());
        }

        tracing::debug!(checkpoint = %checkpoint_id, step, "persisting checkpoint");
        saver
            .put_full(&config, checkpoint, Some(metadata), versions, pending)
            .await?;
        self.last_checkpoint_id = Some(checkpoint_id.clone());
        Ok(Some(checkpoint_id))
    }
}
