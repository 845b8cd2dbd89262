//! Core checkpoint data structures for state persistence and resumption
//!
//! A checkpoint is a complete snapshot of engine state taken after a
//! super-step: channel values, channel versions, the per-task record of
//! which channel versions each task has already observed, the committed
//! state map, and any writes that were produced but not yet merged into
//! channels (pending writes). Checkpoints are grouped by **lineage** (a
//! logical run) and an optional **namespace** (a branch label used for
//! forks and nested sub-graphs).
//!
//! # Structure
//!
//! ```text
//! lineage "conversation-42"
//!   ├── namespace ""          (main timeline)
//!   │     ├── checkpoint c1   (step 0)
//!   │     ├── checkpoint c2   (step 1, parent c1)
//!   │     └── checkpoint c3   (step 2, parent c2)
//!   └── namespace "retry-1"   (fork)
//!         └── checkpoint c4   (step 2, parent c2  ← cross-namespace)
//! ```
//!
//! # Invariants
//!
//! - Within a lineage, each `(namespace, id)` pair is unique.
//! - `versions_seen[task][channel] <= channel_versions[channel]`.
//! - A `parent_id` refers to a checkpoint somewhere in the same lineage;
//!   the parent may live in a different namespace (fork semantics).
//! - Checkpoints are append-only; an existing id is never rewritten.
//!
//! Numeric payloads round-trip through the backend's encoding, which may
//! widen them (JSON turns every number into a double). The contract
//! guarantees value equality, not representational equality, so compare
//! numerics by value after a restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Mapping from channel name to its 64-bit monotonic version
pub type ChannelVersions = HashMap<String, i64>;

/// Origin of a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Created from the input of a fresh run
    Input,
    /// Created from inside the scheduler loop after a super-step
    Loop,
    /// Created from a manual state update
    Update,
    /// Created as a copy of another checkpoint (branching)
    Fork,
    /// Created while one or more tasks are suspended on an interrupt
    Interrupt,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Super-step number the checkpoint was taken after
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Additional custom metadata; `list` filters match against this map
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata substituted when a caller passes none on `put`.
    pub fn default_for_put() -> Self {
        Self::new().with_source(CheckpointSource::Update).with_step(0)
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Snapshot of engine state at the end of a super-step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version (currently 1)
    pub v: i32,

    /// Unique checkpoint identifier within its `(lineage, namespace)`
    pub id: CheckpointId,

    /// Identifier of the checkpoint this one was derived from, if any.
    /// The parent may live in a different namespace of the same lineage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,

    /// Creation timestamp. The epoch value is treated as "unset" and
    /// replaced with the current UTC time at persist time.
    pub ts: DateTime<Utc>,

    /// Observable value of every channel (name -> serialized view)
    pub channel_values: HashMap<String, serde_json::Value>,

    /// Monotonic version of every channel
    pub channel_versions: ChannelVersions,

    /// For each task, the channel versions it had observed when it last
    /// ran. Drives replay: a task is re-dispatched when a trigger
    /// channel's version exceeds the version recorded here.
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Committed state map produced by the reducers
    pub state: HashMap<String, serde_json::Value>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
        state: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            parent_id: None,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            state,
        }
    }

    /// Create an empty checkpoint with a fresh random id.
    pub fn empty() -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    pub fn with_parent(mut self, parent_id: impl Into<CheckpointId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    /// Whether the timestamp is the "unset" sentinel.
    pub fn ts_is_zero(&self) -> bool {
        self.ts == DateTime::<Utc>::UNIX_EPOCH
    }
}

/// A write produced by a task that has not been merged into a channel,
/// attached to the checkpoint it was produced under.
///
/// `sequence` orders writes within a task deterministically. A zero
/// sequence is replaced by the storage layer with a monotonically
/// assigned value; non-zero sequences are honored as given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    pub task_id: String,

    /// Nesting hierarchy of the owning task (ordered node ids)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_path: Vec<String>,

    pub channel: String,
    pub value: serde_json::Value,

    #[serde(default)]
    pub sequence: u64,
}

impl PendingWrite {
    pub fn new(
        task_id: impl Into<String>,
        channel: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_path: Vec::new(),
            channel: channel.into(),
            value,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_task_path(mut self, path: Vec<String>) -> Self {
        self.task_path = path;
        self
    }
}

/// Addresses a checkpoint (or the latest checkpoint) within a lineage.
///
/// - `lineage_id` is required by every operation.
/// - An absent `checkpoint_id` means "the latest".
/// - An absent `namespace` widens latest-resolution to every namespace
///   of the lineage.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lineage_id(mut self, lineage_id: impl Into<String>) -> Self {
        self.lineage_id = Some(lineage_id.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Effective namespace; absent and empty-string are equivalent.
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

/// A checkpoint together with everything retrieved alongside it
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Fully-resolved config of the stored checkpoint
    pub config: CheckpointConfig,

    pub checkpoint: Checkpoint,

    pub metadata: CheckpointMetadata,

    /// Config of the parent checkpoint. When the parent id is advertised
    /// but cannot be found, this carries the id with an empty namespace.
    pub parent_config: Option<CheckpointConfig>,

    /// Writes attached to this checkpoint, ordered by sequence ascending
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }

    pub fn with_pending_writes(mut self, mut writes: Vec<PendingWrite>) -> Self {
        writes.sort_by(|a, b| a.sequence.cmp(&b.sequence));
        self.pending_writes = writes;
        self
    }
}
