//! Pluggable checkpoint storage contract
//!
//! [`CheckpointSaver`] is the abstraction every durable backend
//! implements (in-memory, Redis, SQLite, Postgres, ...). The engine
//! calls it once per super-step and treats it as a remote system: it
//! never holds channel locks across a saver call, and a saver error
//! aborts the step without touching in-memory state.
//!
//! # Persisted layout (abstract)
//!
//! ```text
//! lineage
//!   ├── namespace index                     {ns1, ns2, ...}
//!   └── per (lineage, namespace)
//!         ├── time-ordered checkpoint ids   [c1, c2, c3]
//!         └── per checkpoint id
//!               ├── checkpoint body
//!               ├── metadata body
//!               └── ordered pending writes  [(seq, task, channel, value)]
//! ```
//!
//! A backend may add key prefixes and TTLs without changing the
//! contract.
//!
//! # Validation rules (all backends)
//!
//! - `lineage_id` is required everywhere it appears.
//! - `put_writes` additionally requires `checkpoint_id`.
//! - Missing metadata on `put` defaults to `(source=update, step=0)`.
//! - A checkpoint whose timestamp is the epoch sentinel is stamped with
//!   the current UTC time at persist time.
//!
//! # Concurrency rules
//!
//! Concurrent `put` calls on the same `(lineage, namespace)` must
//! serialize. Concurrent `put_writes` against distinct checkpoints are
//! independent. A `list` observes either the pre- or post-state of any
//! concurrent `put`, never a partial mix.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Async stream of checkpoint tuples returned by [`CheckpointSaver::list`]
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Storage contract for checkpoint backends.
///
/// Implementations must be `Send + Sync` and safe under concurrent
/// graph executions; each lineage is an independent history.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint body addressed by `config`.
    ///
    /// With an empty `checkpoint_id` this resolves to the latest
    /// checkpoint of the requested namespace, or the latest across all
    /// namespaces of the lineage when the namespace is empty too.
    /// A missing checkpoint is `None`, not an error.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Retrieve a checkpoint together with its metadata, parent config,
    /// and pending writes (ordered by sequence ascending).
    ///
    /// `parent_config.namespace` reflects the parent's *actual*
    /// namespace, which may differ from the child's (cross-namespace
    /// forks). When the advertised parent cannot be found, the parent
    /// config carries the id with an empty namespace.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints of a lineage, newest first.
    ///
    /// - `filter` is a subset match against `metadata.extra`.
    /// - `before` is an exclusive upper bound on the timestamp; with an
    ///   empty namespace it applies across every namespace of the
    ///   lineage.
    /// - `limit` caps the number of results.
    async fn list(
        &self,
        config: &CheckpointConfig,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Persist a checkpoint atomically and return the fully-resolved
    /// config (lineage, namespace, assigned checkpoint id).
    ///
    /// Must be safe to interleave with `put_writes` on the same
    /// `(lineage, namespace)`.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: Option<CheckpointMetadata>,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Atomically append writes to the checkpoint addressed by `config`.
    ///
    /// Writes with `sequence == 0` receive backend-assigned,
    /// monotonically increasing sequences starting at 0 within the
    /// batch; non-zero sequences are honored as given.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        task_id: &str,
        task_path: &[String],
    ) -> Result<()>;

    /// Single-round-trip `put` + `put_writes`.
    ///
    /// The checkpoint and its pending writes become visible together,
    /// and failure is atomic: if any write cannot be serialized, the
    /// checkpoint is not left behind.
    async fn put_full(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: Option<CheckpointMetadata>,
        new_versions: ChannelVersions,
        writes: Vec<PendingWrite>,
    ) -> Result<CheckpointConfig>;

    /// Remove every checkpoint, pending-write record, and namespace
    /// index entry of the lineage. A no-op for unknown lineages.
    async fn delete_lineage(&self, lineage_id: &str) -> Result<()>;
}
