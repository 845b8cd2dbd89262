//! In-memory checkpoint backend
//!
//! [`InMemorySaver`] is the reference implementation of the
//! [`CheckpointSaver`] contract. It keeps every lineage in a
//! `tokio::sync::RwLock`-guarded map, which makes it suitable for
//! development, tests, and single-process runs; nothing survives a
//! restart. Every contract behavior (latest-in-namespace resolution,
//! cross-namespace parent lookup, sequence assignment for pending
//! writes, timestamp-ordered listing) is implemented faithfully, so
//! durable backends can be checked against it.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    writes: Vec<PendingWrite>,
    /// Per-lineage insertion ordinal, tie-break for equal timestamps
    ordinal: u64,
}

#[derive(Debug, Default)]
struct LineageStore {
    /// namespace -> checkpoints in insertion order
    namespaces: HashMap<String, Vec<StoredCheckpoint>>,
    next_ordinal: u64,
}

/// Thread-safe in-memory checkpoint store
#[derive(Debug, Clone, Default)]
pub struct InMemorySaver {
    lineages: Arc<RwLock<HashMap<String, LineageStore>>>,
}

impl InMemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lineages currently tracked
    pub async fn lineage_count(&self) -> usize {
        self.lineages.read().await.len()
    }

    /// Total checkpoints across every lineage and namespace
    pub async fn checkpoint_count(&self) -> usize {
        self.lineages
            .read()
            .await
            .values()
            .flat_map(|store| store.namespaces.values())
            .map(|entries| entries.len())
            .sum()
    }

    /// Drop everything (test isolation)
    pub async fn clear(&self) {
        self.lineages.write().await.clear();
    }

    fn require_lineage(config: &CheckpointConfig) -> Result<&str> {
        config
            .lineage_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CheckpointError::missing("lineage_id"))
    }

    /// Find a checkpoint by id, searching one namespace or all of them.
    fn find<'a>(
        store: &'a LineageStore,
        namespace: Option<&str>,
        id: &str,
    ) -> Option<(&'a str, &'a StoredCheckpoint)> {
        match namespace {
            Some(ns) => store
                .namespaces
                .get_key_value(ns)
                .and_then(|(key, entries)| {
                    entries
                        .iter()
                        .find(|entry| entry.checkpoint.id == id)
                        .map(|entry| (key.as_str(), entry))
                }),
            None => store.namespaces.iter().find_map(|(key, entries)| {
                entries
                    .iter()
                    .find(|entry| entry.checkpoint.id == id)
                    .map(|entry| (key.as_str(), entry))
            }),
        }
    }

    /// Latest checkpoint by `(timestamp, insertion ordinal)`.
    fn latest<'a>(
        store: &'a LineageStore,
        namespace: Option<&str>,
    ) -> Option<(&'a str, &'a StoredCheckpoint)> {
        let candidates: Box<dyn Iterator<Item = (&'a str, &'a StoredCheckpoint)> + '_> =
            match namespace {
                Some(ns) => match store.namespaces.get_key_value(ns) {
                    Some((key, entries)) => {
                        Box::new(entries.iter().map(move |entry| (key.as_str(), entry)))
                    }
                    None => Box::new(std::iter::empty()),
                },
                None => Box::new(store.namespaces.iter().flat_map(|(key, entries)| {
                    entries.iter().map(move |entry| (key.as_str(), entry))
                })),
            };

        candidates.max_by_key(|(_, entry)| (entry.checkpoint.ts, entry.ordinal))
    }

    fn tuple_for(
        lineage_id: &str,
        namespace: &str,
        entry: &StoredCheckpoint,
        store: &LineageStore,
    ) -> CheckpointTuple {
        let config = CheckpointConfig::new()
            .with_lineage_id(lineage_id)
            .with_namespace(namespace)
            .with_checkpoint_id(entry.checkpoint.id.clone());

        let parent_config = entry.checkpoint.parent_id.as_ref().map(|parent_id| {
            match Self::find(store, None, parent_id) {
                Some((parent_ns, _)) => CheckpointConfig::new()
                    .with_lineage_id(lineage_id)
                    .with_namespace(parent_ns)
                    .with_checkpoint_id(parent_id.clone()),
                // Advertised but not found: keep the id, leave the
                // namespace empty.
                None => CheckpointConfig::new()
                    .with_lineage_id(lineage_id)
                    .with_checkpoint_id(parent_id.clone()),
            }
        });

        let mut tuple = CheckpointTuple::new(config, entry.checkpoint.clone(), entry.metadata.clone())
            .with_pending_writes(entry.writes.clone());
        tuple.parent_config = parent_config;
        tuple
    }

    fn append_writes(
        entry: &mut StoredCheckpoint,
        mut writes: Vec<PendingWrite>,
        task_id: &str,
        task_path: &[String],
    ) {
        let mut next = entry
            .writes
            .iter()
            .map(|w| w.sequence + 1)
            .max()
            .unwrap_or(0);

        for write in &mut writes {
            write.task_id = task_id.to_string();
            write.task_path = task_path.to_vec();
            if write.sequence == 0 {
                write.sequence = next;
                next += 1;
            }
        }
        entry.writes.extend(writes);
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let lineage_id = Self::require_lineage(config)?;
        let lineages = self.lineages.read().await;

        let Some(store) = lineages.get(lineage_id) else {
            return Ok(None);
        };

        // An empty namespace widens the search to every namespace of
        // the lineage; an empty checkpoint id means "the latest".
        let namespace = config.namespace.as_deref().filter(|ns| !ns.is_empty());
        let checkpoint_id = config.checkpoint_id.as_deref().filter(|id| !id.is_empty());

        let found = match checkpoint_id {
            Some(id) => Self::find(store, namespace, id),
            None => Self::latest(store, namespace),
        };

        Ok(found.map(|(ns, entry)| Self::tuple_for(lineage_id, ns, entry, store)))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let lineage_id = Self::require_lineage(config)?;
        let lineages = self.lineages.read().await;

        let mut matched: Vec<(DateTime<Utc>, u64, CheckpointTuple)> = Vec::new();

        if let Some(store) = lineages.get(lineage_id) {
            let namespace = config.namespace.as_deref().filter(|ns| !ns.is_empty());

            for (ns, entries) in &store.namespaces {
                if namespace.is_some_and(|wanted| wanted != ns) {
                    continue;
                }
                for entry in entries {
                    if before.is_some_and(|bound| entry.checkpoint.ts >= bound) {
                        continue;
                    }
                    if let Some(predicates) = &filter {
                        let matches = predicates
                            .iter()
                            .all(|(key, value)| entry.metadata.extra.get(key) == Some(value));
                        if !matches {
                            continue;
                        }
                    }
                    matched.push((
                        entry.checkpoint.ts,
                        entry.ordinal,
                        Self::tuple_for(lineage_id, ns, entry, store),
                    ));
                }
            }
        }

        // Newest first.
        matched.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        if let Some(limit) = limit {
            matched.truncate(limit);
        }

        let results: Vec<Result<CheckpointTuple>> =
            matched.into_iter().map(|(_, _, tuple)| Ok(tuple)).collect();
        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: Option<CheckpointMetadata>,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        self.put_full(config, checkpoint, metadata, new_versions, Vec::new())
            .await
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        task_id: &str,
        task_path: &[String],
    ) -> Result<()> {
        let lineage_id = Self::require_lineage(config)?.to_string();
        let checkpoint_id = config
            .checkpoint_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CheckpointError::missing("checkpoint_id"))?
            .to_string();

        let mut lineages = self.lineages.write().await;
        let store = lineages
            .get_mut(&lineage_id)
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        let namespace = config.namespace.as_deref().filter(|ns| !ns.is_empty());
        let entry = match namespace {
            Some(ns) => store
                .namespaces
                .get_mut(ns)
                .and_then(|entries| {
                    entries
                        .iter_mut()
                        .find(|entry| entry.checkpoint.id == checkpoint_id)
                }),
            None => store.namespaces.values_mut().find_map(|entries| {
                entries
                    .iter_mut()
                    .find(|entry| entry.checkpoint.id == checkpoint_id)
            }),
        }
        .ok_or(CheckpointError::NotFound(checkpoint_id))?;

        Self::append_writes(entry, writes, task_id, task_path);
        Ok(())
    }

    async fn put_full(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: Option<CheckpointMetadata>,
        _new_versions: ChannelVersions,
        writes: Vec<PendingWrite>,
    ) -> Result<CheckpointConfig> {
        let lineage_id = Self::require_lineage(config)?.to_string();
        let namespace = config.namespace_or_default().to_string();

        if checkpoint.ts_is_zero() {
            checkpoint.ts = Utc::now();
        }
        let metadata = metadata.unwrap_or_else(CheckpointMetadata::default_for_put);

        let resolved = CheckpointConfig::new()
            .with_lineage_id(lineage_id.clone())
            .with_namespace(namespace.clone())
            .with_checkpoint_id(checkpoint.id.clone());

        // Single critical section: the checkpoint and its writes become
        // visible together.
        let mut lineages = self.lineages.write().await;
        let store = lineages.entry(lineage_id).or_default();
        let ordinal = store.next_ordinal;
        store.next_ordinal += 1;

        let mut entry = StoredCheckpoint {
            checkpoint,
            metadata,
            writes: Vec::new(),
            ordinal,
        };
        // Writes arriving through put_full keep their own task ids.
        let grouped: HashMap<(String, Vec<String>), Vec<PendingWrite>> =
            writes.into_iter().fold(HashMap::new(), |mut acc, write| {
                acc.entry((write.task_id.clone(), write.task_path.clone()))
                    .or_default()
                    .push(write);
                acc
            });
        let mut groups: Vec<_> = grouped.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        for ((task_id, task_path), batch) in groups {
            Self::append_writes(&mut entry, batch, &task_id, &task_path);
        }

        store.namespaces.entry(namespace).or_default().push(entry);
        Ok(resolved)
    }

    async fn delete_lineage(&self, lineage_id: &str) -> Result<()> {
        self.lineages.write().await.remove(lineage_id);
        Ok(())
    }
}
