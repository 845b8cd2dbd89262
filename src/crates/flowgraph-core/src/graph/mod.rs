//! Graph definition and compilation
//!
//! A graph is a set of nodes, plain and conditional edges, an entry
//! point, and a state schema. Compilation is where edges become
//! channels: each plain edge gets a `LastValue` trigger channel, a
//! fan-in of two or more plain edges collapses into one `Barrier`
//! channel expecting every source, and conditional edges get one
//! `LastValue` channel per possible target. The compiled artifact is
//! immutable and shared read-only across runs.

mod builder;

pub use builder::GraphBuilder;

use crate::channels::{ChannelBehavior, ChannelManager};
use crate::node::{NodeHandler, NodeId, NodeKind};
use crate::state::{StateSchema, StateSnapshot};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reserved channel carrying serialized interrupt records inside a
/// checkpoint's pending writes.
pub const INTERRUPT_CHANNEL: &str = "__interrupt__";

/// Channel-name prefix for plain-edge trigger channels
pub const BRANCH_PREFIX: &str = "branch:";
/// Channel-name prefix for fan-in barrier channels
pub const JOIN_PREFIX: &str = "join:";

/// Whether a channel name is owned by the engine.
pub fn is_reserved_channel(name: &str) -> bool {
    name.starts_with(BRANCH_PREFIX)
        || name.starts_with(JOIN_PREFIX)
        || matches!(name, INTERRUPT_CHANNEL | crate::node::START | crate::node::END)
}

/// Trigger channel name for the plain edge `from -> to`.
pub fn branch_channel(from: &str, to: &str) -> String {
    format!("{BRANCH_PREFIX}{from}:{to}")
}

/// Barrier channel name for a fan-in into `to`.
pub fn join_channel(to: &str) -> String {
    format!("{JOIN_PREFIX}{to}")
}

/// Router function of a conditional edge: maps the committed state to a
/// branch key (or directly to a node id when no branch map is given).
pub type RouterFn = dyn Fn(&StateSnapshot) -> String + Send + Sync;

/// A node registered in the graph
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    pub handler: Arc<dyn NodeHandler>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Conditional edge: router plus branch-key -> target translation.
/// An empty branch map means the router's return value is itself the
/// target node id.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub router: Arc<RouterFn>,
    pub branches: HashMap<String, NodeId>,
}

impl ConditionalEdge {
    /// Resolve the router's verdict to a target node id.
    pub fn resolve(&self, snapshot: &StateSnapshot) -> NodeId {
        let key = (self.router)(snapshot);
        match self.branches.get(&key) {
            Some(target) => target.clone(),
            None => key,
        }
    }
}

impl fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("branches", &self.branches)
            .finish()
    }
}

/// A channel the compiled graph materializes at run start
#[derive(Debug, Clone)]
pub struct ChannelDef {
    pub name: String,
    pub behavior: ChannelBehavior,
    /// Barrier only: expected sender ids
    pub expected: Vec<String>,
}

/// Immutable, executable form of a graph. Cloning is cheap enough to
/// share one compiled graph across concurrent runs: handlers, routers,
/// and the schema sit behind `Arc`s.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub(crate) schema: Arc<StateSchema>,
    pub(crate) nodes: HashMap<NodeId, NodeSpec>,
    pub(crate) entry: NodeId,
    pub(crate) channel_defs: Vec<ChannelDef>,
    /// node -> channels that trigger it
    pub(crate) node_triggers: HashMap<NodeId, Vec<String>>,
    /// channel -> nodes it triggers
    pub(crate) trigger_to_nodes: HashMap<String, Vec<NodeId>>,
    /// node -> plain-edge successors (END included)
    pub(crate) direct_targets: HashMap<NodeId, Vec<NodeId>>,
    pub(crate) conditional: HashMap<NodeId, ConditionalEdge>,
}

impl CompiledGraph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Channels that trigger `node`, sorted for determinism.
    pub fn triggers_of(&self, node: &str) -> &[String] {
        self.node_triggers
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn nodes_triggered_by(&self, channel: &str) -> &[NodeId] {
        self.trigger_to_nodes
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn conditional_edge(&self, node: &str) -> Option<&ConditionalEdge> {
        self.conditional.get(node)
    }

    pub fn direct_targets_of(&self, node: &str) -> &[NodeId] {
        self.direct_targets
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The channel write announcing that `from` completed, addressed to
    /// its plain-edge successor `to`. Fan-in targets take the sender id
    /// on their barrier; everything else takes it on the edge's branch
    /// channel.
    pub(crate) fn edge_write(&self, from: &str, to: &str) -> (String, serde_json::Value) {
        let join = join_channel(to);
        if self.trigger_to_nodes.contains_key(&join) {
            (join, serde_json::Value::String(from.to_string()))
        } else {
            (
                branch_channel(from, to),
                serde_json::Value::String(from.to_string()),
            )
        }
    }

    /// Materialize every declared channel into a fresh manager.
    pub fn build_channels(&self, manager: &ChannelManager) {
        for def in &self.channel_defs {
            match def.behavior {
                ChannelBehavior::Barrier => {
                    manager.add_barrier(&def.name, def.expected.iter().cloned());
                }
                behavior => {
                    manager.add_channel(&def.name, behavior);
                }
            }
        }
    }
}
