//! Graph builder and compile-time validation

use super::{
    branch_channel, is_reserved_channel, join_channel, ChannelDef, CompiledGraph, ConditionalEdge,
    NodeSpec, RouterFn,
};
use crate::channels::ChannelBehavior;
use crate::error::{GraphError, Result};
use crate::node::{NodeHandler, NodeId, NodeKind, END, START};
use crate::state::{StateSchema, StateSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Mutable builder for a graph; `compile` freezes it into a
/// [`CompiledGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    schema: StateSchema,
    nodes: HashMap<NodeId, NodeSpec>,
    edges: Vec<(NodeId, NodeId)>,
    conditional: HashMap<NodeId, ConditionalEdge>,
    entry: Option<NodeId>,
    extra_channels: Vec<ChannelDef>,
    subscriptions: Vec<(String, NodeId)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        kind: NodeKind,
        handler: Arc<dyn NodeHandler>,
    ) -> &mut Self {
        let id = id.into();
        self.nodes.insert(
            id.clone(),
            NodeSpec { id, kind, handler },
        );
        self
    }

    /// Plain edge. `add_edge(START, n)` sets the entry point.
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        let (from, to) = (from.into(), to.into());
        if from == START {
            self.entry = Some(to);
        } else {
            self.edges.push((from, to));
        }
        self
    }

    /// Conditional edges out of `from`: `router` inspects the committed
    /// state and returns a branch key translated through `branches`
    /// (or, with an empty map, a node id directly).
    pub fn add_conditional_edges<F>(
        &mut self,
        from: impl Into<NodeId>,
        router: F,
        branches: HashMap<String, NodeId>,
    ) -> &mut Self
    where
        F: Fn(&StateSnapshot) -> String + Send + Sync + 'static,
    {
        self.conditional.insert(
            from.into(),
            ConditionalEdge {
                router: Arc::new(router) as Arc<RouterFn>,
                branches,
            },
        );
        self
    }

    pub fn set_entry_point(&mut self, id: impl Into<NodeId>) -> &mut Self {
        self.entry = Some(id.into());
        self
    }

    /// Declare an application channel nodes can write to through
    /// `NodeOutput::with_write`.
    pub fn add_channel(&mut self, name: impl Into<String>, behavior: ChannelBehavior) -> &mut Self {
        self.extra_channels.push(ChannelDef {
            name: name.into(),
            behavior,
            expected: Vec::new(),
        });
        self
    }

    /// Declare a barrier channel with its expected sender set.
    pub fn add_barrier_channel(
        &mut self,
        name: impl Into<String>,
        expected: impl IntoIterator<Item = String>,
    ) -> &mut Self {
        self.extra_channels.push(ChannelDef {
            name: name.into(),
            behavior: ChannelBehavior::Barrier,
            expected: expected.into_iter().collect(),
        });
        self
    }

    /// Subscribe `node` to a declared application channel: updates to
    /// the channel trigger the node in the next super-step.
    pub fn add_trigger(&mut self, channel: impl Into<String>, node: impl Into<NodeId>) -> &mut Self {
        self.subscriptions.push((channel.into(), node.into()));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(GraphError::Validation("graph has no nodes".into()));
        }

        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| GraphError::Validation("entry point is not set".into()))?;
        if !self.nodes.contains_key(entry) {
            return Err(GraphError::Validation(format!(
                "entry point '{entry}' is not a registered node"
            )));
        }

        for (from, to) in &self.edges {
            if from == END {
                return Err(GraphError::Validation("edge starts at __end__".into()));
            }
            if !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{from}' is not a registered node"
                )));
            }
            if to != END && !self.nodes.contains_key(to) {
                return Err(GraphError::Validation(format!(
                    "edge target '{to}' is not a registered node"
                )));
            }
        }

        for (from, edge) in &self.conditional {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "conditional edge source '{from}' is not a registered node"
                )));
            }
            for target in edge.branches.values() {
                if target != END && !self.nodes.contains_key(target) {
                    return Err(GraphError::Validation(format!(
                        "conditional branch target '{target}' is not a registered node"
                    )));
                }
            }
        }

        for def in &self.extra_channels {
            if is_reserved_channel(&def.name) {
                return Err(GraphError::Validation(format!(
                    "channel name '{}' is reserved",
                    def.name
                )));
            }
        }

        for (channel, node) in &self.subscriptions {
            if !self.extra_channels.iter().any(|def| &def.name == channel) {
                return Err(GraphError::Validation(format!(
                    "trigger references undeclared channel '{channel}'"
                )));
            }
            if !self.nodes.contains_key(node) {
                return Err(GraphError::Validation(format!(
                    "trigger references unknown node '{node}'"
                )));
            }
        }

        Ok(())
    }

    /// Validate and freeze the graph, deriving the channel topology.
    pub fn compile(self) -> Result<CompiledGraph> {
        self.validate()?;

        let entry = self.entry.clone().expect("validated");
        let mut defs: Vec<ChannelDef> = self.extra_channels.clone();
        let mut triggers: BTreeMap<NodeId, BTreeSet<String>> = BTreeMap::new();
        let mut direct_targets: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        // Plain edges. A fan-in of two or more sources becomes a single
        // barrier expecting every source; a single edge becomes a
        // LastValue trigger channel.
        let mut incoming: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (from, to) in &self.edges {
            direct_targets
                .entry(from.clone())
                .or_default()
                .push(to.clone());
            if to != END {
                incoming.entry(to.clone()).or_default().insert(from.clone());
            }
        }
        for targets in direct_targets.values_mut() {
            targets.sort();
            targets.dedup();
        }

        for (to, froms) in &incoming {
            if froms.len() >= 2 {
                let name = join_channel(to);
                defs.push(ChannelDef {
                    name: name.clone(),
                    behavior: ChannelBehavior::Barrier,
                    expected: froms.iter().cloned().collect(),
                });
                triggers.entry(to.clone()).or_default().insert(name);
            } else {
                let from = froms.iter().next().expect("nonempty");
                let name = branch_channel(from, to);
                defs.push(ChannelDef {
                    name: name.clone(),
                    behavior: ChannelBehavior::LastValue,
                    expected: Vec::new(),
                });
                triggers.entry(to.clone()).or_default().insert(name);
            }
        }

        // Conditional edges and router nodes: one LastValue channel per
        // possible target. An empty branch map (or a bare router node)
        // may route anywhere, so every node is a possible target.
        let all_nodes: Vec<NodeId> = {
            let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
            ids.sort();
            ids
        };
        let mut dynamic_sources: Vec<(NodeId, Vec<NodeId>, bool)> = Vec::new();
        for (from, edge) in &self.conditional {
            let (targets, implicit) = if edge.branches.is_empty() {
                (all_nodes.clone(), true)
            } else {
                let mut targets: Vec<NodeId> = edge
                    .branches
                    .values()
                    .filter(|t| t.as_str() != END)
                    .cloned()
                    .collect();
                targets.sort();
                targets.dedup();
                (targets, false)
            };
            dynamic_sources.push((from.clone(), targets, implicit));
        }
        for spec in self.nodes.values() {
            if spec.kind == NodeKind::Router && !self.conditional.contains_key(&spec.id) {
                dynamic_sources.push((spec.id.clone(), all_nodes.clone(), true));
            }
        }
        dynamic_sources.sort_by(|a, b| a.0.cmp(&b.0));
        for (from, targets, implicit) in dynamic_sources {
            for to in targets {
                if implicit && to == from && self.nodes.len() > 1 {
                    // The all-nodes default skips the self-target;
                    // explicit branch maps keep self-loops.
                    continue;
                }
                let name = branch_channel(&from, &to);
                if !defs.iter().any(|def| def.name == name) {
                    defs.push(ChannelDef {
                        name: name.clone(),
                        behavior: ChannelBehavior::LastValue,
                        expected: Vec::new(),
                    });
                }
                triggers.entry(to.clone()).or_default().insert(name);
            }
        }

        for (channel, node) in &self.subscriptions {
            triggers
                .entry(node.clone())
                .or_default()
                .insert(channel.clone());
        }

        let node_triggers: HashMap<NodeId, Vec<String>> = triggers
            .into_iter()
            .map(|(node, set)| (node, set.into_iter().collect()))
            .collect();

        let mut trigger_to_nodes: HashMap<String, Vec<NodeId>> = HashMap::new();
        for (node, channels) in &node_triggers {
            for channel in channels {
                trigger_to_nodes
                    .entry(channel.clone())
                    .or_default()
                    .push(node.clone());
            }
        }
        for nodes in trigger_to_nodes.values_mut() {
            nodes.sort();
        }

        Ok(CompiledGraph {
            schema: Arc::new(self.schema),
            nodes: self.nodes,
            entry,
            channel_defs: defs,
            node_triggers,
            trigger_to_nodes,
            direct_targets,
            conditional: self.conditional,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeOutput};

    fn noop() -> Arc<dyn NodeHandler> {
        node_fn(|_, _| async { Ok(NodeOutput::new()) })
    }

    fn two_node_builder() -> GraphBuilder {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("a", NodeKind::Function, noop())
            .add_node("b", NodeKind::Function, noop())
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END);
        builder
    }

    #[test]
    fn linear_graph_compiles_to_branch_channels() {
        let graph = two_node_builder().compile().unwrap();

        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.triggers_of("b"), &[branch_channel("a", "b")]);
        assert_eq!(graph.nodes_triggered_by(&branch_channel("a", "b")), &["b".to_string()]);
        assert_eq!(graph.direct_targets_of("b"), &[END.to_string()]);
    }

    #[test]
    fn fan_in_becomes_a_barrier() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("a", NodeKind::Function, noop())
            .add_node("b", NodeKind::Function, noop())
            .add_node("sink", NodeKind::Function, noop())
            .add_edge(START, "a")
            .add_edge("a", "sink")
            .add_edge("b", "sink");
        let graph = builder.compile().unwrap();

        let join = join_channel("sink");
        assert_eq!(graph.triggers_of("sink"), &[join.clone()]);
        let def = graph
            .channel_defs
            .iter()
            .find(|def| def.name == join)
            .unwrap();
        assert_eq!(def.behavior, ChannelBehavior::Barrier);
        assert_eq!(def.expected, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn conditional_edges_cover_branch_targets() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("router", NodeKind::Function, noop())
            .add_node("yes", NodeKind::Function, noop())
            .add_node("no", NodeKind::Function, noop())
            .add_edge(START, "router")
            .add_conditional_edges(
                "router",
                |_s| "approve".to_string(),
                HashMap::from([
                    ("approve".to_string(), "yes".to_string()),
                    ("reject".to_string(), "no".to_string()),
                ]),
            );
        let graph = builder.compile().unwrap();

        assert_eq!(graph.triggers_of("yes"), &[branch_channel("router", "yes")]);
        assert_eq!(graph.triggers_of("no"), &[branch_channel("router", "no")]);
    }

    #[test]
    fn missing_entry_is_a_validation_error() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", NodeKind::Function, noop());
        let err = builder.compile().unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn unknown_edge_target_is_a_validation_error() {
        let mut builder = two_node_builder();
        builder.add_edge("b", "ghost");
        let err = builder.compile().unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn reserved_channel_names_are_rejected() {
        let mut builder = two_node_builder();
        builder.add_channel(super::super::INTERRUPT_CHANNEL, ChannelBehavior::Topic);
        let err = builder.compile().unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn subscriptions_require_declared_channels() {
        let mut builder = two_node_builder();
        builder.add_trigger("undeclared", "b");
        let err = builder.compile().unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn conditional_resolution_uses_branch_map_then_raw_key() {
        let edge = ConditionalEdge {
            router: Arc::new(|_s: &StateSnapshot| "k".to_string()),
            branches: HashMap::from([("k".to_string(), "target".to_string())]),
        };
        let snapshot = StateSnapshot::default();
        assert_eq!(edge.resolve(&snapshot), "target");

        let bare = ConditionalEdge {
            router: Arc::new(|_s: &StateSnapshot| "direct".to_string()),
            branches: HashMap::new(),
        };
        assert_eq!(bare.resolve(&snapshot), "direct");
    }
}
