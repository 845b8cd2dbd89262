//! # flowgraph-core: Pregel-style stateful graph execution
//!
//! flowgraph executes user-defined directed graphs of computational
//! nodes in super-steps: all triggered nodes run in parallel, their
//! writes merge through typed channels, their state deltas commit
//! through per-key reducers, and every step persists a checkpoint so a
//! run can pause, resume, fork, and rewind. Nodes can raise
//! **interrupts**: first-class human-in-the-loop suspensions that
//! surface a value to the caller and later resume with an answer.
//!
//! ## Building and running a graph
//!
//! ```no_run
//! use flowgraph_core::graph::GraphBuilder;
//! use flowgraph_core::node::{node_fn, NodeKind, NodeOutput, END, START};
//! use flowgraph_core::runner::RunOptions;
//! use flowgraph_core::state::{StateSchema, ValueType};
//! use serde_json::json;
//!
//! # #[tokio::main] async fn main() -> flowgraph_core::error::Result<()> {
//! let mut schema = StateSchema::new();
//! schema.add_simple_field("greeting", ValueType::String);
//!
//! let greet = node_fn(|_snapshot, _ctx| async move {
//!     Ok(NodeOutput::update(json!({"greeting": "hello"})))
//! });
//!
//! let mut builder = GraphBuilder::new().with_schema(schema);
//! builder
//!     .add_node("greet", NodeKind::Function, greet)
//!     .add_edge(START, "greet")
//!     .add_edge("greet", END);
//! let graph = builder.compile()?;
//!
//! let state = graph.invoke(json!({}), RunOptions::new()).await?;
//! assert_eq!(state["greeting"], json!("hello"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`channels`] - versioned communication cells and their registry
//! - [`state`] - state schema, reducers, snapshots
//! - [`node`] - node trait, outputs, interrupt call site
//! - [`graph`] - builder, validation, compilation to channel topology
//! - [`pregel`] - the super-step scheduler
//! - [`event`] - the typed event stream
//! - [`runner`] - run/invoke entry points and options
//! - [`error`] - error taxonomy

pub mod channels;
pub mod error;
pub mod event;
pub mod graph;
pub mod node;
pub mod pregel;
pub mod runner;
pub mod state;

pub use channels::{Channel, ChannelBehavior, ChannelManager};
pub use error::{GraphError, InterruptSignal, Result};
pub use event::{EventStream, ExecutionEvent};
pub use graph::{CompiledGraph, GraphBuilder, INTERRUPT_CHANNEL};
pub use node::{node_fn, NodeContext, NodeHandler, NodeId, NodeKind, NodeOutput, END, START};
pub use pregel::InterruptRecord;
pub use runner::{ResumeValue, RunOptions};
pub use state::{
    AppendReducer, MergeMapReducer, OverwriteReducer, Reducer, StateSchema, StateSnapshot,
    UnionReducer, ValueType,
};
