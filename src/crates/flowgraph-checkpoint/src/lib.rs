//! Checkpoint persistence for the flowgraph execution engine
//!
//! This crate defines the durable-state half of the engine: the
//! checkpoint data model ([`Checkpoint`], [`CheckpointTuple`],
//! [`PendingWrite`]), the pluggable storage contract
//! ([`CheckpointSaver`]), a serializer protocol, and the in-memory
//! reference backend ([`InMemorySaver`]).
//!
//! Checkpoints let a graph execution pause, resume, fork, and rewind:
//! the scheduler persists one checkpoint per super-step, and a later
//! run rehydrates channels and state from the latest checkpoint of a
//! lineage. Suspended work (human-in-the-loop interrupts) travels in
//! the checkpoint's pending writes, so replaying a checkpoint re-raises
//! the interrupt atomically.
//!
//! # Module organization
//!
//! - [`checkpoint`] - Data model: checkpoints, configs, metadata, writes
//! - [`traits`] - The [`CheckpointSaver`] storage contract
//! - [`memory`] - In-memory reference backend
//! - [`serializer`] - Encoding protocol for backend payloads
//! - [`error`] - Error types

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemorySaver;
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
