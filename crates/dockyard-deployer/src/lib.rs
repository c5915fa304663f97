//! Deployment side of dockyard.
//!
//! - [`stack`] turns service releases into a stack specification
//! - [`swarm`] applies stacks and reads tasks, nodes and logs from a
//!   swarm-mode engine
//! - [`logs`] demultiplexes and orders runtime container output

pub mod engine;
pub mod logs;
pub mod stack;
pub mod swarm;

pub use stack::assemble_stack;
pub use swarm::SwarmOrchestrator;

pub use dockyard_core::orchestrator::{
    LogOptions, NodeSummary, Orchestrator, RawLogStream, TaskSummary,
};
