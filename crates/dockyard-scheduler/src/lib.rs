//! Build scheduling and deploy coordination for dockyard.
//!
//! Runs build tasks under a concurrency bound, drives each deployment
//! through its status machine and streams build and runtime logs.

pub mod context;
pub mod coordinator;
pub mod logstream;
pub mod scheduler;
pub mod status;
pub mod task;

#[cfg(test)]
mod testing;

pub use context::Context;
pub use coordinator::{DeployHandle, DeploymentCoordinator, ServiceDiff};
pub use logstream::{LogStream, LogStreams};
pub use scheduler::{BuildScheduler, TaskHandle};
pub use status::StatusWriter;
pub use task::BuildTask;
