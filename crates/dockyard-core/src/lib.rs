//! Core domain types and traits for the dockyard deployment platform.
//!
//! This crate contains:
//! - Resource identifiers and the shared error taxonomy
//! - Projects, services, generations and their child records
//! - Deployments and the build/deploy status machine
//! - The diff engine comparing deployed and latest generations
//! - Build backend and orchestrator traits
//! - Stack specification types

pub mod builder;
pub mod deployment;
pub mod diff;
pub mod error;
pub mod generation;
pub mod id;
pub mod log;
pub mod orchestrator;
pub mod service;
pub mod stack;

pub use error::{Error, Result};
pub use id::ResourceId;
