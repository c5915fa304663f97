//! Build pipeline building blocks for dockyard.
//!
//! - [`BuildLogger`]: append-only NDJSON log behind every build
//! - [`archive`]: brotli compression of finished logs
//! - [`git`]: shallow clones of service sources
//! - [`LocalBuildBackend`]: Dockerfile, buildpack and nixpacks builds via
//!   the local toolchain

pub mod archive;
pub mod git;
pub mod local;
pub mod logger;
pub mod process;

pub use local::{LocalBuildBackend, image_reference};
pub use logger::BuildLogger;
