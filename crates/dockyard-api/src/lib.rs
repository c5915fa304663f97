//! HTTP API server for dockyard.
//!
//! Exposes deploys, diffs, build and runtime log streams (server-sent
//! events), cluster listings and the redeploy webhook.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
