//! Orchestrator seam.
//!
//! Orchestrators accept stack specifications and expose task, node and log
//! information for running services.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::stack::StackSpecification;

/// One scheduled container of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub service: String,
    pub node_id: Option<String>,
    pub slot: Option<i64>,
    pub state: String,
    pub desired_state: String,
    pub message: Option<String>,
    pub error: Option<String>,
    pub image: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub hostname: String,
    pub role: String,
    pub availability: String,
    pub state: String,
    pub address: Option<String>,
}

/// Options for fetching service logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Keep the stream open for new output.
    pub follow: bool,
    /// Number of lines from the end per container.
    pub tail: Option<u64>,
    /// Only output after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Raw multiplexed log bytes: 8-byte frame headers followed by
/// timestamp-prefixed payloads.
pub type RawLogStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Name of this orchestrator.
    fn name(&self) -> &'static str;

    /// Create or update the stack to match `spec`. Services missing from the
    /// spec are removed.
    async fn apply_stack(&self, stack: &str, spec: &StackSpecification) -> Result<()>;

    /// Tasks belonging to a stack service (`{stack}_{service}`).
    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskSummary>>;

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>>;

    /// Multiplexed log stream of every task of a service.
    async fn service_logs(&self, service: &str, options: LogOptions) -> Result<RawLogStream>;
}
