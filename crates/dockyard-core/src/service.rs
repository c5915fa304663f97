//! Projects and services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// A group of services deployed together as one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    /// Slug; doubles as the stack namespace on the orchestrator.
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A named deployable unit inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub name: String,
    /// Always resolves to an existing generation.
    pub latest_generation_id: ResourceId,
    /// Unset until the first successful deploy.
    pub deployed_generation_id: Option<ResourceId>,
    /// Image reference last applied to the orchestrator.
    pub deployed_image: Option<String>,
    #[serde(skip_serializing)]
    pub redeploy_secret: String,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn is_deployed(&self) -> bool {
        self.deployed_generation_id.is_some()
    }

    /// Random secret accepted by the redeploy webhook.
    pub fn generate_redeploy_secret() -> String {
        format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        )
    }
}

/// Project and service names end up in stack, service and image names, so
/// they are restricted to lowercase DNS-label characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
