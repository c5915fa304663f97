//! Deployment records and the build/deploy status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ResourceId;
use crate::generation::ParseEnumError;

/// Lifecycle of one build/deploy attempt.
///
/// ```text
/// BuildPending -> Building -> Deploying -> Success
///      |             |            |
///      +-------------+------------+------> Failed
/// BuildPending -> Deploying              (non-buildable sources)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    BuildPending,
    Building,
    Deploying,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::BuildPending => "build_pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (BuildPending, Building)
                | (BuildPending, Deploying)
                | (BuildPending, Failed)
                | (Building, Deploying)
                | (Building, Failed)
                | (Deploying, Success)
                | (Deploying, Failed)
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build_pending" => Ok(DeploymentStatus::BuildPending),
            "building" => Ok(DeploymentStatus::Building),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "success" => Ok(DeploymentStatus::Success),
            "failed" => Ok(DeploymentStatus::Failed),
            other => Err(ParseEnumError {
                kind: "deployment status",
                value: other.to_string(),
            }),
        }
    }
}

/// One build/deploy attempt for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: ResourceId,
    pub service_id: ResourceId,
    pub generation_id: ResourceId,
    pub project_deployment_id: Option<ResourceId>,
    pub status: DeploymentStatus,
    /// Image reference produced by the build (or the registry image).
    pub image: Option<String>,
    /// Brotli-compressed NDJSON build log, present once the attempt ends.
    #[serde(skip)]
    pub build_logs: Option<Vec<u8>>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(
        service_id: ResourceId,
        generation_id: ResourceId,
        project_deployment_id: Option<ResourceId>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            service_id,
            generation_id,
            project_deployment_id,
            status: DeploymentStatus::BuildPending,
            image: None,
            build_logs: None,
            deployed_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectDeploymentStatus {
    InProgress,
    Success,
    Failed,
}

impl ProjectDeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectDeploymentStatus::InProgress => "in_progress",
            ProjectDeploymentStatus::Success => "success",
            ProjectDeploymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProjectDeploymentStatus::InProgress)
    }
}

impl FromStr for ProjectDeploymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(ProjectDeploymentStatus::InProgress),
            "success" => Ok(ProjectDeploymentStatus::Success),
            "failed" => Ok(ProjectDeploymentStatus::Failed),
            other => Err(ParseEnumError {
                kind: "project deployment status",
                value: other.to_string(),
            }),
        }
    }
}

/// Aggregate of the per-service deployments triggered together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDeployment {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub status: ProjectDeploymentStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(BuildPending.can_transition_to(Building));
        assert!(Building.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Success));
        assert!(BuildPending.can_transition_to(Deploying));
    }

    #[test]
    fn test_no_backwards_or_skipping_transitions() {
        assert!(!Building.can_transition_to(BuildPending));
        assert!(!BuildPending.can_transition_to(Success));
        assert!(!Building.can_transition_to(Success));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Building));
    }

    #[test]
    fn test_status_strings() {
        for status in [BuildPending, Building, Deploying, Success, Failed] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!("queued".parse::<DeploymentStatus>().is_err());
    }
}
