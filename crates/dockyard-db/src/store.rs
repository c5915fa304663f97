//! Transactional record store.
//!
//! Every method is one transaction: multi-row writes (creating a service
//! with its first generation, forking a generation and repointing the
//! service, creating a project deployment with its per-service rows) either
//! apply completely or not at all.

use async_trait::async_trait;
use dockyard_core::ResourceId;
use dockyard_core::deployment::{
    Deployment, DeploymentStatus, ProjectDeployment, ProjectDeploymentStatus,
};
use dockyard_core::generation::Generation;
use dockyard_core::service::{Project, Service};

use crate::DbResult;

/// Per-service entry of a new project deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentEntry {
    pub service_id: ResourceId,
    pub generation_id: ResourceId,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Projects
    async fn create_project(&self, name: &str) -> DbResult<Project>;
    async fn get_project(&self, id: ResourceId) -> DbResult<Project>;
    async fn list_projects(&self) -> DbResult<Vec<Project>>;

    // Services and generations

    /// Insert a service and its first generation. The draft's ids are
    /// replaced; child records get fresh identities.
    async fn create_service(
        &self,
        project_id: ResourceId,
        name: &str,
        draft: Generation,
    ) -> DbResult<Service>;
    async fn get_service(&self, id: ResourceId) -> DbResult<Service>;
    async fn list_services(&self, project_id: ResourceId) -> DbResult<Vec<Service>>;
    async fn get_generation(&self, id: ResourceId) -> DbResult<Generation>;

    /// The service's latest generation if it may still be edited, otherwise
    /// a fork of it that becomes the new latest.
    async fn editable_generation(&self, service_id: ResourceId) -> DbResult<Generation>;

    /// Overwrite a mutable generation. Deployed generations and generations
    /// used by an unfinished deployment are rejected with `Conflict`.
    async fn update_generation(&self, generation: &Generation) -> DbResult<Generation>;

    /// Record `generation_id` as deployed with `image`. When it is still the
    /// latest generation a fresh latest is forked from it.
    async fn promote_generation(
        &self,
        service_id: ResourceId,
        generation_id: ResourceId,
        image: &str,
    ) -> DbResult<Service>;

    // Deployments

    /// Insert a project deployment and one `BuildPending` deployment per
    /// entry. Fails with `Conflict` while another one is in progress.
    async fn create_project_deployment(
        &self,
        project_id: ResourceId,
        entries: &[DeploymentEntry],
    ) -> DbResult<(ProjectDeployment, Vec<Deployment>)>;
    async fn get_project_deployment(&self, id: ResourceId) -> DbResult<ProjectDeployment>;
    async fn active_project_deployment(
        &self,
        project_id: ResourceId,
    ) -> DbResult<Option<ProjectDeployment>>;
    async fn finish_project_deployment(
        &self,
        id: ResourceId,
        status: ProjectDeploymentStatus,
        error: Option<&str>,
    ) -> DbResult<()>;

    async fn get_deployment(&self, id: ResourceId) -> DbResult<Deployment>;
    async fn list_deployments(&self, project_deployment_id: ResourceId)
    -> DbResult<Vec<Deployment>>;
    async fn update_deployment_status(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
    ) -> DbResult<()>;

    /// Write the final status together with the image and compressed logs.
    /// `None` leaves the stored value unchanged.
    async fn finish_deployment(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
        image: Option<&str>,
        build_logs: Option<Vec<u8>>,
    ) -> DbResult<()>;

    /// Fail every unfinished project deployment and deployment, storing
    /// `reason` on the project deployments and `build_logs` on deployments
    /// that have none yet. Only safe while nothing is working on them, i.e.
    /// at startup. Returns how many deployments were failed.
    async fn fail_interrupted(&self, reason: &str, build_logs: Vec<u8>) -> DbResult<usize>;

    /// Cheap liveness check of the backing storage.
    async fn ping(&self) -> DbResult<()>;
}
