//! In-memory store.
//!
//! An arena of records keyed by id. A single lock guards the whole arena, so
//! every method observes and applies a consistent snapshot, the same way a
//! database transaction would.

use async_trait::async_trait;
use chrono::Utc;
use dockyard_core::ResourceId;
use dockyard_core::deployment::{
    Deployment, DeploymentStatus, ProjectDeployment, ProjectDeploymentStatus,
};
use dockyard_core::generation::Generation;
use dockyard_core::service::{Project, Service, is_valid_name};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::store::{DeploymentEntry, Store};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Arena {
    projects: HashMap<ResourceId, Project>,
    services: HashMap<ResourceId, Service>,
    generations: HashMap<ResourceId, Generation>,
    project_deployments: HashMap<ResourceId, ProjectDeployment>,
    deployments: HashMap<ResourceId, Deployment>,
    /// Every status ever written per deployment, in write order.
    history: HashMap<ResourceId, Vec<DeploymentStatus>>,
}

impl Arena {
    fn service(&self, id: ResourceId) -> DbResult<&Service> {
        self.services
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("service {}", id)))
    }

    fn generation(&self, id: ResourceId) -> DbResult<&Generation> {
        self.generations
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("generation {}", id)))
    }

    fn deployment_mut(&mut self, id: ResourceId) -> DbResult<&mut Deployment> {
        self.deployments
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("deployment {}", id)))
    }

    /// Deployed, or referenced by a deployment that has not finished.
    fn is_frozen(&self, generation_id: ResourceId) -> bool {
        self.services
            .values()
            .any(|s| s.deployed_generation_id == Some(generation_id))
            || self
                .deployments
                .values()
                .any(|d| d.generation_id == generation_id && !d.status.is_terminal())
    }

    fn fork_latest(&mut self, service_id: ResourceId) -> DbResult<Generation> {
        let latest_id = self.service(service_id)?.latest_generation_id;
        let fork = self.generation(latest_id)?.fork();
        self.generations.insert(fork.id, fork.clone());
        if let Some(service) = self.services.get_mut(&service_id) {
            service.latest_generation_id = fork.id;
        }
        Ok(fork)
    }

    fn record_status(&mut self, id: ResourceId, status: DeploymentStatus) -> DbResult<()> {
        let deployment = self.deployment_mut(id)?;
        deployment.status = status;
        if status == DeploymentStatus::Success {
            deployment.deployed_at = Some(Utc::now());
        }
        self.history.entry(id).or_default().push(status);
        Ok(())
    }
}

/// Arena-backed [`Store`] used by tests and single-node development setups.
#[derive(Default)]
pub struct MemoryStore {
    arena: Mutex<Arena>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses written for a deployment, oldest first.
    pub async fn status_history(&self, deployment_id: ResourceId) -> Vec<DeploymentStatus> {
        self.arena
            .lock()
            .await
            .history
            .get(&deployment_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        if !is_valid_name(name) {
            return Err(DbError::InvalidData(format!("invalid project name '{}'", name)));
        }
        let mut arena = self.arena.lock().await;
        if arena.projects.values().any(|p| p.name == name) {
            return Err(DbError::Conflict(format!("project {} already exists", name)));
        }
        let project = Project {
            id: ResourceId::new(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        arena.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        self.arena
            .lock()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }

    async fn list_projects(&self) -> DbResult<Vec<Project>> {
        let arena = self.arena.lock().await;
        let mut projects: Vec<Project> = arena.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn create_service(
        &self,
        project_id: ResourceId,
        name: &str,
        draft: Generation,
    ) -> DbResult<Service> {
        if !is_valid_name(name) {
            return Err(DbError::InvalidData(format!("invalid service name '{}'", name)));
        }
        let mut arena = self.arena.lock().await;
        if !arena.projects.contains_key(&project_id) {
            return Err(DbError::NotFound(format!("project {}", project_id)));
        }
        if arena
            .services
            .values()
            .any(|s| s.project_id == project_id && s.name == name)
        {
            return Err(DbError::Conflict(format!("service {} already exists", name)));
        }

        let service_id = ResourceId::new();
        let mut generation = Generation {
            id: ResourceId::new(),
            service_id,
            created_at: Utc::now(),
            ..draft
        };
        generation.assign_child_ids();

        let service = Service {
            id: service_id,
            project_id,
            name: name.to_string(),
            latest_generation_id: generation.id,
            deployed_generation_id: None,
            deployed_image: None,
            redeploy_secret: Service::generate_redeploy_secret(),
            created_at: Utc::now(),
        };
        arena.generations.insert(generation.id, generation);
        arena.services.insert(service.id, service.clone());
        Ok(service)
    }

    async fn get_service(&self, id: ResourceId) -> DbResult<Service> {
        self.arena.lock().await.service(id).cloned()
    }

    async fn list_services(&self, project_id: ResourceId) -> DbResult<Vec<Service>> {
        let arena = self.arena.lock().await;
        let mut services: Vec<Service> = arena
            .services
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn get_generation(&self, id: ResourceId) -> DbResult<Generation> {
        self.arena.lock().await.generation(id).cloned()
    }

    async fn editable_generation(&self, service_id: ResourceId) -> DbResult<Generation> {
        let mut arena = self.arena.lock().await;
        let latest_id = arena.service(service_id)?.latest_generation_id;
        if arena.is_frozen(latest_id) {
            arena.fork_latest(service_id)
        } else {
            arena.generation(latest_id).cloned()
        }
    }

    async fn update_generation(&self, generation: &Generation) -> DbResult<Generation> {
        let mut arena = self.arena.lock().await;
        let stored = arena.generation(generation.id)?;
        if stored.service_id != generation.service_id {
            return Err(DbError::InvalidData(
                "generation cannot move between services".to_string(),
            ));
        }
        if arena.is_frozen(generation.id) {
            return Err(DbError::Conflict(format!(
                "generation {} is deployed or being deployed",
                generation.id
            )));
        }
        let mut updated = generation.clone();
        updated.assign_child_ids();
        arena.generations.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn promote_generation(
        &self,
        service_id: ResourceId,
        generation_id: ResourceId,
        image: &str,
    ) -> DbResult<Service> {
        let mut arena = self.arena.lock().await;
        if arena.generation(generation_id)?.service_id != service_id {
            return Err(DbError::InvalidData(format!(
                "generation {} does not belong to service {}",
                generation_id, service_id
            )));
        }
        let was_latest = arena.service(service_id)?.latest_generation_id == generation_id;
        if let Some(service) = arena.services.get_mut(&service_id) {
            service.deployed_generation_id = Some(generation_id);
            service.deployed_image = Some(image.to_string());
        }
        if was_latest {
            arena.fork_latest(service_id)?;
        }
        arena.service(service_id).cloned()
    }

    async fn create_project_deployment(
        &self,
        project_id: ResourceId,
        entries: &[DeploymentEntry],
    ) -> DbResult<(ProjectDeployment, Vec<Deployment>)> {
        let mut arena = self.arena.lock().await;
        if !arena.projects.contains_key(&project_id) {
            return Err(DbError::NotFound(format!("project {}", project_id)));
        }
        if arena
            .project_deployments
            .values()
            .any(|pd| pd.project_id == project_id && !pd.status.is_terminal())
        {
            return Err(DbError::Conflict(format!(
                "a deployment of project {} is already in progress",
                project_id
            )));
        }
        for entry in entries {
            if arena.generation(entry.generation_id)?.service_id != entry.service_id {
                return Err(DbError::InvalidData(format!(
                    "generation {} does not belong to service {}",
                    entry.generation_id, entry.service_id
                )));
            }
        }

        let project_deployment = ProjectDeployment {
            id: ResourceId::new(),
            project_id,
            status: ProjectDeploymentStatus::InProgress,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let deployments: Vec<Deployment> = entries
            .iter()
            .map(|e| Deployment::new(e.service_id, e.generation_id, Some(project_deployment.id)))
            .collect();

        arena
            .project_deployments
            .insert(project_deployment.id, project_deployment.clone());
        for deployment in &deployments {
            arena.deployments.insert(deployment.id, deployment.clone());
            arena
                .history
                .insert(deployment.id, vec![DeploymentStatus::BuildPending]);
        }
        Ok((project_deployment, deployments))
    }

    async fn get_project_deployment(&self, id: ResourceId) -> DbResult<ProjectDeployment> {
        self.arena
            .lock()
            .await
            .project_deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project deployment {}", id)))
    }

    async fn active_project_deployment(
        &self,
        project_id: ResourceId,
    ) -> DbResult<Option<ProjectDeployment>> {
        let arena = self.arena.lock().await;
        Ok(arena
            .project_deployments
            .values()
            .find(|pd| pd.project_id == project_id && !pd.status.is_terminal())
            .cloned())
    }

    async fn finish_project_deployment(
        &self,
        id: ResourceId,
        status: ProjectDeploymentStatus,
        error: Option<&str>,
    ) -> DbResult<()> {
        let mut arena = self.arena.lock().await;
        let pd = arena
            .project_deployments
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("project deployment {}", id)))?;
        pd.status = status;
        pd.error = error.map(String::from);
        pd.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_deployment(&self, id: ResourceId) -> DbResult<Deployment> {
        self.arena
            .lock()
            .await
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("deployment {}", id)))
    }

    async fn list_deployments(
        &self,
        project_deployment_id: ResourceId,
    ) -> DbResult<Vec<Deployment>> {
        let arena = self.arena.lock().await;
        let mut deployments: Vec<Deployment> = arena
            .deployments
            .values()
            .filter(|d| d.project_deployment_id == Some(project_deployment_id))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.id);
        Ok(deployments)
    }

    async fn update_deployment_status(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
    ) -> DbResult<()> {
        self.arena.lock().await.record_status(id, status)
    }

    async fn finish_deployment(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
        image: Option<&str>,
        build_logs: Option<Vec<u8>>,
    ) -> DbResult<()> {
        let mut arena = self.arena.lock().await;
        let deployment = arena.deployment_mut(id)?;
        if let Some(image) = image {
            deployment.image = Some(image.to_string());
        }
        if build_logs.is_some() {
            deployment.build_logs = build_logs;
        }
        arena.record_status(id, status)
    }

    async fn fail_interrupted(&self, reason: &str, build_logs: Vec<u8>) -> DbResult<usize> {
        let mut arena = self.arena.lock().await;
        let now = Utc::now();
        for pd in arena
            .project_deployments
            .values_mut()
            .filter(|pd| !pd.status.is_terminal())
        {
            pd.status = ProjectDeploymentStatus::Failed;
            pd.error = Some(reason.to_string());
            pd.finished_at = Some(now);
        }

        let interrupted: Vec<ResourceId> = arena
            .deployments
            .values()
            .filter(|d| !d.status.is_terminal())
            .map(|d| d.id)
            .collect();
        for id in &interrupted {
            let deployment = arena.deployment_mut(*id)?;
            if deployment.build_logs.is_none() {
                deployment.build_logs = Some(build_logs.clone());
            }
            arena.record_status(*id, DeploymentStatus::Failed)?;
        }
        Ok(interrupted.len())
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}
