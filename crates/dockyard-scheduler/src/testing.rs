//! Fakes and fixtures shared by the scheduler tests.

use async_trait::async_trait;
use bytes::Bytes;
use dockyard_core::builder::{BuildBackend, BuildRequest, LogSink};
use dockyard_core::deployment::{
    Deployment, DeploymentStatus, ProjectDeployment, ProjectDeploymentStatus,
};
use dockyard_core::generation::{Generation, GenerationConfig, Source};
use dockyard_core::orchestrator::{
    LogOptions, NodeSummary, Orchestrator, RawLogStream, TaskSummary,
};
use dockyard_core::service::{Project, Service};
use dockyard_core::stack::StackSpecification;
use dockyard_core::{Error, ResourceId, Result};
use dockyard_db::store::DeploymentEntry;
use dockyard_db::{DbError, DbResult, MemoryStore, Store};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

pub fn github_config(repository: &str) -> GenerationConfig {
    GenerationConfig {
        source: Source::GitHub {
            repository: repository.to_string(),
            branch: None,
        },
        ..Default::default()
    }
}

pub fn docker_config(image: &str) -> GenerationConfig {
    GenerationConfig {
        source: Source::Docker {
            image: image.to_string(),
        },
        ..Default::default()
    }
}

pub async fn seed_service(
    store: &MemoryStore,
    project: &str,
    service: &str,
    config: GenerationConfig,
) -> (Project, Service) {
    let project = match store
        .list_projects()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.name == project)
    {
        Some(existing) => existing,
        None => store.create_project(project).await.unwrap(),
    };
    let service = store
        .create_service(project.id, service, Generation::new(ResourceId::new(), config))
        .await
        .unwrap();
    (project, service)
}

/// A `BuildPending` deployment of a fresh GitHub service.
pub async fn seed_deployment(store: &Arc<MemoryStore>) -> Deployment {
    let (project, service) = seed_service(store, "shop", "web", github_config("acme/web")).await;
    let (_, mut deployments) = store
        .create_project_deployment(
            project.id,
            &[DeploymentEntry {
                service_id: service.id,
                generation_id: service.latest_generation_id,
            }],
        )
        .await
        .unwrap();
    deployments.remove(0)
}

/// Build backend recording what it was asked to do.
#[derive(Default)]
pub struct FakeBackend {
    /// When set, each build waits for a permit.
    pub gate: Option<Arc<Semaphore>>,
    pub fail_fetch: bool,
    pub fail_build: bool,
    /// Panic in the middle of the build.
    pub panic_build: bool,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub started: Mutex<Vec<ResourceId>>,
}

impl FakeBackend {
    pub fn gated(permits: usize) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(permits));
        (
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }
}

#[async_trait]
impl BuildBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_source(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<()> {
        self.started.lock().await.push(request.deployment_id);
        tokio::fs::create_dir_all(request.work_dir.join("source")).await?;
        tokio::fs::write(request.work_dir.join("source/Dockerfile"), "FROM scratch\n").await?;
        log.notice("fetched source").await?;
        if self.fail_fetch {
            return Err(Error::SourceRetrieval("repository not found".to_string()));
        }
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if self.panic_build {
            self.active.fetch_sub(1, Ordering::SeqCst);
            panic!("builder crashed");
        }

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await;
            if let Ok(permit) = permit {
                permit.forget();
            }
        } else {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log.write(dockyard_core::log::LogLevel::Stdout, "Step 1/1 : FROM scratch")
            .await?;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail_build {
            return Err(Error::BuildFailed {
                message: "docker exited with status 1".to_string(),
                output: "Step 1/1 : FROM scratch".to_string(),
            });
        }
        Ok(request.image.clone())
    }
}

/// Orchestrator that records applied stacks.
#[derive(Default)]
pub struct FakeOrchestrator {
    pub fail_apply: bool,
    pub applied: Mutex<Vec<(String, StackSpecification)>>,
    /// Raw bytes served as every service's log stream.
    pub log_chunks: Vec<Vec<u8>>,
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn apply_stack(&self, stack: &str, spec: &StackSpecification) -> Result<()> {
        if self.fail_apply {
            return Err(Error::Orchestrator("network dockyard not found".to_string()));
        }
        self.applied
            .lock()
            .await
            .push((stack.to_string(), spec.clone()));
        Ok(())
    }

    async fn list_tasks(&self, _service: &str) -> Result<Vec<TaskSummary>> {
        Ok(Vec::new())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        Ok(Vec::new())
    }

    async fn service_logs(&self, service: &str, _options: LogOptions) -> Result<RawLogStream> {
        if self.log_chunks.is_empty() {
            return Err(Error::Orchestrator(format!("service {} not found", service)));
        }
        let chunks = self.log_chunks.clone();
        Ok(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from(c))),
        )
        .boxed())
    }
}

/// One multiplexed log frame.
pub fn frame(stream: u8, payload: &str) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Memory store whose project deployment completion writes fail a set
/// number of times before going through.
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub finish_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(finish_failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            finish_failures: AtomicUsize::new(finish_failures),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        self.inner.create_project(name).await
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        self.inner.get_project(id).await
    }

    async fn list_projects(&self) -> DbResult<Vec<Project>> {
        self.inner.list_projects().await
    }

    async fn create_service(
        &self,
        project_id: ResourceId,
        name: &str,
        draft: Generation,
    ) -> DbResult<Service> {
        self.inner.create_service(project_id, name, draft).await
    }

    async fn get_service(&self, id: ResourceId) -> DbResult<Service> {
        self.inner.get_service(id).await
    }

    async fn list_services(&self, project_id: ResourceId) -> DbResult<Vec<Service>> {
        self.inner.list_services(project_id).await
    }

    async fn get_generation(&self, id: ResourceId) -> DbResult<Generation> {
        self.inner.get_generation(id).await
    }

    async fn editable_generation(&self, service_id: ResourceId) -> DbResult<Generation> {
        self.inner.editable_generation(service_id).await
    }

    async fn update_generation(&self, generation: &Generation) -> DbResult<Generation> {
        self.inner.update_generation(generation).await
    }

    async fn promote_generation(
        &self,
        service_id: ResourceId,
        generation_id: ResourceId,
        image: &str,
    ) -> DbResult<Service> {
        self.inner
            .promote_generation(service_id, generation_id, image)
            .await
    }

    async fn create_project_deployment(
        &self,
        project_id: ResourceId,
        entries: &[DeploymentEntry],
    ) -> DbResult<(ProjectDeployment, Vec<Deployment>)> {
        self.inner.create_project_deployment(project_id, entries).await
    }

    async fn get_project_deployment(&self, id: ResourceId) -> DbResult<ProjectDeployment> {
        self.inner.get_project_deployment(id).await
    }

    async fn active_project_deployment(
        &self,
        project_id: ResourceId,
    ) -> DbResult<Option<ProjectDeployment>> {
        self.inner.active_project_deployment(project_id).await
    }

    async fn finish_project_deployment(
        &self,
        id: ResourceId,
        status: ProjectDeploymentStatus,
        error: Option<&str>,
    ) -> DbResult<()> {
        let failing = self
            .finish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DbError::InvalidData("connection reset".to_string()));
        }
        self.inner.finish_project_deployment(id, status, error).await
    }

    async fn get_deployment(&self, id: ResourceId) -> DbResult<Deployment> {
        self.inner.get_deployment(id).await
    }

    async fn list_deployments(
        &self,
        project_deployment_id: ResourceId,
    ) -> DbResult<Vec<Deployment>> {
        self.inner.list_deployments(project_deployment_id).await
    }

    async fn update_deployment_status(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
    ) -> DbResult<()> {
        self.inner.update_deployment_status(id, status).await
    }

    async fn finish_deployment(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
        image: Option<&str>,
        build_logs: Option<Vec<u8>>,
    ) -> DbResult<()> {
        self.inner
            .finish_deployment(id, status, image, build_logs)
            .await
    }

    async fn fail_interrupted(&self, reason: &str, build_logs: Vec<u8>) -> DbResult<usize> {
        self.inner.fail_interrupted(reason, build_logs).await
    }

    async fn ping(&self) -> DbResult<()> {
        self.inner.ping().await
    }
}
