//! Project-wide deploys.
//!
//! A deploy covers every service of a project with pending changes (plus
//! any explicitly forced ones). Buildable services go through the build
//! scheduler, registry images go straight to `Deploying`, and once every
//! service has settled the whole project stack is applied in one go.
//!
//! Failures are isolated per service: a failed build marks its own
//! deployment `Failed` while its siblings are still applied.

use dockyard_builder::archive::compress_lines;
use dockyard_builder::image_reference;
use dockyard_config::{SystemConfig, parse_env};
use dockyard_core::builder::{BuildBackend, BuildRequest};
use dockyard_core::deployment::{
    Deployment, DeploymentStatus, ProjectDeployment, ProjectDeploymentStatus,
};
use dockyard_core::diff::{
    GenerationDiff, diff_generations, has_pending_changes, requires_image_build,
};
use dockyard_core::generation::Generation;
use dockyard_core::log::LogLine;
use dockyard_core::orchestrator::Orchestrator;
use dockyard_core::service::{Project, Service};
use dockyard_core::stack::ServiceRelease;
use dockyard_core::{Error, ResourceId, Result};
use dockyard_db::Store;
use dockyard_db::store::DeploymentEntry;
use dockyard_deployer::assemble_stack;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::scheduler::BuildScheduler;
use crate::status::StatusWriter;
use crate::task::BuildTask;

/// Pending changes of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDiff {
    pub service: Service,
    pub requires_build: bool,
    pub diff: GenerationDiff,
}

/// A started project deploy.
pub struct DeployHandle {
    pub project_deployment: ProjectDeployment,
    pub deployments: Vec<Deployment>,
    /// Resolves with the final project status once the stack is applied
    /// (or every service failed). An orchestrator rejection is an error.
    pub completion: JoinHandle<Result<ProjectDeploymentStatus>>,
}

struct Target {
    service: Service,
    generation: Generation,
    deployment: Deployment,
}

enum Prepared {
    Ready {
        release: ServiceRelease,
        status: Arc<StatusWriter>,
    },
    Failed {
        service: Service,
        error: Error,
    },
}

#[derive(Clone)]
pub struct DeploymentCoordinator {
    store: Arc<dyn Store>,
    scheduler: BuildScheduler,
    backend: Arc<dyn BuildBackend>,
    orchestrator: Arc<dyn Orchestrator>,
    config: Arc<SystemConfig>,
}

impl DeploymentCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: BuildScheduler,
        backend: Arc<dyn BuildBackend>,
        orchestrator: Arc<dyn Orchestrator>,
        config: Arc<SystemConfig>,
    ) -> Self {
        Self {
            store,
            scheduler,
            backend,
            orchestrator,
            config,
        }
    }

    /// Services of `project_id` whose latest generation differs from the
    /// deployed one.
    pub async fn deploy_diff(&self, project_id: ResourceId) -> Result<Vec<ServiceDiff>> {
        self.store.get_project(project_id).await?;

        let mut diffs = Vec::new();
        for service in self.store.list_services(project_id).await? {
            let (deployed, latest) = self.generations(&service).await?;
            if !has_pending_changes(deployed.as_ref(), &latest) {
                continue;
            }
            diffs.push(ServiceDiff {
                requires_build: requires_image_build(&latest),
                diff: diff_generations(deployed.as_ref(), &latest),
                service,
            });
        }
        Ok(diffs)
    }

    /// Start a deploy of every service with pending changes plus the
    /// services in `force`. Rejected with `Conflict` while another deploy of
    /// the project is in progress.
    pub async fn submit_deploy(
        &self,
        project_id: ResourceId,
        force: &[ResourceId],
    ) -> Result<DeployHandle> {
        let project = self.store.get_project(project_id).await?;
        if let Some(active) = self.store.active_project_deployment(project_id).await? {
            return Err(Error::Conflict(format!(
                "deployment {} of project {} is still in progress",
                active.id, project.name
            )));
        }

        let services = self.store.list_services(project_id).await?;
        if let Some(unknown) = force.iter().find(|id| !services.iter().any(|s| s.id == **id)) {
            return Err(Error::InvalidInput(format!(
                "service {} does not belong to project {}",
                unknown, project.name
            )));
        }

        let mut affected = Vec::new();
        for service in services {
            let (deployed, latest) = self.generations(&service).await?;
            if force.contains(&service.id) || has_pending_changes(deployed.as_ref(), &latest) {
                affected.push((service, latest));
            }
        }
        if affected.is_empty() {
            return Err(Error::InvalidInput(format!(
                "project {} has no pending changes",
                project.name
            )));
        }

        let entries: Vec<DeploymentEntry> = affected
            .iter()
            .map(|(service, generation)| DeploymentEntry {
                service_id: service.id,
                generation_id: generation.id,
            })
            .collect();
        let (project_deployment, deployments) = self
            .store
            .create_project_deployment(project_id, &entries)
            .await?;
        info!(
            project = %project.name,
            project_deployment_id = %project_deployment.id,
            services = deployments.len(),
            "Deploy started"
        );

        let targets = affected
            .into_iter()
            .zip(deployments.iter().cloned())
            .map(|((service, generation), deployment)| Target {
                service,
                generation,
                deployment,
            })
            .collect();

        let coordinator = self.clone();
        let project_deployment_id = project_deployment.id;
        let completion = tokio::spawn(async move {
            coordinator
                .run(project, project_deployment_id, targets)
                .await
        });

        Ok(DeployHandle {
            project_deployment,
            deployments,
            completion,
        })
    }

    async fn generations(&self, service: &Service) -> Result<(Option<Generation>, Generation)> {
        let latest = self.store.get_generation(service.latest_generation_id).await?;
        let deployed = match service.deployed_generation_id {
            Some(id) => Some(self.store.get_generation(id).await?),
            None => None,
        };
        Ok((deployed, latest))
    }

    async fn run(
        self,
        project: Project,
        project_deployment_id: ResourceId,
        targets: Vec<Target>,
    ) -> Result<ProjectDeploymentStatus> {
        // Run apart so a panic still ends in a recorded project status.
        let worker = self.clone();
        let worker_project = project.clone();
        let result = tokio::spawn(async move { worker.execute(&worker_project, targets).await })
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("deploy aborted: {}", e))));
        let (status, message) = match &result {
            Ok(failures) if failures.is_empty() => (ProjectDeploymentStatus::Success, None),
            Ok(failures) => (ProjectDeploymentStatus::Failed, Some(failures.join("; "))),
            Err(e) => (ProjectDeploymentStatus::Failed, Some(e.to_string())),
        };

        if let Err(e) = self
            .record_result(project_deployment_id, status, message.as_deref())
            .await
        {
            error!(
                project = %project.name,
                project_deployment_id = %project_deployment_id,
                error = %e,
                "Failed to record deploy result; it is failed at next startup"
            );
            return Err(e);
        }
        match &message {
            None => info!(project = %project.name, "Deploy succeeded"),
            Some(message) => warn!(project = %project.name, error = %message, "Deploy failed"),
        }
        result.map(|_| status)
    }

    /// Write the project deployment's final status, retrying transient
    /// store failures. Until it lands the project refuses new deploys.
    async fn record_result(
        &self,
        project_deployment_id: ResourceId,
        status: ProjectDeploymentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .finish_project_deployment(project_deployment_id, status, message)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(
                        project_deployment_id = %project_deployment_id,
                        attempt,
                        error = %e,
                        "Retrying deploy result write"
                    );
                    tokio::time::sleep(RECORD_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fail deploys left unfinished by a previous run of the server so their
    /// projects accept new ones. Call once at startup, before serving.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let reason = "Interrupted by a server restart";
        let archive = compress_lines(&[LogLine::notice(reason)])?;
        let failed = self.store.fail_interrupted(reason, archive).await?;
        if failed > 0 {
            warn!(deployments = failed, "Failed deployments interrupted by a restart");
        }
        Ok(failed)
    }

    /// Settle every target, then apply the stack. Returns per-service
    /// failure messages; an `Err` means the stack itself was not applied.
    async fn execute(&self, project: &Project, targets: Vec<Target>) -> Result<Vec<String>> {
        let prepared =
            futures::future::join_all(targets.into_iter().map(|t| self.prepare(project, t))).await;

        let mut failures = Vec::new();
        let mut ready = Vec::new();
        for outcome in prepared {
            match outcome {
                Prepared::Ready { release, status } => ready.push((release, status)),
                Prepared::Failed { service, error } => {
                    failures.push(format!("{}: {}", service.name, error));
                }
            }
        }
        if ready.is_empty() {
            return Ok(failures);
        }

        if let Err(e) = self.apply(project, &ready).await {
            for (release, status) in &ready {
                // Built services keep their build log; the rest get a notice.
                let archive = match release.built_image {
                    Some(_) => None,
                    None => compress_lines(&[LogLine::notice(format!("Deploy failed: {}", e))]).ok(),
                };
                if let Err(err) = status.finish(DeploymentStatus::Failed, None, archive).await {
                    error!(deployment_id = %status.deployment_id(), error = %err, "Failed to record failure");
                }
            }
            return Err(e);
        }

        for (release, status) in &ready {
            let Some(image) = release.image() else {
                continue;
            };
            let recorded = async {
                status
                    .finish(DeploymentStatus::Success, Some(image), None)
                    .await?;
                self.store
                    .promote_generation(release.service.id, release.generation.id, image)
                    .await?;
                Ok::<_, Error>(())
            };
            if let Err(e) = recorded.await {
                error!(service = %release.service.name, error = %e, "Failed to record deploy");
                failures.push(format!("{}: {}", release.service.name, e));
            }
        }
        Ok(failures)
    }

    /// Build (or skip building) one service, leaving its deployment in
    /// `Deploying` when it is ready to be applied.
    async fn prepare(&self, project: &Project, target: Target) -> Prepared {
        let Target {
            service,
            generation,
            deployment,
        } = target;
        let status = Arc::new(StatusWriter::new(
            self.store.clone(),
            deployment.id,
            DeploymentStatus::BuildPending,
        ));

        let environment = match check_generation(&generation) {
            Ok(environment) => environment,
            Err(e) => {
                warn!(service = %service.name, error = %e, "Configuration rejected");
                fail_with_notice(&status, &format!("Configuration rejected, no build ran: {}", e))
                    .await;
                return Prepared::Failed { service, error: e };
            }
        };

        if !requires_image_build(&generation) {
            if let Err(e) = status.transition(DeploymentStatus::Deploying).await {
                return Prepared::Failed { service, error: e };
            }
            return Prepared::Ready {
                release: ServiceRelease {
                    service,
                    generation,
                    built_image: None,
                    environment,
                },
                status,
            };
        }

        let builds = &self.config.builds;
        let request = BuildRequest {
            deployment_id: deployment.id,
            source: generation.config.source.clone(),
            build_method: generation.config.build_method.clone(),
            build_path: generation.config.build_path.clone(),
            build_args: environment.clone(),
            work_dir: builds.work_dir.join(deployment.id.to_string()),
            image: image_reference(
                builds.registry.as_deref(),
                &project.name,
                &service.name,
                deployment.id,
            ),
        };
        let task = BuildTask::with_status(
            status.clone(),
            self.backend.clone(),
            service.id,
            request,
            builds.logs_dir.join(format!("{}.log", deployment.id)),
        );

        let built = match self.scheduler.submit(task) {
            Ok(pending) => pending.await,
            Err(e) => {
                fail_with_notice(&status, &format!("Build could not be scheduled: {}", e)).await;
                Err(e)
            }
        };
        match built {
            Ok(image) => Prepared::Ready {
                release: ServiceRelease {
                    service,
                    generation,
                    built_image: Some(image),
                    environment,
                },
                status,
            },
            Err(error) => {
                // A task that died before recording its result.
                if !status.current().await.is_terminal() {
                    fail_with_notice(&status, &format!("Build failed: {}", error)).await;
                }
                Prepared::Failed { service, error }
            }
        }
    }

    /// Assemble the project's full stack and hand it to the orchestrator.
    ///
    /// Services outside `ready` are re-emitted from their deployed
    /// generation: the stack deploy prunes anything missing from the
    /// document.
    async fn apply(&self, project: &Project, ready: &[(ServiceRelease, Arc<StatusWriter>)]) -> Result<()> {
        let mut releases: Vec<ServiceRelease> = ready.iter().map(|(r, _)| r.clone()).collect();
        let included: HashSet<ResourceId> = releases.iter().map(|r| r.service.id).collect();

        for service in self.store.list_services(project.id).await? {
            if included.contains(&service.id) {
                continue;
            }
            let Some(generation_id) = service.deployed_generation_id else {
                continue;
            };
            let generation = self.store.get_generation(generation_id).await?;
            let environment = match parse_env(&generation.config.environment) {
                Ok(environment) => environment,
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Deployed environment no longer parses");
                    Vec::new()
                }
            };
            releases.push(ServiceRelease {
                service,
                generation,
                built_image: None,
                environment,
            });
        }

        let orchestrator = &self.config.orchestrator;
        let spec = assemble_stack(&project.name, &orchestrator.network, &releases)?;
        let stack = orchestrator.stack_name(&project.name);
        info!(
            stack = %stack,
            services = spec.services.len(),
            orchestrator = self.orchestrator.name(),
            "Applying stack"
        );
        self.orchestrator.apply_stack(&stack, &spec).await
    }
}

/// Attempts at writing a project deployment's final status.
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_BACKOFF: Duration = Duration::from_millis(200);

/// Checks that must pass before a build is attempted. Returns the parsed
/// environment.
fn check_generation(generation: &Generation) -> Result<Vec<(String, String)>> {
    generation.validate()?;
    parse_env(&generation.config.environment)
        .map_err(|e| Error::InvalidConfiguration(format!("environment: {}", e)))
}

/// Mark the deployment failed with `reason` as its only log line.
async fn fail_with_notice(status: &StatusWriter, reason: &str) {
    let archive = compress_lines(&[LogLine::notice(reason)]).ok();
    if let Err(e) = status.finish(DeploymentStatus::Failed, None, archive).await {
        error!(deployment_id = %status.deployment_id(), error = %e, "Failed to record failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeBackend, FakeOrchestrator, FlakyStore, docker_config, github_config, seed_service,
    };
    use dockyard_builder::archive::decompress_logs;
    use dockyard_core::generation::{Port, PortMode, PortProtocol, Source};
    use dockyard_core::stack::PortSpec;
    use dockyard_db::MemoryStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        backend: Arc<FakeBackend>,
        orchestrator: Arc<FakeOrchestrator>,
        config: Arc<SystemConfig>,
        coordinator: DeploymentCoordinator,
    }

    fn fixture(backend: FakeBackend, orchestrator: FakeOrchestrator) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SystemConfig::default();
        config.builds.work_dir = dir.path().join("work");
        config.builds.logs_dir = dir.path().join("logs");

        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(backend);
        let orchestrator = Arc::new(orchestrator);
        let config = Arc::new(config);
        let coordinator = DeploymentCoordinator::new(
            store.clone(),
            BuildScheduler::new(2),
            backend.clone(),
            orchestrator.clone(),
            config.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            backend,
            orchestrator,
            config,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_github_service_first_deploy() {
        let f = fixture(FakeBackend::default(), FakeOrchestrator::default());
        let project = f.store.create_project("shop").await.unwrap();
        let mut draft = Generation::new(ResourceId::new(), github_config("acme/web"));
        draft.ports.push(Port {
            id: None,
            target: 80,
            published: 8080,
            protocol: PortProtocol::Tcp,
            mode: PortMode::Ingress,
        });
        let service = f.store.create_service(project.id, "web", draft).await.unwrap();

        let diffs = f.coordinator.deploy_diff(project.id).await.unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].requires_build);
        assert_eq!(diffs[0].diff.ports.added.len(), 1);

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let deployment_id = handle.deployments[0].id;
        let status = handle.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Success);

        let applied = f.orchestrator.applied.lock().await;
        assert_eq!(applied.len(), 1);
        let (stack, spec) = &applied[0];
        assert_eq!(stack, "dockyard-shop");
        let web = &spec.services["web"];
        assert_eq!(web.image, format!("shop-web:{}", deployment_id));
        assert_eq!(
            web.ports,
            vec![PortSpec {
                target: 80,
                published: 8080,
                protocol: "tcp".to_string(),
                mode: "ingress".to_string(),
            }]
        );

        assert_eq!(
            f.store.status_history(deployment_id).await,
            vec![
                DeploymentStatus::BuildPending,
                DeploymentStatus::Building,
                DeploymentStatus::Deploying,
                DeploymentStatus::Success
            ]
        );
        let promoted = f.store.get_service(service.id).await.unwrap();
        assert_eq!(promoted.deployed_generation_id, Some(service.latest_generation_id));
        assert_eq!(promoted.deployed_image.as_deref(), Some(web.image.as_str()));

        let pd = f
            .store
            .get_project_deployment(handle.project_deployment.id)
            .await
            .unwrap();
        assert_eq!(pd.status, ProjectDeploymentStatus::Success);
        assert!(f.coordinator.deploy_diff(project.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_docker_source_skips_build() {
        let f = fixture(FakeBackend::default(), FakeOrchestrator::default());
        let (project, _) = seed_service(&f.store, "shop", "cache", docker_config("redis:7")).await;

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let deployment_id = handle.deployments[0].id;
        handle.completion.await.unwrap().unwrap();

        assert!(f.backend.started.lock().await.is_empty());
        assert_eq!(
            f.store.status_history(deployment_id).await,
            vec![
                DeploymentStatus::BuildPending,
                DeploymentStatus::Deploying,
                DeploymentStatus::Success
            ]
        );
        let applied = f.orchestrator.applied.lock().await;
        assert_eq!(applied[0].1.services["cache"].image, "redis:7");
    }

    #[tokio::test]
    async fn test_invalid_configuration_never_builds() {
        let f = fixture(FakeBackend::default(), FakeOrchestrator::default());
        let (project, _) =
            seed_service(&f.store, "shop", "web", github_config("not-a-repository")).await;

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let deployment_id = handle.deployments[0].id;
        let status = handle.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Failed);

        assert_eq!(
            f.store.status_history(deployment_id).await,
            vec![DeploymentStatus::BuildPending, DeploymentStatus::Failed]
        );
        assert!(f.backend.started.lock().await.is_empty());
        assert!(f.orchestrator.applied.lock().await.is_empty());

        let stored = f.store.get_deployment(deployment_id).await.unwrap();
        let lines = decompress_logs(&stored.build_logs.unwrap()).unwrap();
        assert!(lines[0].message.contains("no build ran"));
    }

    #[tokio::test]
    async fn test_build_failure_is_isolated() {
        let backend = FakeBackend {
            fail_build: true,
            ..Default::default()
        };
        let f = fixture(backend, FakeOrchestrator::default());
        let (project, web) = seed_service(&f.store, "shop", "web", github_config("acme/web")).await;
        let (_, cache) = seed_service(&f.store, "shop", "cache", docker_config("redis:7")).await;

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let status = handle.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Failed);

        for deployment in &handle.deployments {
            let stored = f.store.get_deployment(deployment.id).await.unwrap();
            if deployment.service_id == web.id {
                assert_eq!(stored.status, DeploymentStatus::Failed);
            } else {
                assert_eq!(deployment.service_id, cache.id);
                assert_eq!(stored.status, DeploymentStatus::Success);
            }
        }

        let applied = f.orchestrator.applied.lock().await;
        let services: Vec<&String> = applied[0].1.services.keys().collect();
        assert_eq!(services, vec!["cache"]);

        let pd = f
            .store
            .get_project_deployment(handle.project_deployment.id)
            .await
            .unwrap();
        assert!(pd.error.unwrap().contains("web"));
    }

    #[tokio::test]
    async fn test_apply_failure_propagates() {
        let orchestrator = FakeOrchestrator {
            fail_apply: true,
            ..Default::default()
        };
        let f = fixture(FakeBackend::default(), orchestrator);
        let (project, service) = seed_service(&f.store, "shop", "cache", docker_config("redis:7")).await;

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let deployment_id = handle.deployments[0].id;
        let err = handle.completion.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Orchestrator(_)));

        assert_eq!(
            f.store.status_history(deployment_id).await,
            vec![
                DeploymentStatus::BuildPending,
                DeploymentStatus::Deploying,
                DeploymentStatus::Failed
            ]
        );
        let pd = f
            .store
            .get_project_deployment(handle.project_deployment.id)
            .await
            .unwrap();
        assert_eq!(pd.status, ProjectDeploymentStatus::Failed);
        assert!(!f.store.get_service(service.id).await.unwrap().is_deployed());
    }

    #[tokio::test]
    async fn test_concurrent_deploy_is_a_conflict() {
        let (backend, gate) = FakeBackend::gated(0);
        let f = fixture(backend, FakeOrchestrator::default());
        let (project, _) = seed_service(&f.store, "shop", "web", github_config("acme/web")).await;

        let first = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let second = f.coordinator.submit_deploy(project.id, &[]).await;
        assert!(matches!(second.err(), Some(Error::Conflict(_))));

        gate.add_permits(1);
        first.completion.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_nothing_to_deploy_unless_forced() {
        let f = fixture(FakeBackend::default(), FakeOrchestrator::default());
        let (project, service) = seed_service(&f.store, "shop", "web", github_config("acme/web")).await;

        let first = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        first.completion.await.unwrap().unwrap();

        let again = f.coordinator.submit_deploy(project.id, &[]).await;
        assert!(matches!(again.err(), Some(Error::InvalidInput(_))));

        let forced = f
            .coordinator
            .submit_deploy(project.id, &[service.id])
            .await
            .unwrap();
        assert_eq!(forced.deployments.len(), 1);
        let status = forced.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Success);
        assert_eq!(f.backend.started.lock().await.len(), 2);

        let stranger = f.coordinator.submit_deploy(project.id, &[ResourceId::new()]).await;
        assert!(matches!(stranger.err(), Some(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_unchanged_services_stay_in_the_stack() {
        let f = fixture(FakeBackend::default(), FakeOrchestrator::default());
        let (project, _) = seed_service(&f.store, "shop", "db", docker_config("postgres:16")).await;
        let (_, web) = seed_service(&f.store, "shop", "web", docker_config("nginx:1.25")).await;

        let first = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        first.completion.await.unwrap().unwrap();

        let mut generation = f.store.editable_generation(web.id).await.unwrap();
        generation.config.source = Source::Docker {
            image: "nginx:1.27".to_string(),
        };
        f.store.update_generation(&generation).await.unwrap();

        let second = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        assert_eq!(second.deployments.len(), 1);
        second.completion.await.unwrap().unwrap();

        let applied = f.orchestrator.applied.lock().await;
        let spec = &applied[1].1;
        assert_eq!(spec.services["db"].image, "postgres:16");
        assert_eq!(spec.services["web"].image, "nginx:1.27");
    }

    #[tokio::test]
    async fn test_panicking_build_fails_its_deployment() {
        let backend = FakeBackend {
            panic_build: true,
            ..Default::default()
        };
        let f = fixture(backend, FakeOrchestrator::default());
        let (project, _) = seed_service(&f.store, "shop", "web", github_config("acme/web")).await;

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let deployment_id = handle.deployments[0].id;
        let status = handle.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Failed);

        assert_eq!(
            f.store.status_history(deployment_id).await,
            vec![
                DeploymentStatus::BuildPending,
                DeploymentStatus::Building,
                DeploymentStatus::Failed
            ]
        );
        let stored = f.store.get_deployment(deployment_id).await.unwrap();
        let lines = decompress_logs(&stored.build_logs.unwrap()).unwrap();
        assert!(lines[0].message.starts_with("Build failed"));
        assert!(f.store.active_project_deployment(project.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_deploy_is_failed_on_restart() {
        let (backend, _gate) = FakeBackend::gated(0);
        let f = fixture(backend, FakeOrchestrator::default());
        let (project, _) = seed_service(&f.store, "shop", "web", github_config("acme/web")).await;

        let handle = f.coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let deployment_id = handle.deployments[0].id;
        while f.store.get_deployment(deployment_id).await.unwrap().status
            != DeploymentStatus::Building
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.completion.abort();

        // A restarted server shares nothing but the store.
        let restarted = DeploymentCoordinator::new(
            f.store.clone(),
            BuildScheduler::new(2),
            Arc::new(FakeBackend::default()),
            f.orchestrator.clone(),
            f.config.clone(),
        );
        let blocked = restarted.submit_deploy(project.id, &[]).await;
        assert!(matches!(blocked.err(), Some(Error::Conflict(_))));

        assert_eq!(restarted.recover_interrupted().await.unwrap(), 1);
        let pd = f
            .store
            .get_project_deployment(handle.project_deployment.id)
            .await
            .unwrap();
        assert_eq!(pd.status, ProjectDeploymentStatus::Failed);
        let stored = f.store.get_deployment(deployment_id).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        let lines = decompress_logs(&stored.build_logs.unwrap()).unwrap();
        assert!(lines[0].message.contains("restart"));

        let retry = restarted.submit_deploy(project.id, &[]).await.unwrap();
        let status = retry.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Success);
    }

    fn coordinator_on(store: Arc<FlakyStore>) -> DeploymentCoordinator {
        DeploymentCoordinator::new(
            store,
            BuildScheduler::new(1),
            Arc::new(FakeBackend::default()),
            Arc::new(FakeOrchestrator::default()),
            Arc::new(SystemConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_result_write_is_retried() {
        let store = Arc::new(FlakyStore::new(1));
        let coordinator = coordinator_on(store.clone());
        let (project, _) = seed_service(&store.inner, "shop", "cache", docker_config("redis:7")).await;

        let handle = coordinator.submit_deploy(project.id, &[]).await.unwrap();
        let status = handle.completion.await.unwrap().unwrap();
        assert_eq!(status, ProjectDeploymentStatus::Success);
        assert!(store.active_project_deployment(project.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrecorded_result_is_failed_on_restart() {
        let store = Arc::new(FlakyStore::new(RECORD_ATTEMPTS as usize));
        let coordinator = coordinator_on(store.clone());
        let (project, _) = seed_service(&store.inner, "shop", "cache", docker_config("redis:7")).await;

        let handle = coordinator.submit_deploy(project.id, &[]).await.unwrap();
        assert!(handle.completion.await.unwrap().is_err());
        assert!(store.active_project_deployment(project.id).await.unwrap().is_some());

        // The service itself was deployed; only the project row is stuck.
        assert_eq!(coordinator.recover_interrupted().await.unwrap(), 0);
        let pd = store
            .get_project_deployment(handle.project_deployment.id)
            .await
            .unwrap();
        assert_eq!(pd.status, ProjectDeploymentStatus::Failed);
        assert!(store.active_project_deployment(project.id).await.unwrap().is_none());
    }
}
