//! Process-wide dependencies, constructed once at startup.

use dockyard_config::SystemConfig;
use dockyard_core::builder::BuildBackend;
use dockyard_core::orchestrator::Orchestrator;
use dockyard_db::Store;
use std::sync::Arc;
use tracing::info;

use crate::coordinator::DeploymentCoordinator;
use crate::logstream::LogStreams;
use crate::scheduler::BuildScheduler;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<SystemConfig>,
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub scheduler: BuildScheduler,
    pub coordinator: DeploymentCoordinator,
    pub logs: LogStreams,
}

impl Context {
    pub fn new(
        config: SystemConfig,
        store: Arc<dyn Store>,
        backend: Arc<dyn BuildBackend>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let config = Arc::new(config);
        let scheduler = BuildScheduler::new(config.builds.max_concurrent);
        info!(
            max_concurrent = scheduler.max_concurrent(),
            backend = backend.name(),
            orchestrator = orchestrator.name(),
            "Scheduler ready"
        );

        let coordinator = DeploymentCoordinator::new(
            store.clone(),
            scheduler.clone(),
            backend,
            orchestrator.clone(),
            config.clone(),
        );
        let logs = LogStreams::new(
            store.clone(),
            scheduler.clone(),
            orchestrator.clone(),
            config.orchestrator.clone(),
            config.logs.clone(),
        );

        Self {
            config,
            store,
            orchestrator,
            scheduler,
            coordinator,
            logs,
        }
    }
}
