//! Build task: source retrieval and image build for one deployment.

use dockyard_builder::BuildLogger;
use dockyard_builder::archive::{compress_lines, compress_log_file};
use dockyard_core::builder::{BuildBackend, BuildRequest, LogSink};
use dockyard_core::deployment::DeploymentStatus;
use dockyard_core::log::{LogLevel, LogLine};
use dockyard_core::{Error, ResourceId, Result};
use dockyard_db::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::status::StatusWriter;

/// Scratch directory and log file owned by a running task.
///
/// `cleanup` removes both; if the guard is dropped without it (a panic or an
/// aborted future) `Drop` removes them synchronously.
struct Scratch {
    work_dir: PathBuf,
    log_path: PathBuf,
    cleaned: bool,
}

impl Scratch {
    fn new(work_dir: PathBuf, log_path: PathBuf) -> Self {
        Self {
            work_dir,
            log_path,
            cleaned: false,
        }
    }

    async fn cleanup(mut self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.work_dir.display(), error = %e, "Failed to remove work dir");
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.log_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.log_path.display(), error = %e, "Failed to remove build log");
            }
        }
        self.cleaned = true;
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.work_dir);
            let _ = std::fs::remove_file(&self.log_path);
        }
    }
}

pub struct BuildTask {
    service_id: ResourceId,
    request: BuildRequest,
    log_path: PathBuf,
    backend: Arc<dyn BuildBackend>,
    status: Arc<StatusWriter>,
}

impl BuildTask {
    /// A task for a deployment currently in `BuildPending`.
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn BuildBackend>,
        service_id: ResourceId,
        request: BuildRequest,
        log_path: PathBuf,
    ) -> Self {
        let status = Arc::new(StatusWriter::new(
            store,
            request.deployment_id,
            DeploymentStatus::BuildPending,
        ));
        Self::with_status(status, backend, service_id, request, log_path)
    }

    /// A task writing through `status`, which the caller keeps using once
    /// the build is over.
    pub fn with_status(
        status: Arc<StatusWriter>,
        backend: Arc<dyn BuildBackend>,
        service_id: ResourceId,
        request: BuildRequest,
        log_path: PathBuf,
    ) -> Self {
        Self {
            service_id,
            request,
            log_path,
            backend,
            status,
        }
    }

    pub fn deployment_id(&self) -> ResourceId {
        self.request.deployment_id
    }

    pub fn service_id(&self) -> ResourceId {
        self.service_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Run to completion. On success the deployment is left in `Deploying`
    /// with the image and archived log stored; on failure it is `Failed`.
    /// The scratch directory and raw log are gone either way.
    pub async fn run(self) -> Result<String> {
        let deployment_id = self.deployment_id();
        let scratch = Scratch::new(self.request.work_dir.clone(), self.log_path.clone());

        if let Err(e) = self.status.transition(DeploymentStatus::Building).await {
            error!(deployment_id = %deployment_id, error = %e, "Could not start build");
            self.fail_without_log(&e).await;
            scratch.cleanup().await;
            return Err(e);
        }
        info!(deployment_id = %deployment_id, image = %self.request.image, "Build started");

        let logger = match BuildLogger::create(&self.log_path).await {
            Ok(logger) => logger,
            Err(e) => {
                self.fail_without_log(&e).await;
                scratch.cleanup().await;
                return Err(e);
            }
        };

        let result = self.execute(&logger).await;
        match &result {
            Ok(image) => {
                let _ = logger.notice(&format!("Image {} ready", image)).await;
            }
            Err(e) => {
                let _ = logger.notice(&format!("Build failed: {}", e)).await;
                if let Error::BuildFailed { output, .. } = e {
                    if !output.is_empty() {
                        let _ = logger.write(LogLevel::Stderr, output).await;
                    }
                }
            }
        }
        if let Err(e) = logger.close().await {
            warn!(deployment_id = %deployment_id, error = %e, "Failed to close build log");
        }

        let archive = match compress_log_file(&self.log_path).await {
            Ok(archive) => Some(archive),
            Err(e) => {
                warn!(deployment_id = %deployment_id, error = %e, "Failed to archive build log");
                None
            }
        };

        let persisted = match &result {
            Ok(image) => {
                self.status
                    .finish(DeploymentStatus::Deploying, Some(image), archive)
                    .await
            }
            Err(_) => {
                self.status
                    .finish(DeploymentStatus::Failed, None, archive)
                    .await
            }
        };

        scratch.cleanup().await;

        match (&result, persisted) {
            (Ok(image), Ok(())) => {
                info!(deployment_id = %deployment_id, image = %image, "Build finished");
            }
            (Err(e), _) => {
                warn!(deployment_id = %deployment_id, error = %e, "Build failed");
            }
            (Ok(_), Err(e)) => {
                error!(deployment_id = %deployment_id, error = %e, "Failed to record build result");
                return Err(e);
            }
        }
        result
    }

    async fn execute(&self, logger: &BuildLogger) -> Result<String> {
        logger
            .notice(&format!(
                "Deployment {} building with {}",
                self.request.deployment_id,
                self.backend.name()
            ))
            .await?;
        self.backend.fetch_source(&self.request, logger).await?;
        self.backend.build_image(&self.request, logger).await
    }

    /// Mark the deployment failed when no log file could be written, keeping
    /// a one-line archive explaining why.
    async fn fail_without_log(&self, cause: &Error) {
        let archive = compress_lines(&[LogLine::notice(format!("Build failed: {}", cause))]).ok();
        let current = self.status.current().await;
        if current.is_terminal() {
            return;
        }
        if let Err(e) = self
            .status
            .finish(DeploymentStatus::Failed, None, archive)
            .await
        {
            error!(deployment_id = %self.request.deployment_id, error = %e, "Failed to record failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, seed_deployment};
    use dockyard_builder::archive::decompress_logs;
    use dockyard_core::generation::{BuildMethod, Source};
    use dockyard_db::MemoryStore;

    fn request(deployment_id: ResourceId, root: &Path) -> BuildRequest {
        BuildRequest {
            deployment_id,
            source: Source::GitHub {
                repository: "acme/web".to_string(),
                branch: None,
            },
            build_method: BuildMethod::default(),
            build_path: "/".to_string(),
            build_args: Vec::new(),
            work_dir: root.join("work").join(deployment_id.to_string()),
            image: format!("shop-web:{}", deployment_id),
        }
    }

    #[tokio::test]
    async fn test_successful_build() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        let request = request(deployment.id, dir.path());
        let work_dir = request.work_dir.clone();
        let log_path = dir.path().join("logs").join(format!("{}.log", deployment.id));

        let task = BuildTask::new(
            store.clone(),
            Arc::new(FakeBackend::default()),
            deployment.service_id,
            request,
            log_path.clone(),
        );
        let image = task.run().await.unwrap();
        assert_eq!(image, format!("shop-web:{}", deployment.id));

        assert_eq!(
            store.status_history(deployment.id).await,
            vec![
                DeploymentStatus::BuildPending,
                DeploymentStatus::Building,
                DeploymentStatus::Deploying
            ]
        );
        assert!(!work_dir.exists());
        assert!(!log_path.exists());

        let stored = store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(stored.image.as_deref(), Some(image.as_str()));
        let lines = decompress_logs(&stored.build_logs.unwrap()).unwrap();
        assert!(lines.iter().any(|l| l.message == "fetched source"));
        assert!(lines.iter().any(|l| l.message == "Step 1/1 : FROM scratch"));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_logs_and_no_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        let request = request(deployment.id, dir.path());
        let work_dir = request.work_dir.clone();
        let log_path = dir.path().join(format!("{}.log", deployment.id));

        let backend = FakeBackend {
            fail_fetch: true,
            ..Default::default()
        };
        let task = BuildTask::new(
            store.clone(),
            Arc::new(backend),
            deployment.service_id,
            request,
            log_path.clone(),
        );
        let err = task.run().await.unwrap_err();
        assert!(matches!(err, Error::SourceRetrieval(_)));

        assert_eq!(
            store.status_history(deployment.id).await,
            vec![
                DeploymentStatus::BuildPending,
                DeploymentStatus::Building,
                DeploymentStatus::Failed
            ]
        );
        assert!(!work_dir.exists());
        assert!(!log_path.exists());

        let stored = store.get_deployment(deployment.id).await.unwrap();
        let lines = decompress_logs(&stored.build_logs.unwrap()).unwrap();
        assert!(
            lines
                .iter()
                .any(|l| l.message.contains("repository not found"))
        );
    }

    #[tokio::test]
    async fn test_failed_build_keeps_process_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;

        let backend = FakeBackend {
            fail_build: true,
            ..Default::default()
        };
        let task = BuildTask::new(
            store.clone(),
            Arc::new(backend),
            deployment.service_id,
            request(deployment.id, dir.path()),
            dir.path().join("build.log"),
        );
        let err = task.run().await.unwrap_err();
        assert!(matches!(err, Error::BuildFailed { .. }));

        let stored = store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert_eq!(stored.image, None);
        let lines = decompress_logs(&stored.build_logs.unwrap()).unwrap();
        assert_eq!(lines.last().unwrap().level, LogLevel::Stderr);
    }

    #[tokio::test]
    async fn test_dropped_task_removes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let log_path = dir.path().join("build.log");
        std::fs::create_dir_all(work_dir.join("source")).unwrap();
        std::fs::write(&log_path, b"{}\n").unwrap();

        drop(Scratch::new(work_dir.clone(), log_path.clone()));
        assert!(!work_dir.exists());
        assert!(!log_path.exists());
    }
}
