//! Build-log and runtime-log streams.
//!
//! A running build is read by tailing its log file; once the deployment is
//! finished the stored archive is read instead. Runtime logs come from the
//! orchestrator, demultiplexed and merged into timestamp order.

use dockyard_builder::archive::decompress_logs;
use dockyard_config::{LogsConfig, OrchestratorConfig};
use dockyard_core::deployment::{Deployment, DeploymentStatus};
use dockyard_core::log::LogLine;
use dockyard_core::orchestrator::{LogOptions, Orchestrator};
use dockyard_core::{ResourceId, Result};
use dockyard_db::Store;
use dockyard_deployer::logs::{MergeOptions, demux_stream, merge_ordered};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::scheduler::{BuildScheduler, TaskHandle};

pub type LogStream = BoxStream<'static, LogLine>;

#[derive(Clone)]
pub struct LogStreams {
    store: Arc<dyn Store>,
    scheduler: BuildScheduler,
    orchestrator: Arc<dyn Orchestrator>,
    orchestrator_config: OrchestratorConfig,
    logs_config: LogsConfig,
}

impl LogStreams {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: BuildScheduler,
        orchestrator: Arc<dyn Orchestrator>,
        orchestrator_config: OrchestratorConfig,
        logs_config: LogsConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            orchestrator,
            orchestrator_config,
            logs_config,
        }
    }

    /// Build output of a deployment: live while its task runs, archived
    /// afterwards. A deployment still waiting for its build is followed
    /// until the task shows up.
    pub async fn stream_build_logs(
        &self,
        deployment_id: ResourceId,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        self.store.get_deployment(deployment_id).await?;

        let state = TailState {
            deployment_id,
            scheduler: self.scheduler.clone(),
            handle: None,
            store: self.store.clone(),
            poll: Duration::from_millis(self.logs_config.poll_interval_ms),
            cancel: cancel.clone(),
            tail: Tail::Pending,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            state.next_line().await.map(|line| (line, state))
        });
        Ok(stream.take_until(cancel.cancelled_owned()).boxed())
    }

    /// Output of every task of a service, in timestamp order within the
    /// configured hold window. Fetch failures become one `stderr` line.
    pub async fn stream_runtime_logs(
        &self,
        service_id: ResourceId,
        tail: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        let service = self.store.get_service(service_id).await?;
        let project = self.store.get_project(service.project_id).await?;
        let name = self
            .orchestrator_config
            .service_name(&project.name, &service.name);

        let options = LogOptions {
            follow: true,
            tail,
            since: None,
        };
        let lines = match self.orchestrator.service_logs(&name, options).await {
            Ok(raw) => merge_ordered(
                demux_stream(raw),
                MergeOptions {
                    hold: Duration::from_millis(self.logs_config.hold_window_ms),
                    capacity: self.logs_config.merge_capacity,
                },
            ),
            Err(e) => {
                warn!(service = %name, error = %e, "Failed to fetch service logs");
                futures::stream::iter(vec![LogLine::stderr(format!(
                    "failed to fetch logs for {}: {}",
                    name, e
                ))])
                .boxed()
            }
        };
        Ok(lines.take_until(cancel.cancelled_owned()).boxed())
    }
}

fn archived_lines(deployment: &Deployment) -> Vec<LogLine> {
    match &deployment.build_logs {
        Some(archive) => match decompress_logs(archive) {
            Ok(lines) => lines,
            Err(e) => vec![LogLine::stderr(format!(
                "build log archive is unreadable: {}",
                e
            ))],
        },
        None => vec![LogLine::notice(format!(
            "No build logs recorded for deployment {}",
            deployment.id
        ))],
    }
}

enum Tail {
    /// No task registered yet.
    Pending,
    /// Waiting for the task to create its log file.
    Opening,
    Reading {
        reader: BufReader<File>,
        partial: String,
    },
    /// Lines served from the archive after the task finished.
    Archived(VecDeque<LogLine>),
    Done,
}

struct TailState {
    deployment_id: ResourceId,
    scheduler: BuildScheduler,
    handle: Option<TaskHandle>,
    store: Arc<dyn Store>,
    poll: Duration,
    cancel: CancellationToken,
    tail: Tail,
}

impl TailState {
    /// Sleep until the next poll, the task finishing or cancellation.
    /// Returns false when cancelled.
    async fn wait(&mut self) -> bool {
        let handle = self.handle.clone();
        let finished = async move {
            match handle {
                Some(mut handle) => handle.wait_finished().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = finished => true,
            _ = tokio::time::sleep(self.poll) => true,
        }
    }

    /// A task that vanished counts as finished.
    fn finished(&self) -> bool {
        self.handle.as_ref().is_none_or(TaskHandle::is_finished)
    }

    async fn archive(&self) -> VecDeque<LogLine> {
        match self.store.get_deployment(self.deployment_id).await {
            Ok(deployment) => archived_lines(&deployment).into(),
            Err(e) => VecDeque::from([LogLine::stderr(format!(
                "failed to load build log: {}",
                e
            ))]),
        }
    }

    async fn next_line(&mut self) -> Option<LogLine> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match &mut self.tail {
                Tail::Done => return None,
                Tail::Archived(lines) => return lines.pop_front(),
                Tail::Pending => {
                    // Look the task up before reloading the deployment: a
                    // task records its final status before it unregisters.
                    if let Some(handle) = self.scheduler.lookup(self.deployment_id) {
                        debug!(deployment_id = %self.deployment_id, "Tailing live build log");
                        self.handle = Some(handle);
                        self.tail = Tail::Opening;
                        continue;
                    }
                    match self.store.get_deployment(self.deployment_id).await {
                        Ok(deployment) if deployment.status == DeploymentStatus::BuildPending => {
                            if !self.wait().await {
                                return None;
                            }
                        }
                        Ok(deployment) => {
                            self.tail = Tail::Archived(archived_lines(&deployment).into());
                        }
                        Err(e) => {
                            self.tail = Tail::Done;
                            return Some(LogLine::stderr(format!(
                                "failed to load build log: {}",
                                e
                            )));
                        }
                    }
                }
                Tail::Opening => {
                    // Check before opening: a finished task has already
                    // archived its log and removed the file.
                    let finished = self.finished();
                    let Some(log_path) = self.handle.as_ref().map(|h| h.log_path().to_path_buf())
                    else {
                        self.tail = Tail::Pending;
                        continue;
                    };
                    match File::open(&log_path).await {
                        Ok(file) => {
                            self.tail = Tail::Reading {
                                reader: BufReader::new(file),
                                partial: String::new(),
                            };
                        }
                        Err(_) if finished => self.tail = Tail::Archived(self.archive().await),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            if !self.wait().await {
                                return None;
                            }
                        }
                        Err(e) => {
                            self.tail = Tail::Done;
                            return Some(LogLine::stderr(format!(
                                "failed to open build log: {}",
                                e
                            )));
                        }
                    }
                }
                Tail::Reading { reader, partial } => {
                    let finished = self.handle.as_ref().is_none_or(TaskHandle::is_finished);
                    match reader.read_line(partial).await {
                        Ok(0) if finished => {
                            // Flush a final unterminated line, if any.
                            let rest = std::mem::take(partial);
                            self.tail = Tail::Done;
                            if let Some(line) = LogLine::from_json_line(&rest) {
                                return Some(line);
                            }
                        }
                        Ok(0) => {
                            if !self.wait().await {
                                return None;
                            }
                        }
                        Ok(_) if partial.ends_with('\n') => {
                            let line = std::mem::take(partial);
                            if let Some(line) = LogLine::from_json_line(&line) {
                                return Some(line);
                            }
                        }
                        // Writer is mid-line; keep what we have.
                        Ok(_) => {}
                        Err(e) => {
                            self.tail = Tail::Done;
                            return Some(LogLine::stderr(format!(
                                "failed to read build log: {}",
                                e
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BuildTask;
    use crate::testing::{FakeBackend, FakeOrchestrator, frame, github_config, seed_deployment};
    use dockyard_builder::archive::compress_lines;
    use dockyard_core::builder::BuildRequest;
    use dockyard_core::generation::BuildMethod;
    use dockyard_core::log::LogLevel;
    use dockyard_db::MemoryStore;
    use std::path::Path;

    fn streams(store: Arc<MemoryStore>, scheduler: BuildScheduler, orchestrator: FakeOrchestrator) -> LogStreams {
        LogStreams::new(
            store,
            scheduler,
            Arc::new(orchestrator),
            OrchestratorConfig::default(),
            LogsConfig {
                poll_interval_ms: 10,
                hold_window_ms: 20,
                merge_capacity: 16,
            },
        )
    }

    #[tokio::test]
    async fn test_archived_build_logs() {
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        let archive = compress_lines(&[LogLine::notice("cloned"), LogLine::notice("built")]).unwrap();
        store
            .finish_deployment(deployment.id, DeploymentStatus::Failed, None, Some(archive))
            .await
            .unwrap();

        let logs = streams(store, BuildScheduler::new(1), FakeOrchestrator::default());
        let lines: Vec<LogLine> = logs
            .stream_build_logs(deployment.id, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["cloned", "built"]);
    }

    #[tokio::test]
    async fn test_missing_archive_yields_notice() {
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        store
            .finish_deployment(deployment.id, DeploymentStatus::Failed, None, None)
            .await
            .unwrap();

        let logs = streams(store, BuildScheduler::new(1), FakeOrchestrator::default());
        let lines: Vec<LogLine> = logs
            .stream_build_logs(deployment.id, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, LogLevel::Notice);
    }

    fn build_task(store: &Arc<MemoryStore>, backend: FakeBackend, deployment: &Deployment, dir: &Path) -> BuildTask {
        BuildTask::new(
            store.clone(),
            Arc::new(backend),
            deployment.service_id,
            BuildRequest {
                deployment_id: deployment.id,
                source: github_config("acme/web").source,
                build_method: BuildMethod::Nixpacks,
                build_path: "/".to_string(),
                build_args: Vec::new(),
                work_dir: dir.join("work"),
                image: "web:1".to_string(),
            },
            dir.join("build.log"),
        )
    }

    #[tokio::test]
    async fn test_pending_build_is_followed_once_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        let scheduler = BuildScheduler::new(1);

        // Subscribe before the task exists.
        let logs = streams(store.clone(), scheduler.clone(), FakeOrchestrator::default());
        let stream = logs
            .stream_build_logs(deployment.id, CancellationToken::new())
            .await
            .unwrap();
        let reader = tokio::spawn(async move { stream.collect::<Vec<_>>().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = scheduler
            .submit(build_task(&store, FakeBackend::default(), &deployment, dir.path()))
            .unwrap();
        result.await.unwrap();

        let lines = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(lines.iter().any(|l| l.message == "fetched source"));
        assert!(lines.iter().any(|l| l.message == "Image web:1 ready"));
    }

    #[tokio::test]
    async fn test_pending_build_failed_without_task_ends_stream() {
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;

        let logs = streams(store.clone(), BuildScheduler::new(1), FakeOrchestrator::default());
        let stream = logs
            .stream_build_logs(deployment.id, CancellationToken::new())
            .await
            .unwrap();
        let reader = tokio::spawn(async move { stream.collect::<Vec<_>>().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let archive = compress_lines(&[LogLine::notice("Build failed: no builder")]).unwrap();
        store
            .finish_deployment(deployment.id, DeploymentStatus::Failed, None, Some(archive))
            .await
            .unwrap();

        let lines = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["Build failed: no builder"]);
    }

    #[tokio::test]
    async fn test_live_build_log_is_tailed_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        let (backend, gate) = FakeBackend::gated(0);
        let scheduler = BuildScheduler::new(1);

        let task = BuildTask::new(
            store.clone(),
            Arc::new(backend),
            deployment.service_id,
            BuildRequest {
                deployment_id: deployment.id,
                source: github_config("acme/web").source,
                build_method: BuildMethod::Nixpacks,
                build_path: "/".to_string(),
                build_args: Vec::new(),
                work_dir: dir.path().join("work"),
                image: "web:1".to_string(),
            },
            dir.path().join("build.log"),
        );
        let result = scheduler.submit(task).unwrap();

        let logs = streams(store, scheduler.clone(), FakeOrchestrator::default());
        let mut stream = logs
            .stream_build_logs(deployment.id, CancellationToken::new())
            .await
            .unwrap();

        // Output written before the build is released arrives live.
        let mut seen = Vec::new();
        while !seen.iter().any(|l: &LogLine| l.message == "fetched source") {
            seen.push(stream.next().await.unwrap());
        }

        gate.add_permits(1);
        result.await.unwrap();
        seen.extend(stream.collect::<Vec<_>>().await);
        assert!(seen.iter().any(|l| l.message == "Step 1/1 : FROM scratch"));
        assert!(seen.iter().any(|l| l.message == "Image web:1 ready"));
    }

    #[tokio::test]
    async fn test_cancel_stops_tailing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;
        let (backend, gate) = FakeBackend::gated(0);
        let scheduler = BuildScheduler::new(1);

        let task = BuildTask::new(
            store.clone(),
            Arc::new(backend),
            deployment.service_id,
            BuildRequest {
                deployment_id: deployment.id,
                source: github_config("acme/web").source,
                build_method: BuildMethod::Nixpacks,
                build_path: "/".to_string(),
                build_args: Vec::new(),
                work_dir: dir.path().join("work"),
                image: "web:1".to_string(),
            },
            dir.path().join("build.log"),
        );
        let result = scheduler.submit(task).unwrap();

        let cancel = CancellationToken::new();
        let logs = streams(store, scheduler.clone(), FakeOrchestrator::default());
        let stream = logs.stream_build_logs(deployment.id, cancel.clone()).await.unwrap();

        let reader = tokio::spawn(async move { stream.collect::<Vec<_>>().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();

        gate.add_permits(1);
        result.await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_logs_are_demuxed_and_ordered() {
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;

        let mut chunk = frame(1, "2024-05-01T10:00:02Z second\n");
        chunk.extend(frame(2, "2024-05-01T10:00:01Z first\n"));
        let orchestrator = FakeOrchestrator {
            log_chunks: vec![chunk[..5].to_vec(), chunk[5..].to_vec()],
            ..Default::default()
        };

        let logs = streams(store, BuildScheduler::new(1), orchestrator);
        let lines: Vec<LogLine> = logs
            .stream_runtime_logs(deployment.service_id, Some(10), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(lines[0].level, LogLevel::Stderr);
    }

    #[tokio::test]
    async fn test_runtime_log_failure_is_one_stderr_line() {
        let store = Arc::new(MemoryStore::new());
        let deployment = seed_deployment(&store).await;

        let logs = streams(store, BuildScheduler::new(1), FakeOrchestrator::default());
        let lines: Vec<LogLine> = logs
            .stream_runtime_logs(deployment.service_id, None, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, LogLevel::Stderr);
        assert!(lines[0].message.contains("not found"));
    }
}
