//! Swarm-mode orchestrator.
//!
//! Stacks are applied through `docker stack deploy`, which owns the compose
//! translation and pruning of removed services. Task and node listings come
//! from `docker inspect`, whose output is the engine's own task and node
//! objects.

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{Node, Task};
use chrono::{DateTime, Utc};
use dockyard_core::orchestrator::{
    LogOptions, NodeSummary, Orchestrator, RawLogStream, TaskSummary,
};
use dockyard_core::stack::StackSpecification;
use dockyard_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::engine::EngineClient;

/// Seconds before an engine API request times out.
const API_TIMEOUT_SECS: u64 = 120;

pub struct SwarmOrchestrator {
    docker: Docker,
    engine: EngineClient,
}

impl SwarmOrchestrator {
    /// Connect to the engine listening on `socket`.
    pub fn connect(socket: impl Into<PathBuf>) -> Result<Self> {
        let socket = socket.into();
        let docker = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            API_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(orchestrator_error)?;
        Ok(Self {
            docker,
            engine: EngineClient::new(socket),
        })
    }

    fn socket(&self) -> &Path {
        self.engine.socket()
    }

    /// `docker stack deploy` reading the compose document from stdin.
    pub fn stack_deploy_command(socket: &Path, stack: &str) -> Command {
        let mut command = Command::new("docker");
        command
            .args([
                "stack",
                "deploy",
                "--prune",
                "--with-registry-auth",
                "--compose-file",
                "-",
                stack,
            ])
            .env("DOCKER_HOST", format!("unix://{}", socket.display()));
        command
    }

    /// A `docker` invocation against the engine on `socket`.
    pub fn docker_command<I, S>(socket: &Path, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new("docker");
        command
            .args(args)
            .env("DOCKER_HOST", format!("unix://{}", socket.display()))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Run `docker` and return its stdout.
    async fn docker_output<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = Self::docker_command(self.socket(), args)
            .output()
            .await
            .map_err(|e| Error::Orchestrator(format!("failed to start docker: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Orchestrator(format!(
                "docker exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Inspect objects by id, `kind` being `task` or `node`.
    async fn inspect<T>(&self, kind: &str, ids: Vec<String>) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = match kind {
            "node" => vec!["node".to_string(), "inspect".to_string()],
            _ => vec!["inspect".to_string(), "--type".to_string(), kind.to_string()],
        };
        args.extend(ids);
        let stdout = self.docker_output(args).await?;
        parse_inspect(&stdout)
    }
}

/// One id per non-empty line, as printed by `-q`.
fn parse_ids(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_inspect<T>(stdout: &[u8]) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_slice(stdout)
        .map_err(|e| Error::Orchestrator(format!("unexpected docker inspect output: {}", e)))
}

fn orchestrator_error(e: bollard::errors::Error) -> Error {
    Error::Orchestrator(e.to_string())
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn task_summary(service: &str, task: Task) -> TaskSummary {
    let status = task.status.unwrap_or_default();
    TaskSummary {
        id: task.id.unwrap_or_default(),
        service: service.to_string(),
        node_id: task.node_id.filter(|n| !n.is_empty()),
        slot: task.slot,
        state: status.state.map(|s| s.to_string()).unwrap_or_default(),
        desired_state: task
            .desired_state
            .map(|s| s.to_string())
            .unwrap_or_default(),
        message: status.message.filter(|m| !m.is_empty()),
        error: status.err.filter(|e| !e.is_empty()),
        image: task
            .spec
            .and_then(|spec| spec.container_spec)
            .and_then(|container| container.image),
        updated_at: task.updated_at.as_deref().and_then(parse_time),
    }
}

pub fn node_summary(node: Node) -> NodeSummary {
    let spec = node.spec.unwrap_or_default();
    let status = node.status.unwrap_or_default();
    NodeSummary {
        id: node.id.unwrap_or_default(),
        hostname: node
            .description
            .and_then(|d| d.hostname)
            .unwrap_or_default(),
        role: spec.role.map(|r| r.to_string()).unwrap_or_default(),
        availability: spec
            .availability
            .map(|a| a.to_string())
            .unwrap_or_default(),
        state: status.state.map(|s| s.to_string()).unwrap_or_default(),
        address: status.addr.filter(|a| !a.is_empty()),
    }
}

#[async_trait]
impl Orchestrator for SwarmOrchestrator {
    fn name(&self) -> &'static str {
        "swarm"
    }

    async fn apply_stack(&self, stack: &str, spec: &StackSpecification) -> Result<()> {
        let document = serde_yaml::to_string(spec)
            .map_err(|e| Error::Internal(format!("serializing stack {}: {}", stack, e)))?;
        info!(stack = %stack, services = spec.services.len(), "Applying stack");
        debug!(stack = %stack, document = %document, "Stack document");

        let mut child = Self::stack_deploy_command(self.socket(), stack)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Orchestrator(format!("failed to start docker: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("stdin not captured".to_string()))?;
        stdin.write_all(document.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stack = %stack, status = ?output.status.code(), "Stack deploy rejected");
            return Err(Error::Orchestrator(format!(
                "docker stack deploy {} failed: {}",
                stack,
                stderr.trim()
            )));
        }

        info!(stack = %stack, "Stack applied");
        Ok(())
    }

    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskSummary>> {
        match self.docker.inspect_service(service, None).await {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(Error::NotFound(format!("service {}", service))),
            Err(e) => return Err(orchestrator_error(e)),
        }

        let ids = parse_ids(
            &self
                .docker_output(["service", "ps", "--no-trunc", "--quiet", service])
                .await?,
        );
        let tasks: Vec<Task> = self.inspect("task", ids).await?;
        Ok(tasks
            .into_iter()
            .map(|task| task_summary(service, task))
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        let ids = parse_ids(&self.docker_output(["node", "ls", "--quiet"]).await?);
        let nodes: Vec<Node> = self.inspect("node", ids).await?;
        Ok(nodes.into_iter().map(node_summary).collect())
    }

    async fn service_logs(&self, service: &str, options: LogOptions) -> Result<RawLogStream> {
        self.engine.service_logs(service, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        NodeDescription, NodeSpec, NodeSpecAvailabilityEnum, NodeSpecRoleEnum, NodeState,
        NodeStatus, TaskSpec, TaskSpecContainerSpec, TaskState, TaskStatus,
    };

    #[test]
    fn test_stack_deploy_command() {
        let command =
            SwarmOrchestrator::stack_deploy_command(Path::new("/var/run/docker.sock"), "shop");
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "stack",
                "deploy",
                "--prune",
                "--with-registry-auth",
                "--compose-file",
                "-",
                "shop"
            ]
        );
    }

    #[test]
    fn test_docker_command_targets_socket() {
        let command = SwarmOrchestrator::docker_command(
            Path::new("/run/dockyard.sock"),
            ["node", "ls", "--quiet"],
        );
        let std = command.as_std();
        let host = std
            .get_envs()
            .find(|(key, _)| *key == "DOCKER_HOST")
            .and_then(|(_, value)| value)
            .map(|value| value.to_string_lossy().to_string());
        assert_eq!(host.as_deref(), Some("unix:///run/dockyard.sock"));
        let args: Vec<String> = std
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["node", "ls", "--quiet"]);
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids(b"abc\n\n  def \n"), vec!["abc", "def"]);
        assert!(parse_ids(b"").is_empty());
    }

    #[test]
    fn test_tasks_from_inspect_output() {
        let stdout = br#"[{
            "ID": "kq3v8x0ho0cw",
            "UpdatedAt": "2024-05-01T10:00:03.123456789Z",
            "Spec": {"ContainerSpec": {"Image": "shop-web:abc@sha256:00ff"}},
            "ServiceID": "s1",
            "Slot": 1,
            "NodeID": "n1",
            "Status": {
                "Timestamp": "2024-05-01T10:00:03Z",
                "State": "failed",
                "Message": "started",
                "Err": "task: non-zero exit (1)"
            },
            "DesiredState": "shutdown"
        }]"#;

        let tasks: Vec<Task> = parse_inspect(stdout).unwrap();
        let summary = task_summary("shop_web", tasks.into_iter().next().unwrap());
        assert_eq!(summary.id, "kq3v8x0ho0cw");
        assert_eq!(summary.node_id.as_deref(), Some("n1"));
        assert_eq!(summary.slot, Some(1));
        assert_eq!(summary.state, "failed");
        assert_eq!(summary.desired_state, "shutdown");
        assert_eq!(summary.error.as_deref(), Some("task: non-zero exit (1)"));
        assert_eq!(summary.image.as_deref(), Some("shop-web:abc@sha256:00ff"));
        assert!(summary.updated_at.is_some());
    }

    #[test]
    fn test_nodes_from_inspect_output() {
        let stdout = br#"[{
            "ID": "n1",
            "Spec": {"Role": "manager", "Availability": "drain"},
            "Description": {"Hostname": "manager-1"},
            "Status": {"State": "ready", "Addr": "10.0.0.1"}
        }]"#;

        let nodes: Vec<Node> = parse_inspect(stdout).unwrap();
        let summary = node_summary(nodes.into_iter().next().unwrap());
        assert_eq!(summary.hostname, "manager-1");
        assert_eq!(summary.role, "manager");
        assert_eq!(summary.availability, "drain");
        assert_eq!(summary.state, "ready");
        assert_eq!(summary.address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_inspect_output_must_be_json() {
        let result: Result<Vec<Node>> = parse_inspect(b"Error: No such node");
        assert!(matches!(result, Err(Error::Orchestrator(_))));
    }

    #[test]
    fn test_task_summary() {
        let task = Task {
            id: Some("t1".to_string()),
            node_id: Some("n1".to_string()),
            slot: Some(2),
            desired_state: Some(TaskState::RUNNING),
            status: Some(TaskStatus {
                state: Some(TaskState::RUNNING),
                message: Some("started".to_string()),
                err: Some(String::new()),
                ..Default::default()
            }),
            spec: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some("shop-web:abc".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            updated_at: Some("2024-05-01T10:00:00.5Z".to_string()),
            ..Default::default()
        };

        let summary = task_summary("shop_web", task);
        assert_eq!(summary.id, "t1");
        assert_eq!(summary.slot, Some(2));
        assert_eq!(summary.state, "running");
        assert_eq!(summary.desired_state, "running");
        assert_eq!(summary.error, None);
        assert_eq!(summary.image.as_deref(), Some("shop-web:abc"));
        assert!(summary.updated_at.is_some());
    }

    #[test]
    fn test_node_summary() {
        let node = Node {
            id: Some("n1".to_string()),
            description: Some(NodeDescription {
                hostname: Some("worker-1".to_string()),
                ..Default::default()
            }),
            spec: Some(NodeSpec {
                role: Some(NodeSpecRoleEnum::WORKER),
                availability: Some(NodeSpecAvailabilityEnum::ACTIVE),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                state: Some(NodeState::READY),
                addr: Some("10.0.0.2".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let summary = node_summary(node);
        assert_eq!(summary.hostname, "worker-1");
        assert_eq!(summary.role, "worker");
        assert_eq!(summary.availability, "active");
        assert_eq!(summary.state, "ready");
        assert_eq!(summary.address.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    #[ignore = "requires a swarm manager on the local socket"]
    async fn test_list_nodes_against_local_engine() {
        let swarm = SwarmOrchestrator::connect("/var/run/docker.sock").unwrap();
        let nodes = swarm.list_nodes().await.unwrap();
        assert!(!nodes.is_empty());
    }
}
