//! Build backend driving the local toolchain (git, docker, pack, nixpacks).

use async_trait::async_trait;
use dockyard_config::BuildsConfig;
use dockyard_core::builder::{BuildBackend, BuildRequest, LogSink};
use dockyard_core::generation::BuildMethod;
use dockyard_core::{Error, ResourceId, Result};
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use crate::git;
use crate::process::run_logged;

/// Directory inside the task's scratch directory holding the checkout.
const SOURCE_DIR: &str = "source";

/// Prefix of host variables that never reach build processes.
const RESERVED_ENV_PREFIX: &str = "DOCKYARD_";

/// Reference for an image built by a deployment:
/// `[{registry}/]{project}-{service}:{deployment_id}`.
pub fn image_reference(
    registry: Option<&str>,
    project: &str,
    service: &str,
    deployment_id: ResourceId,
) -> String {
    let name = format!("{}-{}:{}", project, service, deployment_id);
    match registry.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty()) {
        Some(registry) => format!("{}/{}", registry, name),
        None => name,
    }
}

/// Resolve `build_path` inside `root`, refusing paths that leave it.
pub fn resolve_context(root: &Path, build_path: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(build_path.trim()).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidConfiguration(format!(
                    "build path {} escapes the source directory",
                    build_path
                )));
            }
        }
    }
    Ok(resolved)
}

pub struct LocalBuildBackend {
    config: BuildsConfig,
}

impl LocalBuildBackend {
    pub fn new(config: BuildsConfig) -> Self {
        Self { config }
    }

    fn source_dir(request: &BuildRequest) -> PathBuf {
        request.work_dir.join(SOURCE_DIR)
    }

    /// Names removed from the inherited environment of build processes.
    fn stripped_env(&self) -> Vec<String> {
        let mut names = self.config.strip_env.clone();
        names.extend(
            std::env::vars_os()
                .filter_map(|(key, _)| key.into_string().ok())
                .filter(|key| key.starts_with(RESERVED_ENV_PREFIX)),
        );
        names
    }

    /// The command producing the image for `request`.
    pub fn build_command(&self, request: &BuildRequest) -> Result<Command> {
        let context = resolve_context(&Self::source_dir(request), &request.build_path)?;
        let context_arg = context.to_string_lossy().to_string();

        let mut command = match &request.build_method {
            BuildMethod::Dockerfile { dockerfile } => {
                let dockerfile = resolve_context(&context, dockerfile)?;
                let mut command = Command::new("docker");
                command
                    .arg("build")
                    .arg("-f")
                    .arg(&dockerfile)
                    .arg("-t")
                    .arg(&request.image);
                for (key, value) in &request.build_args {
                    command.arg("--build-arg").arg(format!("{}={}", key, value));
                }
                command.arg(&context_arg);
                command
            }
            BuildMethod::Buildpack { builder } => {
                let builder = builder
                    .as_deref()
                    .filter(|b| !b.is_empty())
                    .unwrap_or(&self.config.buildpack_builder);
                let mut command = Command::new("pack");
                command
                    .arg("build")
                    .arg(&request.image)
                    .arg("--path")
                    .arg(&context_arg)
                    .arg("--builder")
                    .arg(builder);
                for (key, value) in &request.build_args {
                    command.arg("--env").arg(format!("{}={}", key, value));
                }
                command
            }
            BuildMethod::Nixpacks => {
                let mut command = Command::new("nixpacks");
                command
                    .arg("build")
                    .arg(&context_arg)
                    .arg("--name")
                    .arg(&request.image);
                for (key, value) in &request.build_args {
                    command.arg("--env").arg(format!("{}={}", key, value));
                }
                command
            }
        };

        for name in self.stripped_env() {
            command.env_remove(name);
        }
        command.current_dir(&request.work_dir);
        Ok(command)
    }

    async fn push(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<()> {
        log.notice(&format!("Pushing {}", request.image)).await?;
        let mut command = Command::new("docker");
        command.arg("push").arg(&request.image);
        for name in self.stripped_env() {
            command.env_remove(name);
        }

        let outcome = run_logged(command, log, &[]).await?;
        if !outcome.success() {
            return Err(Error::BuildFailed {
                message: outcome.describe("docker push"),
                output: outcome.tail_text(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BuildBackend for LocalBuildBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch_source(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<()> {
        let url = request.source.clone_url().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "{} source has nothing to clone",
                request.source.as_str()
            ))
        })?;
        tokio::fs::create_dir_all(&request.work_dir).await?;
        git::clone(
            &url,
            request.source.branch(),
            &Self::source_dir(request),
            log,
        )
        .await
    }

    async fn build_image(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<String> {
        let command = self.build_command(request)?;
        let program = command.as_std().get_program().to_string_lossy().to_string();

        info!(
            deployment_id = %request.deployment_id,
            image = %request.image,
            builder = %program,
            "Building image"
        );
        log.notice(&format!("Building {} with {}", request.image, program))
            .await?;

        let outcome = run_logged(command, log, &[]).await?;
        if !outcome.success() {
            return Err(Error::BuildFailed {
                message: outcome.describe(&program),
                output: outcome.tail_text(),
            });
        }

        if self.config.registry.is_some() {
            self.push(request, log).await?;
        }

        log.notice(&format!("Built {}", request.image)).await?;
        Ok(request.image.clone())
    }
}
