//! Build backend seam.
//!
//! A build backend turns a buildable source into a container image. The
//! default implementation shells out to git and the build tools; tests plug
//! in fakes.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::generation::{BuildMethod, Source};
use crate::log::LogLevel;
use crate::{ResourceId, Result};

/// Destination for build output lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, level: LogLevel, message: &str) -> Result<()>;

    async fn notice(&self, message: &str) -> Result<()> {
        self.write(LogLevel::Notice, message).await
    }
}

/// Everything a backend needs to produce one image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub deployment_id: ResourceId,
    pub source: Source,
    pub build_method: BuildMethod,
    /// Build context relative to the checkout root.
    pub build_path: String,
    /// Parsed generation environment, forwarded as build arguments.
    pub build_args: Vec<(String, String)>,
    /// Scratch directory owned by the build task.
    pub work_dir: PathBuf,
    /// Fully qualified reference to tag the image with.
    pub image: String,
}

#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Check out the source into `request.work_dir`.
    async fn fetch_source(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<()>;

    /// Build (and push, when configured) the image. Returns the reference
    /// to deploy.
    async fn build_image(&self, request: &BuildRequest, log: &dyn LogSink) -> Result<String>;
}
