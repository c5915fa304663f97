//! Generations: configuration snapshots of a service.
//!
//! A generation becomes immutable once it is referenced as a service's
//! deployed generation; edits always go to the latest generation, which is
//! forked from the deployed one when necessary (see the store's
//! `editable_generation`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::{Error, ResourceId, Result};

/// Error returned when a stored or orchestrator string does not map to an
/// enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Where the service's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    /// Pull a ready-made image from a registry. Never built.
    Docker { image: String },
    /// Hosted repository in `owner/name` form.
    #[serde(rename = "github")]
    GitHub {
        repository: String,
        branch: Option<String>,
    },
    /// Any git remote reachable by url.
    Git { url: String, branch: Option<String> },
}

impl Source {
    /// Whether deploying this source requires building an image.
    pub fn is_buildable(&self) -> bool {
        !matches!(self, Source::Docker { .. })
    }

    /// The stored registry image, for direct image sources.
    pub fn registry_image(&self) -> Option<&str> {
        match self {
            Source::Docker { image } => Some(image),
            _ => None,
        }
    }

    /// Remote to clone for buildable sources.
    pub fn clone_url(&self) -> Option<String> {
        match self {
            Source::Docker { .. } => None,
            Source::GitHub { repository, .. } => {
                Some(format!("https://github.com/{}.git", repository))
            }
            Source::Git { url, .. } => Some(url.clone()),
        }
    }

    /// Branch to check out; `None` means the remote's default branch.
    pub fn branch(&self) -> Option<&str> {
        match self {
            Source::Docker { .. } => None,
            Source::GitHub { branch, .. } | Source::Git { branch, .. } => {
                branch.as_deref().filter(|b| !b.is_empty())
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Docker { .. } => "docker",
            Source::GitHub { .. } => "github",
            Source::Git { .. } => "git",
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::Docker {
            image: String::new(),
        }
    }
}

/// How a buildable source is turned into an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildMethod {
    Dockerfile { dockerfile: String },
    Buildpack { builder: Option<String> },
    /// Automatic language detection.
    Nixpacks,
}

impl Default for BuildMethod {
    fn default() -> Self {
        BuildMethod::Dockerfile {
            dockerfile: "Dockerfile".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Spread `replicas` tasks across the cluster.
    #[default]
    Replicated,
    /// Exactly one task per node.
    Global,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Replicated => "replicated",
            DeployMode::Global => "global",
        }
    }
}

impl FromStr for DeployMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "replicated" => Ok(DeployMode::Replicated),
            "global" => Ok(DeployMode::Global),
            other => Err(ParseEnumError::new("deploy mode", other)),
        }
    }
}

/// Restart policy as configured by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    #[default]
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }

    /// Orchestrator vocabulary for this policy.
    pub fn condition(&self) -> RestartCondition {
        match self {
            RestartPolicy::No => RestartCondition::None,
            RestartPolicy::OnFailure => RestartCondition::OnFailure,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => RestartCondition::Any,
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            other => Err(ParseEnumError::new("restart policy", other)),
        }
    }
}

/// Swarm restart condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartCondition {
    None,
    OnFailure,
    Any,
}

impl RestartCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartCondition::None => "none",
            RestartCondition::OnFailure => "on-failure",
            RestartCondition::Any => "any",
        }
    }

    /// Policy a condition read back from the orchestrator corresponds to.
    /// `any` is ambiguous; it maps to `Always`.
    pub fn policy(&self) -> RestartPolicy {
        match self {
            RestartCondition::None => RestartPolicy::No,
            RestartCondition::OnFailure => RestartPolicy::OnFailure,
            RestartCondition::Any => RestartPolicy::Always,
        }
    }
}

impl FromStr for RestartCondition {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(RestartCondition::None),
            "on-failure" => Ok(RestartCondition::OnFailure),
            "any" => Ok(RestartCondition::Any),
            other => Err(ParseEnumError::new("restart condition", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

impl FromStr for PortProtocol {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(PortProtocol::Tcp),
            "udp" => Ok(PortProtocol::Udp),
            other => Err(ParseEnumError::new("port protocol", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMode {
    #[default]
    Ingress,
    Host,
}

impl PortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortMode::Ingress => "ingress",
            PortMode::Host => "host",
        }
    }
}

impl FromStr for PortMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(PortMode::Ingress),
            "host" => Ok(PortMode::Host),
            other => Err(ParseEnumError::new("port mode", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Bind,
    #[default]
    Volume,
    Tmpfs,
}

impl VolumeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Bind => "bind",
            VolumeKind::Volume => "volume",
            VolumeKind::Tmpfs => "tmpfs",
        }
    }
}

impl FromStr for VolumeKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bind" => Ok(VolumeKind::Bind),
            "volume" => Ok(VolumeKind::Volume),
            "tmpfs" => Ok(VolumeKind::Tmpfs),
            other => Err(ParseEnumError::new("volume type", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartSettings {
    pub policy: RestartPolicy,
    pub max_attempts: Option<u32>,
    pub delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    /// `false` disables any health check, including one baked into the image.
    pub enabled: bool,
    /// Shell command; `None` keeps the image's own check.
    pub command: Option<String>,
    pub interval_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub retries: Option<u32>,
    pub start_period_seconds: Option<u64>,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            interval_seconds: None,
            timeout_seconds: None,
            retries: None,
            start_period_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingLimits {
    /// Size with unit suffix, e.g. `10m`.
    pub max_size: Option<String>,
    pub max_files: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub pids: Option<i64>,
}

/// Scalar (non-collection) settings of a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub source: Source,
    pub build_method: BuildMethod,
    /// Build context relative to the repository root.
    pub build_path: String,
    /// Dotenv-formatted environment, forwarded as build args and runtime env.
    pub environment: String,
    pub command: Option<String>,
    pub entrypoint: Option<String>,
    pub replicas: u32,
    pub max_replicas_per_node: Option<u32>,
    pub deploy_mode: DeployMode,
    /// Start the new task before stopping the old one on update/rollback.
    pub zero_downtime: bool,
    pub restart: RestartSettings,
    pub health_check: HealthCheckPolicy,
    pub logging: LoggingLimits,
    pub resources: ResourceLimits,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            source: Source::default(),
            build_method: BuildMethod::default(),
            build_path: "/".to_string(),
            environment: String::new(),
            command: None,
            entrypoint: None,
            replicas: 1,
            max_replicas_per_node: None,
            deploy_mode: DeployMode::default(),
            zero_downtime: false,
            restart: RestartSettings::default(),
            health_check: HealthCheckPolicy::default(),
            logging: LoggingLimits::default(),
            resources: ResourceLimits::default(),
        }
    }
}

/// A record owned by exactly one generation.
pub trait ChildRecord: Clone + PartialEq + Serialize {
    /// Stable identity preserved across generation clones. Records without
    /// one are compared by full value.
    fn identity(&self) -> Option<ResourceId>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Option<ResourceId>,
    pub domain: String,
    pub internal_port: u16,
    pub https: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: Option<ResourceId>,
    /// Container-side port.
    pub target: u16,
    pub published: u16,
    pub protocol: PortProtocol,
    pub mode: PortMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: Option<ResourceId>,
    pub kind: VolumeKind,
    /// Host path or volume name; absent for tmpfs.
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sysctl {
    pub id: Option<ResourceId>,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub id: Option<ResourceId>,
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

macro_rules! child_record {
    ($($ty:ty),*) => {
        $(impl ChildRecord for $ty {
            fn identity(&self) -> Option<ResourceId> {
                self.id
            }
        })*
    };
}

child_record!(Domain, Port, Volume, Sysctl, Ulimit);

/// A configuration snapshot of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: ResourceId,
    pub service_id: ResourceId,
    pub config: GenerationConfig,
    pub domains: Vec<Domain>,
    pub ports: Vec<Port>,
    pub volumes: Vec<Volume>,
    pub sysctls: Vec<Sysctl>,
    pub ulimits: Vec<Ulimit>,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    /// A new generation with no child records.
    pub fn new(service_id: ResourceId, config: GenerationConfig) -> Self {
        Self {
            id: ResourceId::new(),
            service_id,
            config,
            domains: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            sysctls: Vec::new(),
            ulimits: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Clone into a fresh generation. Child records keep their identities so
    /// the two generations diff as equal.
    pub fn fork(&self) -> Self {
        Self {
            id: ResourceId::new(),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Give every child record without an identity a fresh one.
    pub fn assign_child_ids(&mut self) {
        fn assign(id: &mut Option<ResourceId>) {
            if id.is_none() {
                *id = Some(ResourceId::new());
            }
        }
        self.domains.iter_mut().for_each(|d| assign(&mut d.id));
        self.ports.iter_mut().for_each(|p| assign(&mut p.id));
        self.volumes.iter_mut().for_each(|v| assign(&mut v.id));
        self.sysctls.iter_mut().for_each(|s| assign(&mut s.id));
        self.ulimits.iter_mut().for_each(|u| assign(&mut u.id));
    }

    /// Structural checks run before a build is attempted.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfiguration(msg));

        match &self.config.source {
            Source::Docker { image } if image.trim().is_empty() => {
                return invalid("docker source requires an image".to_string());
            }
            Source::GitHub { repository, .. } => {
                let mut parts = repository.split('/');
                let well_formed = matches!(
                    (parts.next(), parts.next(), parts.next()),
                    (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
                );
                if !well_formed {
                    return invalid(format!(
                        "github repository must be owner/name, got '{}'",
                        repository
                    ));
                }
            }
            Source::Git { url, .. } if url.trim().is_empty() => {
                return invalid("git source requires a url".to_string());
            }
            _ => {}
        }

        if let BuildMethod::Dockerfile { dockerfile } = &self.config.build_method {
            if self.config.source.is_buildable() && dockerfile.trim().is_empty() {
                return invalid("dockerfile path is empty".to_string());
            }
        }

        for port in &self.ports {
            if port.target == 0 || port.published == 0 {
                return invalid(format!(
                    "port mapping {}:{} uses port 0",
                    port.published, port.target
                ));
            }
        }

        for volume in &self.volumes {
            if volume.target.trim().is_empty() {
                return invalid("volume target is empty".to_string());
            }
            let has_source = volume.source.as_deref().is_some_and(|s| !s.is_empty());
            match volume.kind {
                VolumeKind::Tmpfs if has_source => {
                    return invalid(format!(
                        "tmpfs mount {} cannot have a source",
                        volume.target
                    ));
                }
                VolumeKind::Bind | VolumeKind::Volume if !has_source => {
                    return invalid(format!(
                        "{} mount {} needs a source",
                        volume.kind.as_str(),
                        volume.target
                    ));
                }
                _ => {}
            }
        }

        let mut keys = HashSet::new();
        for sysctl in &self.sysctls {
            if !keys.insert(sysctl.key.as_str()) {
                return invalid(format!("duplicate sysctl {}", sysctl.key));
            }
        }

        let mut names = HashSet::new();
        for ulimit in &self.ulimits {
            if !names.insert(ulimit.name.as_str()) {
                return invalid(format!("duplicate ulimit {}", ulimit.name));
            }
            if ulimit.soft > ulimit.hard {
                return invalid(format!(
                    "ulimit {}: soft limit {} exceeds hard limit {}",
                    ulimit.name, ulimit.soft, ulimit.hard
                ));
            }
        }

        Ok(())
    }
}
