//! Stack assembly.
//!
//! Translates the relational generation model into the compose-shaped
//! [`StackSpecification`] accepted by swarm stack deploys. No I/O happens
//! here and output only depends on the input releases.

use dockyard_core::generation::{DeployMode, Generation, HealthCheckPolicy, VolumeKind};
use dockyard_core::stack::{
    DeploySpec, HealthCheckSpec, LimitsSpec, LoggingSpec, MountSpec, PROJECT_LABEL,
    PlacementSpec, PortSpec, ResourcesSpec, RestartPolicySpec, STACK_FILE_VERSION,
    SERVICE_LABEL, ServiceRelease, StackNetwork, StackService, StackSpecification, StackVolume,
    UlimitSpec, UpdateConfigSpec,
};
use dockyard_core::{Error, Result};
use std::collections::BTreeMap;

const LOG_DRIVER: &str = "json-file";

/// Build the stack for `project` from every service it runs.
///
/// Services are keyed by name; every service joins `network`, which must
/// already exist.
pub fn assemble_stack(
    project: &str,
    network: &str,
    releases: &[ServiceRelease],
) -> Result<StackSpecification> {
    let mut spec = StackSpecification {
        version: STACK_FILE_VERSION.to_string(),
        ..Default::default()
    };
    spec.networks
        .insert(network.to_string(), StackNetwork { external: true });

    for release in releases {
        let name = release.service.name.clone();
        if spec.services.contains_key(&name) {
            return Err(Error::InvalidConfiguration(format!(
                "service {} appears twice in the stack",
                name
            )));
        }

        let service = assemble_service(project, network, release)?;
        for mount in &service.volumes {
            if mount.kind == VolumeKind::Volume.as_str() {
                spec.volumes
                    .insert(mount.source.clone(), StackVolume::default());
            }
        }
        spec.services.insert(name, service);
    }

    Ok(spec)
}

fn assemble_service(project: &str, network: &str, release: &ServiceRelease) -> Result<StackService> {
    let generation = &release.generation;
    let config = &generation.config;

    let image = release.image().filter(|i| !i.is_empty()).ok_or_else(|| {
        Error::InvalidConfiguration(format!(
            "service {} has no image to deploy",
            release.service.name
        ))
    })?;

    let labels = BTreeMap::from([
        (PROJECT_LABEL.to_string(), project.to_string()),
        (SERVICE_LABEL.to_string(), release.service.name.clone()),
    ]);

    let (tmpfs, volumes) = mounts(generation);

    // Domains produce no routing labels yet.
    Ok(StackService {
        image: image.to_string(),
        command: config.command.clone().filter(|c| !c.is_empty()),
        entrypoint: config.entrypoint.clone().filter(|e| !e.is_empty()),
        environment: release.environment.iter().cloned().collect(),
        deploy: deploy(generation, labels.clone()),
        ports: generation
            .ports
            .iter()
            .map(|port| PortSpec {
                target: port.target,
                published: port.published,
                protocol: port.protocol.as_str().to_string(),
                mode: port.mode.as_str().to_string(),
            })
            .collect(),
        healthcheck: healthcheck(&config.health_check),
        logging: logging(generation),
        sysctls: generation
            .sysctls
            .iter()
            .map(|s| (s.key.clone(), s.value.clone()))
            .collect(),
        volumes,
        tmpfs,
        ulimits: generation
            .ulimits
            .iter()
            .map(|u| {
                (
                    u.name.clone(),
                    UlimitSpec {
                        soft: u.soft,
                        hard: u.hard,
                    },
                )
            })
            .collect(),
        networks: vec![network.to_string()],
        labels,
    })
}

fn deploy(generation: &Generation, labels: BTreeMap<String, String>) -> DeploySpec {
    let config = &generation.config;

    let order = if config.zero_downtime {
        "start-first"
    } else {
        "stop-first"
    };
    let update = UpdateConfigSpec {
        order: order.to_string(),
    };

    let limits = LimitsSpec {
        cpus: config.resources.cpus.map(|c| c.to_string()),
        memory: config.resources.memory_mb.map(|m| format!("{}M", m)),
        pids: config.resources.pids,
    };
    let resources = (limits != LimitsSpec::default()).then_some(ResourcesSpec { limits });

    DeploySpec {
        mode: config.deploy_mode.as_str().to_string(),
        replicas: match config.deploy_mode {
            DeployMode::Replicated => Some(config.replicas),
            DeployMode::Global => None,
        },
        placement: config
            .max_replicas_per_node
            .map(|max| PlacementSpec {
                max_replicas_per_node: max,
            }),
        resources,
        restart_policy: RestartPolicySpec {
            condition: config.restart.policy.condition().as_str().to_string(),
            delay: config.restart.delay_seconds.map(seconds),
            max_attempts: config.restart.max_attempts,
        },
        update_config: update.clone(),
        rollback_config: update,
        labels,
    }
}

fn healthcheck(policy: &HealthCheckPolicy) -> Option<HealthCheckSpec> {
    if !policy.enabled {
        return Some(HealthCheckSpec {
            disable: true,
            ..Default::default()
        });
    }

    let command = policy.command.as_deref().filter(|c| !c.trim().is_empty())?;
    Some(HealthCheckSpec {
        disable: false,
        test: Some(vec!["CMD-SHELL".to_string(), command.to_string()]),
        interval: policy.interval_seconds.map(seconds),
        timeout: policy.timeout_seconds.map(seconds),
        retries: policy.retries,
        start_period: policy.start_period_seconds.map(seconds),
    })
}

fn logging(generation: &Generation) -> Option<LoggingSpec> {
    let limits = &generation.config.logging;
    let mut options = BTreeMap::new();
    if let Some(size) = limits.max_size.as_deref().filter(|s| !s.is_empty()) {
        options.insert("max-size".to_string(), size.to_string());
    }
    if let Some(files) = limits.max_files {
        options.insert("max-file".to_string(), files.to_string());
    }
    if options.is_empty() {
        return None;
    }
    Some(LoggingSpec {
        driver: LOG_DRIVER.to_string(),
        options,
    })
}

/// Split volumes into tmpfs targets and source-backed mounts.
fn mounts(generation: &Generation) -> (Vec<String>, Vec<MountSpec>) {
    let mut tmpfs = Vec::new();
    let mut mounts = Vec::new();
    for volume in &generation.volumes {
        match volume.kind {
            VolumeKind::Tmpfs => tmpfs.push(volume.target.clone()),
            VolumeKind::Bind | VolumeKind::Volume => mounts.push(MountSpec {
                kind: volume.kind.as_str().to_string(),
                source: volume.source.clone().unwrap_or_default(),
                target: volume.target.clone(),
                read_only: volume.read_only,
            }),
        }
    }
    (tmpfs, mounts)
}

fn seconds(value: u64) -> String {
    format!("{}s", value)
}
