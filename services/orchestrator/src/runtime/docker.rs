//! Docker Engine runtime over bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, DeviceRequest, HostConfig, Mount, MountTypeEnum,
    PortBinding as DockerPortBinding, RestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, RemoveVolumeOptions,
    RestartContainerOptions, StartContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::TryStreamExt;
use tracing::debug;

use super::{
    ContainerDetails, ContainerFilter, ContainerRuntime, ContainerSpec, ContainerSummary,
    MountSpec, RuntimeError,
};
use crate::broker::RuntimeEndpoint;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// [`ContainerRuntime`] backed by a Docker Engine API connection.
pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
}

impl DockerRuntime {
    /// Build a client for `endpoint`. Does not touch the network.
    pub fn connect(endpoint: &RuntimeEndpoint) -> Result<Self, RuntimeError> {
        let label = endpoint.to_string();
        let docker = match endpoint {
            RuntimeEndpoint::Unix(path) => {
                let path = path.to_string_lossy();
                Docker::connect_with_socket(&path, DEFAULT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            RuntimeEndpoint::Tcp { host, port } => Docker::connect_with_http(
                &format!("http://{host}:{port}"),
                DEFAULT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
        }
        .map_err(|source| RuntimeError::Connect {
            endpoint: label.clone(),
            message: source.to_string(),
        })?;

        Ok(Self {
            docker,
            endpoint: label,
        })
    }

    fn operation_error(
        &self,
        operation: &'static str,
        target: &str,
        source: BollardError,
    ) -> RuntimeError {
        if is_not_found_error(&source) {
            return RuntimeError::NotFound(target.to_string());
        }
        RuntimeError::Operation {
            operation,
            target: target.to_string(),
            message: format!("{source} (endpoint {})", self.endpoint),
        }
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        _ => false,
    }
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = spec
        .ports
        .iter()
        .map(|p| {
            (
                format!("{}/tcp", p.container_port),
                Some(vec![DockerPortBinding {
                    host_ip: None,
                    host_port: Some(p.host_port.to_string()),
                }]),
            )
        })
        .collect();

    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| match m {
            MountSpec::Volume { name, target } => Mount {
                typ: Some(MountTypeEnum::VOLUME),
                source: Some(name.clone()),
                target: Some(target.clone()),
                ..Default::default()
            },
            MountSpec::Bind { source, target } => Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(source.clone()),
                target: Some(target.clone()),
                ..Default::default()
            },
        })
        .collect();

    let device_requests = spec.gpu.then(|| {
        vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: spec.cmd.clone(),
        env: (!env.is_empty()).then_some(env),
        labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
        tty: spec.interactive.then_some(true),
        open_stdin: spec.interactive.then_some(true),
        host_config: Some(HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            mounts: (!mounts.is_empty()).then_some(mounts),
            device_requests,
            restart_policy: spec.restart_always.then_some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|source| RuntimeError::Connect {
                endpoint: self.endpoint.clone(),
                message: source.to_string(),
            })?;
        Ok(())
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(name) = &filter.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }
        if !filter.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                filter.labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }

        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|source| self.operation_error("list_containers", "*", source))?;

        // The engine's name filter is a substring match; keep exact matches only.
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let labels = c.labels.unwrap_or_default();
                filter.matches(&name, &labels).then_some(ContainerSummary {
                    id,
                    name,
                    labels,
                })
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), create_body(spec))
            .await
            .map_err(|source| self.operation_error("create_container", &spec.name, source))?;
        debug!(container = %spec.name, id = %response.id, "container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|source| self.operation_error("start_container", id, source))
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .map_err(|source| self.operation_error("restart_container", id, source))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(force)
            .v(false)
            .build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|source| self.operation_error("remove_container", id, source))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| self.operation_error("inspect_container", id, source))?;

        let host_ports = response
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|(key, bindings)| {
                let ports = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| b.host_port.and_then(|p| p.parse().ok()))
                    .collect();
                (key, ports)
            })
            .collect();

        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| id.to_string()),
            name: response
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running: response.state.and_then(|s| s.running).unwrap_or(false),
            host_ports,
        })
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                driver: Some("local".to_string()),
                ..Default::default()
            })
            .await
            .map_err(|source| self.operation_error("create_volume", name, source))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|source| self.operation_error("remove_volume", name, source))
    }

    async fn pull_image(&self, image: &str, tag: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptionsBuilder::new()
            .from_image(image)
            .tag(tag)
            .build();
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| self.operation_error("pull_image", image, source))?;
        Ok(())
    }
}
