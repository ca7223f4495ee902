//! Docker implementation of [`ContainerRuntime`] using bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, HostConfig, MountPoint, PortBinding,
    ResourcesUlimits, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::config::RegistryAuth;
use crate::error::RuntimeError;
use crate::runtime::{
    ContainerFilter, ContainerRuntime, ContainerStatus, CreationRequest, ImageFilter, ImageRecord,
    ManagedContainer, MountInfo, PullProgress, RemoveOptions, RuntimeInfo, VolumeFilter,
    VolumeRecord,
};

/// Connect to the Docker daemon.
///
/// Tries bollard's defaults first (`DOCKER_HOST` or the platform socket), then
/// the rootless socket under `$XDG_RUNTIME_DIR` and Docker Desktop's per-user
/// socket. A connection only counts once the daemon answers a ping.
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    #[cfg(unix)]
    for socket in fallback_sockets() {
        if !std::path::Path::new(&socket).exists() {
            continue;
        }
        if let Ok(docker) =
            Docker::connect_with_unix(&socket, 120, bollard::API_DEFAULT_VERSION)
            && docker.ping().await.is_ok()
        {
            tracing::debug!("Connected to Docker via {}", socket);
            return Ok(docker);
        }
    }

    Err(RuntimeError::Unavailable {
        reason: "no Docker daemon responded on DOCKER_HOST or the local sockets".to_string(),
    })
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<String> {
    let mut sockets = Vec::new();
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        sockets.push(format!("{dir}/docker.sock"));
    }
    if let Ok(home) = std::env::var("HOME") {
        sockets.push(format!("{home}/.docker/run/docker.sock"));
    }
    sockets
}

/// Map a bollard error onto the runtime error taxonomy.
fn runtime_error(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound { id: id.to_string() },
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        } => RuntimeError::NotModified { id: id.to_string() },
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict {
            id: id.to_string(),
            message,
        },
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        other => RuntimeError::Transport(other.to_string()),
    }
}

fn mount_info(mount: MountPoint) -> Option<MountInfo> {
    Some(MountInfo {
        name: mount.name.filter(|n| !n.is_empty()),
        source: mount.source,
        destination: mount.destination?,
    })
}

fn container_from_summary(summary: ContainerSummary) -> Option<ManagedContainer> {
    let id = summary.id?;
    let status = match summary.state.as_deref().map(str::parse::<ContainerStatus>) {
        Some(Ok(status)) => status,
        _ => {
            tracing::debug!("Skipping container {} with unrecognised state", id);
            return None;
        }
    };
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let created = summary
        .created
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default();

    Some(ManagedContainer {
        id,
        name,
        image_id: summary.image_id.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        created,
        mounts: summary
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(mount_info)
            .collect(),
        host_ports: summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.public_port)
            .collect(),
        status,
    })
}

fn container_from_inspect(
    id: &str,
    inspect: ContainerInspectResponse,
) -> Result<ManagedContainer, RuntimeError> {
    let status = inspect
        .state
        .and_then(|s| s.status)
        .map(|s| s.to_string())
        .and_then(|s| s.parse::<ContainerStatus>().ok())
        .ok_or_else(|| RuntimeError::Transport(format!("container {id} has no known state")))?;
    let created = inspect
        .created
        .as_deref()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_default();

    let host_ports = inspect
        .host_config
        .and_then(|h| h.port_bindings)
        .unwrap_or_default()
        .into_values()
        .flatten()
        .flatten()
        .filter_map(|b| b.host_port.and_then(|p| p.parse().ok()))
        .collect();

    Ok(ManagedContainer {
        id: inspect.id.unwrap_or_else(|| id.to_string()),
        name: inspect
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image_id: inspect.image.unwrap_or_default(),
        labels: inspect.config.and_then(|c| c.labels).unwrap_or_default(),
        created,
        mounts: inspect
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(mount_info)
            .collect(),
        host_ports,
        status,
    })
}

/// Translate a creation request into bollard's create body.
fn container_config(request: &CreationRequest) -> Config<String> {
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = request
        .port_bindings
        .iter()
        .map(|(container_port, host_port)| {
            (
                container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            )
        })
        .collect();

    // bollard expects HashMap<String, HashMap<(), ()>> for exposed ports
    let exposed_ports: HashMap<String, HashMap<(), ()>> = request
        .port_bindings
        .keys()
        .chain(request.exposed_ports.iter())
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    let volumes: HashMap<String, HashMap<(), ()>> = request
        .volumes
        .iter()
        .map(|path| (path.clone(), HashMap::new()))
        .collect();

    let non_empty = |v: &Vec<String>| if v.is_empty() { None } else { Some(v.clone()) };

    let host_config = HostConfig {
        binds: non_empty(&request.binds),
        volumes_from: non_empty(&request.volumes_from),
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        memory: request.memory,
        memory_swap: request.memory_swap,
        cpu_percent: request.cpu_percent,
        ulimits: if request.ulimits.is_empty() {
            None
        } else {
            Some(
                request
                    .ulimits
                    .iter()
                    .map(|u| ResourcesUlimits {
                        name: Some(u.name.clone()),
                        soft: Some(u.soft),
                        hard: Some(u.hard),
                    })
                    .collect(),
            )
        },
        network_mode: request.network_mode.clone(),
        extra_hosts: non_empty(&request.extra_hosts),
        restart_policy: request.restart.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    Config {
        image: Some(request.image.clone()),
        env: non_empty(&request.env),
        labels: Some(request.labels.clone().into_iter().collect()),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        volumes: if volumes.is_empty() {
            None
        } else {
            Some(volumes)
        },
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn container_filters(filter: &ContainerFilter) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    if !filter.labels.is_empty() {
        filters.insert(
            "label".to_string(),
            filter
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        );
    }
    if let Some(status) = filter.status {
        filters.insert("status".to_string(), vec![status.as_str().to_string()]);
    }
    filters
}

/// Container runtime backed by a Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect using [`connect_docker`].
    pub async fn connect() -> Result<Self, RuntimeError> {
        Ok(Self::new(connect_docker().await?))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: filter.all,
            filters: container_filters(filter),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| runtime_error("containers", e))?;
        Ok(summaries
            .into_iter()
            .filter_map(container_from_summary)
            .collect())
    }

    async fn create(&self, request: &CreationRequest) -> Result<String, RuntimeError> {
        let options = request.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });
        let response = self
            .docker
            .create_container(options, container_config(request))
            .await
            .map_err(|e| runtime_error(&request.set_id, e))?;
        for warning in &response.warnings {
            tracing::warn!(set = %request.set_id, "Runtime warning on create: {}", warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| runtime_error(id, e))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs().min(i64::MAX as u64) as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| runtime_error(id, e))
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| runtime_error(id, e))
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: options.force,
            v: options.volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| runtime_error(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ManagedContainer, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| runtime_error(id, e))?;
        container_from_inspect(id, inspect)
    }

    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, RuntimeError> {
        let mut filters = HashMap::new();
        if filter.dangling {
            filters.insert("dangling".to_string(), vec!["true".to_string()]);
        }
        if let Some(reference) = &filter.reference {
            filters.insert("reference".to_string(), vec![reference.clone()]);
        }
        let options = ListImagesOptions::<String> {
            filters,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|e| runtime_error("images", e))?;
        Ok(images
            .into_iter()
            .map(|image| ImageRecord {
                id: image.id,
                repo_tags: image.repo_tags,
                created: image.created,
            })
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(id, None::<RemoveImageOptions>, None)
            .await
            .map(|_| ())
            .map_err(|e| runtime_error(id, e))
    }

    async fn list_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<VolumeRecord>, RuntimeError> {
        let mut filters = HashMap::new();
        if filter.dangling {
            filters.insert("dangling".to_string(), vec!["true".to_string()]);
        }
        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions::<String> { filters }))
            .await
            .map_err(|e| runtime_error("volumes", e))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeRecord {
                name: v.name,
                driver: v.driver,
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| runtime_error(name, e))
    }

    fn pull<'a>(
        &'a self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> BoxStream<'a, Result<PullProgress, RuntimeError>> {
        let image = image.to_string();
        let options = CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        };
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password().to_string()),
            serveraddress: a.server_address.clone(),
            ..Default::default()
        });

        self.docker
            .create_image(Some(options), None, credentials)
            .map(move |item| {
                item.map(|info| PullProgress {
                    id: info.id,
                    status: info.status,
                    progress: info.progress,
                })
                .map_err(|e| runtime_error(&image, e))
            })
            .boxed()
    }

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| runtime_error("info", e))?;
        Ok(RuntimeInfo {
            name: info.name,
            server_version: info.server_version,
            architecture: info.architecture,
            http_proxy: info.http_proxy,
            https_proxy: info.https_proxy,
            no_proxy: info.no_proxy,
        })
    }
}
