//! Narrow interface over the container runtime.
//!
//! Everything the controller knows about the fleet comes from here: there is
//! no local cache, and the labels stamped on containers at creation time are
//! the only durable state. [`DockerRuntime`] talks to a Docker daemon through
//! `bollard`; tests use [`crate::testing::FakeRuntime`].

mod docker;
mod request;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub use docker::{DockerRuntime, connect_docker};
pub use request::CreationRequest;

use crate::config::RegistryAuth;
use crate::error::RuntimeError;

/// Label keys stamped on every container the controller creates.
pub mod labels {
    pub const AUTO_DEPLOYED: &str = "auto-deployed";
    pub const SOURCE_IMAGE: &str = "source-image";
    pub const GROUP_ID: &str = "group-id";
    pub const DATA_CONTAINER: &str = "data-container";
}

/// Lifecycle state of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        }
    }

    /// States the cadaver sweeper considers for removal.
    pub const TERMINATED: [ContainerStatus; 3] = [Self::Created, Self::Exited, Self::Dead];
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "restarting" => Ok(Self::Restarting),
            "removing" => Ok(Self::Removing),
            "exited" => Ok(Self::Exited),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown container status '{other}'")),
        }
    }
}

/// A mount point on a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Volume name; `None` for bind mounts.
    pub name: Option<String>,
    pub source: Option<String>,
    pub destination: String,
}

/// A container as seen through the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub created: DateTime<Utc>,
    pub mounts: Vec<MountInfo>,
    /// Host ports published by this container.
    pub host_ports: Vec<u16>,
    pub status: ContainerStatus,
}

impl ManagedContainer {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn is_auto_deployed(&self) -> bool {
        self.label(labels::AUTO_DEPLOYED) == Some("true")
    }

    pub fn group_id(&self) -> Option<&str> {
        self.label(labels::GROUP_ID)
    }

    pub fn is_data_container(&self) -> bool {
        self.label(labels::DATA_CONTAINER) == Some("true")
    }

    pub fn source_image(&self) -> Option<&str> {
        self.label(labels::SOURCE_IMAGE)
    }

    /// Names of the named volumes mounted into this container.
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().filter_map(|m| m.name.as_deref())
    }

    /// First 12 characters of the id, as the Docker CLI prints it.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Label/status filter for container listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub labels: Vec<(String, String)>,
    pub status: Option<ContainerStatus>,
    /// Include non-running containers. Implied when `status` is set.
    pub all: bool,
}

impl ContainerFilter {
    /// Containers created by this controller.
    pub fn managed() -> Self {
        Self::default().label(labels::AUTO_DEPLOYED, "true")
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn group(self, group_id: &str) -> Self {
        self.label(labels::GROUP_ID, group_id)
    }

    pub fn status(mut self, status: ContainerStatus) -> Self {
        self.status = Some(status);
        self.all = true;
        self
    }

    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    /// Whether a container satisfies this filter.
    pub fn matches(&self, container: &ManagedContainer) -> bool {
        let labels_match = self
            .labels
            .iter()
            .all(|(k, v)| container.labels.get(k) == Some(v));
        let status_match = match self.status {
            Some(status) => container.status == status,
            None => self.all || container.status == ContainerStatus::Running,
        };
        labels_match && status_match
    }
}

/// An image in the runtime's local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFilter {
    /// Only untagged images that nothing references.
    pub dangling: bool,
    /// Only images matching this reference.
    pub reference: Option<String>,
}

/// A volume known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    /// Only volumes no container references.
    pub dangling: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub force: bool,
    /// Also remove anonymous volumes attached to the container.
    pub volumes: bool,
}

/// One event from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
}

/// Facts about the runtime host used for env templating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub name: Option<String>,
    pub server_version: Option<String>,
    pub architecture: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

/// Operations the controller needs from a container runtime.
///
/// Every call may fail with a [`RuntimeError`]; "already stopped" and
/// "already removed" come back as errors for which
/// [`RuntimeError::is_already_done`] is true.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ManagedContainer>, RuntimeError>;

    /// Create a container and return its id.
    async fn create(&self, request: &CreationRequest) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ManagedContainer, RuntimeError>;

    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, RuntimeError>;

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError>;

    async fn list_volumes(&self, filter: &VolumeFilter)
    -> Result<Vec<VolumeRecord>, RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Pull an image, yielding progress events until it completes.
    fn pull<'a>(
        &'a self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> BoxStream<'a, Result<PullProgress, RuntimeError>>;

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError>;
}

/// Treat "already done" outcomes as success.
pub fn ignore_already_done(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(e) if e.is_already_done() => Ok(()),
        other => other,
    }
}
