//! Test doubles shared by unit and integration tests.
//!
//! Provides:
//! - [`FakeRuntime`]: an in-memory [`ContainerRuntime`] with call recording and
//!   failure injection
//! - [`container`], [`image`], [`volume`]: fixtures for seeding it
//! - [`test_context`]: an [`AppContext`] over a fake runtime with default config
//! - [`StaticIdle`]: an idle detector with a fixed answer
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use harbormaster::testing::{FakeRuntime, test_context};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let runtime = Arc::new(FakeRuntime::new());
//!     let ctx = test_context(Arc::clone(&runtime));
//!     // drive a reconciler or sweeper, then inspect runtime.created() etc.
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};

use crate::config::{Config, RegistryAuth};
use crate::context::AppContext;
use crate::error::{IdleError, RuntimeError};
use crate::idle::IdleDetector;
use crate::runtime::{
    ContainerFilter, ContainerRuntime, ContainerStatus, CreationRequest, ImageFilter, ImageRecord,
    ManagedContainer, MountInfo, PullProgress, RemoveOptions, RuntimeInfo, VolumeFilter,
    VolumeRecord, labels,
};

/// A managed container in group `group` with the four controller labels set.
pub fn container(id: &str, group: &str, status: ContainerStatus) -> ManagedContainer {
    let labels = HashMap::from([
        (labels::AUTO_DEPLOYED.to_string(), "true".to_string()),
        (labels::GROUP_ID.to_string(), group.to_string()),
        (labels::DATA_CONTAINER.to_string(), "false".to_string()),
        (labels::SOURCE_IMAGE.to_string(), format!("{group}:latest")),
    ]);
    ManagedContainer {
        id: id.to_string(),
        name: format!("{group}-{id}"),
        image_id: format!("sha256:{group}"),
        labels,
        created: Utc::now(),
        mounts: Vec::new(),
        host_ports: Vec::new(),
        status,
    }
}

/// Like [`container`], labelled as a data container with one named volume.
pub fn data_container(
    id: &str,
    group: &str,
    status: ContainerStatus,
    volume: &str,
) -> ManagedContainer {
    let mut c = container(id, group, status);
    c.labels
        .insert(labels::DATA_CONTAINER.to_string(), "true".to_string());
    c.mounts.push(MountInfo {
        name: Some(volume.to_string()),
        source: Some(format!("/var/lib/docker/volumes/{volume}/_data")),
        destination: format!("/data/{volume}"),
    });
    c
}

pub fn image(id: &str, tags: &[&str]) -> ImageRecord {
    ImageRecord {
        id: id.to_string(),
        repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        created: Utc::now().timestamp(),
    }
}

pub fn volume(name: &str) -> VolumeRecord {
    VolumeRecord {
        name: name.to_string(),
        driver: "local".to_string(),
    }
}

/// An [`AppContext`] over `runtime` with [`Config::default`].
pub fn test_context(runtime: Arc<FakeRuntime>) -> AppContext {
    test_context_with(Config::default(), runtime)
}

pub fn test_context_with(config: Config, runtime: Arc<FakeRuntime>) -> AppContext {
    AppContext::new(config, runtime)
}

/// Idle detector returning a fixed set of ids, or failing.
pub struct StaticIdle {
    ids: Option<HashSet<String>>,
}

impl StaticIdle {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ids: Some(ids.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn failing() -> Self {
        Self { ids: None }
    }
}

#[async_trait]
impl IdleDetector for StaticIdle {
    async fn idle_workers(&self) -> Result<HashSet<String>, IdleError> {
        self.ids
            .clone()
            .ok_or_else(|| IdleError::Http("connection refused".to_string()))
    }
}

#[derive(Default)]
struct FakeState {
    containers: Vec<ManagedContainer>,
    images: Vec<ImageRecord>,
    dangling_images: HashSet<String>,
    volumes: Vec<VolumeRecord>,
    dangling_volumes: HashSet<String>,
    next_id: u64,

    created: Vec<CreationRequest>,
    started: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    remove_calls: Vec<String>,
    removed_images: Vec<String>,
    removed_volumes: Vec<String>,
    pulled: Vec<String>,

    fail_create: bool,
    fail_start: bool,
    fail_list_images: bool,
    fail_list_containers: bool,
    fail_remove: HashSet<String>,
    after_next_list: Vec<(String, ContainerStatus)>,
}

impl FakeState {
    /// Create a named volume the way the runtime does on first mount.
    fn ensure_volume(&mut self, name: &str) {
        if !self.volumes.iter().any(|v| v.name == name) {
            self.volumes.push(volume(name));
        }
    }
}

/// In-memory container runtime.
///
/// Listings preserve insertion order. `create` resolves the image id from the
/// seeded images by exact tag, records a mount per bind and anonymous volume,
/// and stores the container as `created`; `start` flips it to `running`.
/// Every mutating call is recorded.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    info: RuntimeInfo,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            info: RuntimeInfo {
                name: Some("fake-host".to_string()),
                server_version: Some("27.0.0".to_string()),
                architecture: Some("x86_64".to_string()),
                http_proxy: None,
                https_proxy: None,
                no_proxy: None,
            },
        }
    }

    pub fn with_info(mut self, info: RuntimeInfo) -> Self {
        self.info = info;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Seeding ─────────────────────────────────────────────────────

    pub fn insert_container(&self, container: ManagedContainer) {
        self.state().containers.push(container);
    }

    pub fn insert_image(&self, image: ImageRecord) {
        self.state().images.push(image);
    }

    /// Seed an image that the runtime reports as dangling.
    pub fn insert_dangling_image(&self, image: ImageRecord) {
        let mut state = self.state();
        state.dangling_images.insert(image.id.clone());
        state.images.push(image);
    }

    pub fn insert_volume(&self, volume: VolumeRecord) {
        self.state().volumes.push(volume);
    }

    pub fn insert_dangling_volume(&self, volume: VolumeRecord) {
        let mut state = self.state();
        state.dangling_volumes.insert(volume.name.clone());
        state.volumes.push(volume);
    }

    // ── Failure injection ───────────────────────────────────────────

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    pub fn set_fail_list_images(&self, fail: bool) {
        self.state().fail_list_images = fail;
    }

    pub fn set_fail_list_containers(&self, fail: bool) {
        self.state().fail_list_containers = fail;
    }

    /// Make `remove` fail for `id` with a 500.
    pub fn fail_remove_of(&self, id: &str) {
        self.state().fail_remove.insert(id.to_string());
    }

    /// Move container `id` to `status` right after the next container
    /// listing is taken, so it shows up under two consecutive status queries.
    pub fn change_status_after_next_list(&self, id: &str, status: ContainerStatus) {
        self.state().after_next_list.push((id.to_string(), status));
    }

    // ── Observation ─────────────────────────────────────────────────

    pub fn containers(&self) -> Vec<ManagedContainer> {
        self.state().containers.clone()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.state().containers.iter().map(|c| c.id.clone()).collect()
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.state().images.iter().map(|i| i.id.clone()).collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state().volumes.iter().map(|v| v.name.clone()).collect()
    }

    /// Requests passed to `create`, in call order.
    pub fn created(&self) -> Vec<CreationRequest> {
        self.state().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    /// Every id passed to `remove`, successful or not.
    pub fn remove_calls(&self) -> Vec<String> {
        self.state().remove_calls.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.state().removed_volumes.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }
}

fn not_found(id: &str) -> RuntimeError {
    RuntimeError::NotFound { id: id.to_string() }
}

fn injected(message: &str) -> RuntimeError {
    RuntimeError::Api {
        status: 500,
        message: message.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let mut state = self.state();
        if state.fail_list_containers {
            return Err(injected("injected list failure"));
        }
        let listed: Vec<ManagedContainer> = state
            .containers
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();

        for (id, status) in std::mem::take(&mut state.after_next_list) {
            if let Some(container) = state.containers.iter_mut().find(|c| c.id == id) {
                container.status = status;
            }
        }
        Ok(listed)
    }

    async fn create(&self, request: &CreationRequest) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.created.push(request.clone());
        if state.fail_create {
            return Err(injected("injected create failure"));
        }

        state.next_id += 1;
        let id = format!("{:016x}", 0xc0de_0000_u64 + state.next_id);
        let image_id = state
            .images
            .iter()
            .find(|i| i.repo_tags.iter().any(|t| *t == request.image))
            .map(|i| i.id.clone())
            .unwrap_or_else(|| format!("sha256:{}", request.image));

        let mut mounts = Vec::new();
        for bind in &request.binds {
            let mut parts = bind.splitn(3, ':');
            let (Some(source), Some(destination)) = (parts.next(), parts.next()) else {
                continue;
            };
            let named = !source.starts_with('/');
            if named {
                state.ensure_volume(source);
            }
            mounts.push(MountInfo {
                name: named.then(|| source.to_string()),
                source: Some(source.to_string()),
                destination: destination.to_string(),
            });
        }
        for (n, destination) in request.volumes.iter().enumerate() {
            let name = format!("{id}{n:048x}");
            state.ensure_volume(&name);
            mounts.push(MountInfo {
                name: Some(name.clone()),
                source: Some(format!("/var/lib/docker/volumes/{name}/_data")),
                destination: destination.clone(),
            });
        }

        let container = ManagedContainer {
            id: id.clone(),
            name: request
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", request.set_id, state.next_id)),
            image_id,
            labels: request
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            created: Utc::now(),
            mounts,
            host_ports: request.host_ports().collect(),
            status: ContainerStatus::Created,
        };
        state.containers.push(container);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.fail_start {
            return Err(injected("injected start failure"));
        }
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found(id))?;
        if container.status == ContainerStatus::Running {
            return Err(RuntimeError::NotModified { id: id.to_string() });
        }
        container.status = ContainerStatus::Running;
        state.started.push(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found(id))?;
        if container.status != ContainerStatus::Running {
            return Err(RuntimeError::NotModified { id: id.to_string() });
        }
        container.status = ContainerStatus::Exited;
        state.stopped.push(id.to_string());
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.stop(id, Duration::ZERO).await
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.remove_calls.push(id.to_string());
        if state.fail_remove.contains(id) {
            return Err(injected("injected remove failure"));
        }
        let index = state
            .containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| not_found(id))?;
        if state.containers[index].status == ContainerStatus::Running && !options.force {
            return Err(RuntimeError::Conflict {
                id: id.to_string(),
                message: "container is running".to_string(),
            });
        }
        state.containers.remove(index);
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ManagedContainer, RuntimeError> {
        self.state()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, RuntimeError> {
        let state = self.state();
        if state.fail_list_images {
            return Err(injected("injected image list failure"));
        }
        Ok(state
            .images
            .iter()
            .filter(|i| !filter.dangling || state.dangling_images.contains(&i.id))
            .filter(|i| match &filter.reference {
                Some(reference) => i.repo_tags.contains(reference),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let index = state
            .images
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| not_found(id))?;
        state.images.remove(index);
        state.dangling_images.remove(id);
        state.removed_images.push(id.to_string());
        Ok(())
    }

    async fn list_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<VolumeRecord>, RuntimeError> {
        let state = self.state();
        Ok(state
            .volumes
            .iter()
            .filter(|v| !filter.dangling || state.dangling_volumes.contains(&v.name))
            .cloned()
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let in_use = state
            .containers
            .iter()
            .any(|c| c.volume_names().any(|v| v == name));
        if in_use {
            return Err(RuntimeError::Conflict {
                id: name.to_string(),
                message: "volume is in use".to_string(),
            });
        }
        let index = state
            .volumes
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| not_found(name))?;
        state.volumes.remove(index);
        state.dangling_volumes.remove(name);
        state.removed_volumes.push(name.to_string());
        Ok(())
    }

    fn pull<'a>(
        &'a self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> BoxStream<'a, Result<PullProgress, RuntimeError>> {
        self.state().pulled.push(image.to_string());
        let events = vec![
            Ok(PullProgress {
                id: None,
                status: Some(format!("Pulling from {image}")),
                progress: None,
            }),
            Ok(PullProgress {
                id: None,
                status: Some("Download complete".to_string()),
                progress: None,
            }),
        ];
        Box::pin(stream::iter(events))
    }

    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        Ok(self.info.clone())
    }
}
