//! Cadaver sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::context::AppContext;
use crate::error::RuntimeError;
use crate::reconciler::newest_in_group;
use crate::runtime::{
    ContainerFilter, ContainerStatus, ImageFilter, ManagedContainer, RemoveOptions, VolumeFilter,
    ignore_already_done,
};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Container ids removed, in removal order.
    pub removed_containers: Vec<String>,
    /// Data containers kept, as newest of their group or still in use.
    pub retained: Vec<String>,
    pub removed_volumes: Vec<String>,
    pub removed_images: Vec<String>,
    /// Per-item failures, each already logged.
    pub failures: usize,
}

/// Why a data container survives a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    Newest,
    InUse,
}

pub struct CadaverSweeper {
    ctx: Arc<AppContext>,
}

impl CadaverSweeper {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Run one full sweep. Every step is best-effort; failures are counted
    /// and never stop later steps.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let candidates = self.cadavers(&mut report).await;
        if !candidates.is_empty() {
            let mut marked = Vec::new();
            for candidate in candidates {
                if !candidate.is_data_container() {
                    marked.push(candidate);
                    continue;
                }
                match self.retention(&candidate).await {
                    Ok(Some(reason)) => {
                        tracing::debug!(
                            container = %candidate.short_id(),
                            ?reason,
                            "Keeping data container"
                        );
                        report.retained.push(candidate.id);
                    }
                    Ok(None) => marked.push(candidate),
                    Err(e) => {
                        tracing::warn!(
                            container = %candidate.short_id(),
                            "Could not decide on data container, keeping it: {}",
                            e
                        );
                        report.failures += 1;
                    }
                }
            }
            self.remove_marked(marked, &mut report).await;
        }

        if self.ctx.config.remove_dangling_images {
            self.remove_dangling_images(&mut report).await;
        }
        if self.ctx.config.remove_dangling_volumes {
            self.remove_dangling_volumes(&mut report).await;
        }

        if !report.removed_containers.is_empty()
            || !report.removed_images.is_empty()
            || !report.removed_volumes.is_empty()
        {
            tracing::info!(
                containers = report.removed_containers.len(),
                images = report.removed_images.len(),
                volumes = report.removed_volumes.len(),
                failures = report.failures,
                "Garbage collection finished"
            );
        }
        report
    }

    /// Terminated managed containers, one query per state, de-duplicated.
    async fn cadavers(&self, report: &mut SweepReport) -> Vec<ManagedContainer> {
        let mut seen = HashSet::new();
        let mut cadavers = Vec::new();
        for status in ContainerStatus::TERMINATED {
            match self
                .ctx
                .runtime
                .list_containers(&ContainerFilter::managed().status(status))
                .await
            {
                Ok(found) => {
                    for container in found {
                        if seen.insert(container.id.clone()) {
                            cadavers.push(container);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(%status, "Failed to list containers: {}", e);
                    report.failures += 1;
                }
            }
        }
        cadavers
    }

    async fn retention(
        &self,
        candidate: &ManagedContainer,
    ) -> Result<Option<Keep>, RuntimeError> {
        if let Some(group) = candidate.group_id() {
            let newest = newest_in_group(self.ctx.runtime.as_ref(), group).await?;
            if newest.is_some_and(|n| n.id == candidate.id) {
                return Ok(Some(Keep::Newest));
            }
        }

        let volumes: HashSet<&str> = candidate.volume_names().collect();
        if volumes.is_empty() {
            return Ok(None);
        }
        let running = self
            .ctx
            .runtime
            .list_containers(&ContainerFilter::default())
            .await?;
        let in_use = running
            .iter()
            .any(|c| c.volume_names().any(|v| volumes.contains(v)));
        Ok(in_use.then_some(Keep::InUse))
    }

    /// Remove containers, then the volumes of the data containers that went.
    async fn remove_marked(&self, marked: Vec<ManagedContainer>, report: &mut SweepReport) {
        let runtime = &self.ctx.runtime;
        let mut orphaned_volumes: HashMap<String, Vec<String>> = HashMap::new();

        for container in marked {
            let result =
                ignore_already_done(runtime.remove(&container.id, RemoveOptions::default()).await);
            match result {
                Ok(()) => {
                    tracing::debug!(
                        container = %container.short_id(),
                        group = container.group_id().unwrap_or("-"),
                        "Removed cadaver"
                    );
                    if container.is_data_container() {
                        orphaned_volumes.insert(
                            container.id.clone(),
                            container.volume_names().map(str::to_string).collect(),
                        );
                    }
                    report.removed_containers.push(container.id);
                }
                Err(e) => {
                    tracing::warn!(container = %container.short_id(), "Failed to remove container: {}", e);
                    report.failures += 1;
                }
            }
        }

        for id in &report.removed_containers {
            let Some(volumes) = orphaned_volumes.remove(id) else {
                continue;
            };
            for volume in volumes {
                match ignore_already_done(runtime.remove_volume(&volume).await) {
                    Ok(()) => report.removed_volumes.push(volume),
                    Err(e) => {
                        tracing::warn!(volume = %volume, "Failed to remove data volume: {}", e);
                        report.failures += 1;
                    }
                }
            }
        }
    }

    async fn remove_dangling_images(&self, report: &mut SweepReport) {
        let filter = ImageFilter {
            dangling: true,
            reference: None,
        };
        let images = match self.ctx.runtime.list_images(&filter).await {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!("Failed to list dangling images: {}", e);
                report.failures += 1;
                return;
            }
        };
        for image in images {
            match ignore_already_done(self.ctx.runtime.remove_image(&image.id).await) {
                Ok(()) => report.removed_images.push(image.id),
                Err(e) => {
                    tracing::warn!(image = %image.id, "Failed to remove dangling image: {}", e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn remove_dangling_volumes(&self, report: &mut SweepReport) {
        let volumes = match self
            .ctx
            .runtime
            .list_volumes(&VolumeFilter { dangling: true })
            .await
        {
            Ok(volumes) => volumes,
            Err(e) => {
                tracing::warn!("Failed to list dangling volumes: {}", e);
                report.failures += 1;
                return;
            }
        };
        for volume in volumes {
            match ignore_already_done(self.ctx.runtime.remove_volume(&volume.name).await) {
                Ok(()) => report.removed_volumes.push(volume.name),
                Err(e) => {
                    tracing::warn!(volume = %volume.name, "Failed to remove dangling volume: {}", e);
                    report.failures += 1;
                }
            }
        }
    }
}
