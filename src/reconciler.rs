//! Per-set control loop.
//!
//! Worker sets are scaled by instance count. Data sets are promoted one
//! generation at a time: a new container is created only when no member of
//! the group runs the newest local image for the set's reference.
//!
//! Nothing is cached between ticks. Each decision re-queries the runtime by
//! label, which is also what resolves races with the GC and with operators.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::{CreateError, RuntimeError};
use crate::hooks::HookPipeline;
use crate::runtime::{
    ContainerFilter, ContainerRuntime, ContainerStatus, CreationRequest, ImageFilter, ImageRecord,
    ManagedContainer, RemoveOptions, ignore_already_done,
};

/// Grace period given to containers stopped by scale-down.
const SCALE_DOWN_STOP_GRACE: Duration = Duration::from_secs(10);

/// Newest member of a group: maximum creation time, first in listing order on ties.
pub fn newest(containers: &[ManagedContainer]) -> Option<&ManagedContainer> {
    containers
        .iter()
        .reduce(|best, c| if c.created > best.created { c } else { best })
}

/// Query every member of `group_id` (any status) and return the newest.
pub async fn newest_in_group(
    runtime: &dyn ContainerRuntime,
    group_id: &str,
) -> Result<Option<ManagedContainer>, RuntimeError> {
    let members = runtime
        .list_containers(&ContainerFilter::managed().group(group_id).all())
        .await?;
    Ok(newest(&members).cloned())
}

/// First image in listing order whose tags contain `reference` exactly.
///
/// The runtime does not promise a stable listing order, so when several images
/// carry the tag this picks whichever comes first. No recency is implied.
pub fn first_tagged<'a>(images: &'a [ImageRecord], reference: &str) -> Option<&'a ImageRecord> {
    images
        .iter()
        .find(|image| image.repo_tags.iter().any(|tag| tag == reference))
}

/// Resolve the local image currently carrying `reference`.
pub async fn resolve_newest_image(
    runtime: &dyn ContainerRuntime,
    reference: &str,
) -> Result<Option<ImageRecord>, RuntimeError> {
    let images = runtime.list_images(&ImageFilter::default()).await?;
    Ok(first_tagged(&images, reference).cloned())
}

/// Outcome of one reconcile tick for one set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Running members observed at the start of the tick.
    pub running: usize,
    /// Create-and-start attempts issued.
    pub attempted: usize,
    /// Attempts that ended with a started container.
    pub started: usize,
    /// Attempts that failed at any step.
    pub failed: usize,
    /// Containers removed by scale-down.
    pub removed: usize,
}

/// Drives container sets toward their desired state.
pub struct Reconciler {
    ctx: Arc<AppContext>,
    pipeline: HookPipeline,
}

impl Reconciler {
    pub fn new(ctx: Arc<AppContext>, pipeline: HookPipeline) -> Self {
        Self { ctx, pipeline }
    }

    /// One tick for `set`. Errors are logged here and retried next tick.
    pub async fn tick(&self, set: &ContainerSet) {
        match self.reconcile(set).await {
            Ok(report) if report.attempted > 0 || report.removed > 0 => {
                tracing::info!(
                    set = %set.id,
                    running = report.running,
                    started = report.started,
                    failed = report.failed,
                    removed = report.removed,
                    "Reconciled container set"
                );
            }
            Ok(_) => tracing::trace!(set = %set.id, "Container set already converged"),
            Err(e) => tracing::warn!(set = %set.id, "Reconcile failed, retrying next tick: {}", e),
        }
    }

    pub async fn reconcile(&self, set: &ContainerSet) -> Result<TickReport, RuntimeError> {
        if set.is_data_container {
            self.reconcile_data_set(set).await
        } else {
            self.reconcile_worker_set(set).await
        }
    }

    /// Start `instances - running` containers, one after another.
    pub async fn reconcile_worker_set(
        &self,
        set: &ContainerSet,
    ) -> Result<TickReport, RuntimeError> {
        let running = self
            .ctx
            .runtime
            .list_containers(
                &ContainerFilter::managed()
                    .group(&set.id)
                    .status(ContainerStatus::Running),
            )
            .await?;

        let mut report = TickReport {
            running: running.len(),
            ..Default::default()
        };

        if running.len() > set.instances && self.ctx.config.scale_down {
            report.removed = self.scale_down(set, running).await;
            return Ok(report);
        }

        let deficit = set.instances.saturating_sub(report.running);
        for _ in 0..deficit {
            report.attempted += 1;
            match self.create_and_start(set).await {
                Ok(_) => report.started += 1,
                Err(e) => {
                    report.failed += 1;
                    log_create_error(set, &e);
                }
            }
        }
        Ok(report)
    }

    /// Promote a new generation when no member runs the newest image.
    pub async fn reconcile_data_set(&self, set: &ContainerSet) -> Result<TickReport, RuntimeError> {
        let members = self
            .ctx
            .runtime
            .list_containers(&ContainerFilter::managed().group(&set.id).all())
            .await?;

        let mut report = TickReport {
            running: members
                .iter()
                .filter(|c| c.status == ContainerStatus::Running)
                .count(),
            ..Default::default()
        };

        let Some(image) = resolve_newest_image(self.ctx.runtime.as_ref(), &set.image).await?
        else {
            tracing::warn!(
                set = %set.id,
                image = %set.image,
                "No local image carries this reference, skipping data set"
            );
            return Ok(report);
        };

        if members.iter().any(|c| c.image_id == image.id) {
            return Ok(report);
        }

        tracing::info!(
            set = %set.id,
            image = %set.image,
            image_id = %image.id,
            "Promoting new data container generation"
        );
        report.attempted = 1;
        match self.create_and_start(set).await {
            Ok(_) => report.started = 1,
            Err(e) => {
                report.failed = 1;
                log_create_error(set, &e);
            }
        }
        Ok(report)
    }

    /// Build a request, run the hooks, create and start one container.
    ///
    /// A container that was created but failed to start is left in place for
    /// the operator or the GC.
    pub async fn create_and_start(&self, set: &ContainerSet) -> Result<String, CreateError> {
        let mut request = CreationRequest::from_set(set);
        self.pipeline.run(&self.ctx, set, &mut request).await?;

        let runtime = &self.ctx.runtime;
        let id = runtime
            .create(&request)
            .await
            .map_err(|source| CreateError::Create {
                set: set.id.clone(),
                source,
            })?;

        if let Err(source) = runtime.start(&id).await {
            return Err(CreateError::Start {
                set: set.id.clone(),
                id,
                source,
            });
        }

        tracing::info!(set = %set.id, container = %id, "Started container");
        Ok(id)
    }

    /// Stop and remove the oldest running containers above `instances`.
    async fn scale_down(&self, set: &ContainerSet, mut running: Vec<ManagedContainer>) -> usize {
        running.sort_by_key(|c| c.created);
        let excess = running.len() - set.instances;
        let mut removed = 0;

        for container in running.into_iter().take(excess) {
            let runtime = &self.ctx.runtime;
            let stopped =
                ignore_already_done(runtime.stop(&container.id, SCALE_DOWN_STOP_GRACE).await);
            let result = match stopped {
                Ok(()) => ignore_already_done(
                    runtime
                        .remove(&container.id, RemoveOptions::default())
                        .await,
                ),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::info!(set = %set.id, container = %container.short_id(), "Scaled down container");
                    removed += 1;
                }
                Err(e) => tracing::warn!(
                    set = %set.id,
                    container = %container.short_id(),
                    "Scale-down failed: {}",
                    e
                ),
            }
        }
        removed
    }
}

fn log_create_error(set: &ContainerSet, err: &CreateError) {
    match err {
        CreateError::Hook(e) if e.is_abort() => {
            tracing::warn!(set = %set.id, "Creation attempt aborted: {}", e);
        }
        CreateError::Start { id, .. } => {
            tracing::error!(set = %set.id, container = %id, "{}", err);
        }
        _ => tracing::error!(set = %set.id, "{}", err),
    }
}
