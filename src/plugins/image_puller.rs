//! Periodic image refresh.
//!
//! Pulling a newer image is what lets a data set promote a new generation:
//! the next reconcile tick resolves the set's reference to a new image id.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::Plugin;
use crate::scheduler::Next;

const NAME: &str = "image-puller";

/// Counts from one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pulled: usize,
    pub failed: usize,
}

/// Pull every distinct image of the sets with `pull: true`.
pub async fn pull_set_images(ctx: &AppContext) -> PullReport {
    let mut report = PullReport::default();
    let mut seen = HashSet::new();
    let auth = ctx.config.auth.as_ref();

    for set in ctx.config.containers.iter().filter(|s| s.pull) {
        if !seen.insert(set.image.as_str()) {
            continue;
        }

        tracing::debug!(set = %set.id, "Pulling image {}", set.image);
        let mut stream = ctx.runtime.pull(&set.image, auth);
        let mut failed = false;
        while let Some(event) = stream.next().await {
            match event {
                Ok(progress) => {
                    tracing::trace!(
                        image = %set.image,
                        status = progress.status.as_deref().unwrap_or(""),
                        progress = progress.progress.as_deref().unwrap_or(""),
                        "pull"
                    );
                }
                Err(e) => {
                    tracing::warn!(set = %set.id, "Failed to pull image {}: {}", set.image, e);
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            report.failed += 1;
        } else {
            report.pulled += 1;
        }
    }
    report
}

/// Spawns the refresh task when `pullInterval` is set.
pub struct ImagePuller;

#[async_trait]
impl Plugin for ImagePuller {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(&self, ctx: &Arc<AppContext>) -> Result<(), HookError> {
        let Some(interval) = ctx.config.pull_interval.filter(|d| !d.is_zero()) else {
            tracing::debug!("Image refresh disabled");
            return Ok(());
        };

        let task_ctx = Arc::clone(ctx);
        ctx.scheduler.spawn_repeating(NAME, interval, move || {
            let ctx = Arc::clone(&task_ctx);
            async move {
                let report = pull_set_images(&ctx).await;
                if report.pulled + report.failed > 0 {
                    tracing::info!(
                        pulled = report.pulled,
                        failed = report.failed,
                        "Image refresh finished"
                    );
                }
                Next::Regular
            }
        });
        tracing::info!("Refreshing images every {:?}", interval);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{Config, ContainerSet};
    use crate::testing::{FakeRuntime, test_context_with};

    fn set(id: &str, image: &str, pull: bool) -> ContainerSet {
        let mut set = ContainerSet::defaults(id);
        set.image = image.to_string();
        set.pull = pull;
        set
    }

    #[tokio::test]
    async fn test_pulls_each_image_once() {
        let runtime = Arc::new(FakeRuntime::new());
        let config = Config {
            containers: vec![
                set("web", "nginx:latest", true),
                set("web2", "nginx:latest", true),
                set("local", "mytool:dev", false),
                set("db", "postgres:16", true),
            ],
            ..Config::default()
        };
        let ctx = test_context_with(config, Arc::clone(&runtime));

        let report = pull_set_images(&ctx).await;

        assert_eq!(report, PullReport { pulled: 2, failed: 0 });
        assert_eq!(runtime.pulled(), vec!["nginx:latest", "postgres:16"]);
    }

    #[tokio::test]
    async fn test_init_without_interval_spawns_nothing() {
        let ctx = Arc::new(test_context_with(
            Config::default(),
            Arc::new(FakeRuntime::new()),
        ));
        ImagePuller.init(&ctx).await.unwrap();
        assert!(ctx.scheduler.task_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_with_interval_spawns_task() {
        let runtime = Arc::new(FakeRuntime::new());
        let config = Config {
            pull_interval: Some(Duration::from_secs(300)),
            containers: vec![set("web", "nginx:latest", true)],
            ..Config::default()
        };
        let ctx = Arc::new(test_context_with(config, Arc::clone(&runtime)));

        ImagePuller.init(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(ctx.scheduler.task_names(), vec!["image-puller"]);
        assert_eq!(runtime.pulled(), vec!["nginx:latest"]);
        ctx.scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
