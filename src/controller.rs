//! Wires the reconciler, the sweepers and the plugins onto the scheduler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::AppContext;
use crate::error::{HookError, IdleError};
use crate::gc::{AgeReport, AgeSweeper, CadaverSweeper, SweepReport};
use crate::idle::ScriptConsoleDetector;
use crate::plugins::PluginRegistry;
use crate::reconciler::Reconciler;
use crate::runtime::{ContainerFilter, ContainerRuntime, RemoveOptions, ignore_already_done};
use crate::scheduler::Next;

/// How long shutdown waits for a task to finish its current tick.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Result of removing every managed container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failures: usize,
}

/// Force-remove every container labelled `auto-deployed=true`.
pub async fn cleanup_all(runtime: &dyn ContainerRuntime) -> CleanupReport {
    let mut report = CleanupReport::default();
    let containers = match runtime.list_containers(&ContainerFilter::managed().all()).await {
        Ok(containers) => containers,
        Err(e) => {
            tracing::error!("Cleanup could not list managed containers: {}", e);
            report.failures += 1;
            return report;
        }
    };

    let options = RemoveOptions {
        force: true,
        volumes: false,
    };
    for container in containers {
        match ignore_already_done(runtime.remove(&container.id, options).await) {
            Ok(()) => {
                tracing::info!(container = %container.short_id(), "Removed managed container");
                report.removed += 1;
            }
            Err(e) => {
                tracing::warn!(container = %container.short_id(), "Cleanup failed: {}", e);
                report.failures += 1;
            }
        }
    }
    report
}

/// The running controller.
pub struct Controller {
    ctx: Arc<AppContext>,
    registry: PluginRegistry,
    reconciler: Arc<Reconciler>,
    cadavers: Arc<CadaverSweeper>,
    ages: Arc<AgeSweeper>,
}

impl Controller {
    pub fn new(ctx: Arc<AppContext>, registry: PluginRegistry) -> Result<Self, IdleError> {
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&ctx), registry.pipeline()));
        let cadavers = Arc::new(CadaverSweeper::new(Arc::clone(&ctx)));

        let mut ages = AgeSweeper::new(Arc::clone(&ctx));
        if let Some(idle) = &ctx.config.idle_detector {
            tracing::info!("Age sweep limited to workers reported idle by {}", idle.url);
            ages = ages.with_idle_detector(Arc::new(ScriptConsoleDetector::new(idle.clone())?));
        }

        Ok(Self {
            ctx,
            registry,
            reconciler,
            cadavers,
            ages: Arc::new(ages),
        })
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Initialize plugins and spawn every repeating task.
    ///
    /// When a plugin fails to initialize, tasks spawned by the plugins before
    /// it are stopped and nothing else is started.
    pub async fn start(&self) -> Result<(), HookError> {
        if let Err(e) = self.registry.init_all(&self.ctx).await {
            self.ctx.scheduler.shutdown(SHUTDOWN_GRACE).await;
            return Err(e);
        }

        let config = &self.ctx.config;
        let scheduler = &self.ctx.scheduler;

        for set in &config.containers {
            let reconciler = Arc::clone(&self.reconciler);
            let set = Arc::new(set.clone());
            scheduler.spawn_repeating(
                format!("reconcile:{}", set.id),
                config.scale_interval,
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    let set = Arc::clone(&set);
                    async move {
                        reconciler.tick(&set).await;
                        Next::Regular
                    }
                },
            );
        }

        let cadavers = Arc::clone(&self.cadavers);
        scheduler.spawn_repeating("gc", config.gc_interval, move || {
            let cadavers = Arc::clone(&cadavers);
            async move {
                cadavers.sweep().await;
                Next::Regular
            }
        });

        if config.max_age.is_some() {
            let ages = Arc::clone(&self.ages);
            scheduler.spawn_repeating("age-check", config.age_check_interval, move || {
                let ages = Arc::clone(&ages);
                async move {
                    let report = ages.sweep().await;
                    ages.next_run(&report)
                }
            });
        }

        tracing::info!(
            sets = config.containers.len(),
            plugins = ?self.registry.names(),
            "Controller started"
        );
        Ok(())
    }

    /// Stop every task, deinitialize plugins and optionally remove the fleet.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.ctx.scheduler.shutdown(SHUTDOWN_GRACE).await;
        self.registry.deinit_all(&self.ctx).await;

        if self.ctx.config.cleanup_on_exit {
            let report = cleanup_all(self.ctx.runtime.as_ref()).await;
            tracing::info!(
                removed = report.removed,
                failures = report.failures,
                "Removed managed containers on exit"
            );
        }
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), HookError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await;
        Ok(())
    }

    /// One cadaver sweep followed by one age sweep.
    pub async fn sweep_once(&self) -> (SweepReport, AgeReport) {
        let sweep = self.cadavers.sweep().await;
        let age = self.ages.sweep().await;
        (sweep, age)
    }
}
