//! Age-based retirement of worker containers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::context::AppContext;
use crate::error::RuntimeError;
use crate::idle::{IdleDetector, WORKER_ID_LEN};
use crate::runtime::{
    ContainerFilter, ContainerStatus, ManagedContainer, RemoveOptions, ignore_already_done, labels,
};
use crate::scheduler::Next;

/// Grace period for retiring workers.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Outcome of one age sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgeReport {
    /// Workers past `maxAge` (and idle, when a detector is configured).
    pub candidates: usize,
    /// Workers stopped and removed, oldest first.
    pub retired: Vec<String>,
    /// Candidates left for the next, shorter, retry.
    pub deferred: usize,
    pub failures: usize,
}

/// Stops and removes running workers older than `maxAge`, at most `slowKill`
/// per sweep.
pub struct AgeSweeper {
    ctx: Arc<AppContext>,
    idle: Option<Arc<dyn IdleDetector>>,
}

impl AgeSweeper {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx, idle: None }
    }

    /// Only retire workers the detector reports as idle.
    pub fn with_idle_detector(mut self, detector: Arc<dyn IdleDetector>) -> Self {
        self.idle = Some(detector);
        self
    }

    /// When to run next after a sweep that produced `report`.
    pub fn next_run(&self, report: &AgeReport) -> Next {
        if report.deferred > 0 {
            Next::After(self.ctx.config.slow_kill_wait)
        } else {
            Next::Regular
        }
    }

    pub async fn sweep(&self) -> AgeReport {
        let mut report = AgeReport::default();
        let Some(max_age) = self.ctx.config.max_age.filter(|d| !d.is_zero()) else {
            return report;
        };

        let mut candidates = match self.expired_workers(max_age).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Age sweep could not list workers: {}", e);
                report.failures += 1;
                return report;
            }
        };
        if candidates.is_empty() {
            return report;
        }

        if let Some(detector) = &self.idle {
            match detector.idle_workers().await {
                Ok(idle) => candidates.retain(|c| {
                    c.id
                        .get(..WORKER_ID_LEN)
                        .is_some_and(|prefix| idle.contains(prefix))
                }),
                Err(e) => {
                    tracing::warn!("Idle detector failed, retiring nothing this round: {}", e);
                    report.failures += 1;
                    return report;
                }
            }
        }

        report.candidates = candidates.len();
        let budget = match self.ctx.config.slow_kill {
            0 => usize::MAX,
            n => n,
        };
        report.deferred = candidates.len().saturating_sub(budget);

        for container in candidates.into_iter().take(budget) {
            match self.retire(&container).await {
                Ok(()) => {
                    tracing::info!(
                        container = %container.short_id(),
                        group = container.group_id().unwrap_or("-"),
                        age = %(Utc::now() - container.created),
                        "Retired worker past max age"
                    );
                    report.retired.push(container.id);
                }
                Err(e) => {
                    tracing::warn!(container = %container.short_id(), "Failed to retire worker: {}", e);
                    report.failures += 1;
                }
            }
        }

        if report.deferred > 0 {
            tracing::debug!(
                deferred = report.deferred,
                "Age sweep budget exhausted, retrying in {:?}",
                self.ctx.config.slow_kill_wait
            );
        }
        report
    }

    /// Running workers created before `now - max_age`, oldest first.
    async fn expired_workers(
        &self,
        max_age: Duration,
    ) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };

        let mut workers = self
            .ctx
            .runtime
            .list_containers(
                &ContainerFilter::managed()
                    .label(labels::DATA_CONTAINER, "false")
                    .status(ContainerStatus::Running),
            )
            .await?;
        workers.retain(|c| c.created < cutoff);
        workers.sort_by_key(|c| c.created);
        Ok(workers)
    }

    async fn retire(&self, container: &ManagedContainer) -> Result<(), RuntimeError> {
        let runtime = &self.ctx.runtime;
        ignore_already_done(runtime.stop(&container.id, STOP_GRACE).await)?;
        ignore_already_done(runtime.remove(&container.id, RemoveOptions::default()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{FakeRuntime, StaticIdle, container, data_container, test_context_with};

    fn aged(id: &str, hours: i64) -> ManagedContainer {
        let mut c = container(id, "worker", ContainerStatus::Running);
        c.created = Utc::now() - chrono::Duration::hours(hours);
        c
    }

    fn config(max_age_secs: u64, slow_kill: usize) -> Config {
        Config {
            max_age: Some(Duration::from_secs(max_age_secs)),
            slow_kill,
            slow_kill_wait: Duration::from_secs(7),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_slow_kill_limits_and_defers() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_container(aged("w-middle", 5));
        runtime.insert_container(aged("w-oldest", 9));
        runtime.insert_container(aged("w-newest", 3));
        runtime.insert_container(aged("w-young", 0));
        let sweeper =
            AgeSweeper::new(Arc::new(test_context_with(config(3600, 1), Arc::clone(&runtime))));

        let report = sweeper.sweep().await;

        assert_eq!(report.candidates, 3);
        assert_eq!(report.retired, vec!["w-oldest"]);
        assert_eq!(report.deferred, 2);
        assert_eq!(sweeper.next_run(&report), Next::After(Duration::from_secs(7)));
        assert_eq!(runtime.stopped(), vec!["w-oldest"]);
        assert_eq!(runtime.removed(), vec!["w-oldest"]);
    }

    #[tokio::test]
    async fn test_unlimited_when_slow_kill_is_zero() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_container(aged("a", 2));
        runtime.insert_container(aged("b", 3));
        let sweeper =
            AgeSweeper::new(Arc::new(test_context_with(config(3600, 0), Arc::clone(&runtime))));

        let report = sweeper.sweep().await;

        assert_eq!(report.retired, vec!["b", "a"]);
        assert_eq!(sweeper.next_run(&report), Next::Regular);
    }

    #[tokio::test]
    async fn test_data_containers_and_disabled_max_age() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut db = data_container("db-1", "db", ContainerStatus::Running, "pg");
        db.created = Utc::now() - chrono::Duration::days(30);
        runtime.insert_container(db);

        let ctx = Arc::new(test_context_with(config(60, 0), Arc::clone(&runtime)));
        assert!(AgeSweeper::new(ctx).sweep().await.retired.is_empty());

        runtime.insert_container(aged("w", 48));
        let ctx = Arc::new(test_context_with(Config::default(), Arc::clone(&runtime)));
        assert_eq!(AgeSweeper::new(ctx).sweep().await, AgeReport::default());
    }

    #[tokio::test]
    async fn test_idle_detector_filters_by_id_prefix() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_container(aged("aaaaaaaa11112222", 5));
        runtime.insert_container(aged("bbbbbbbb11112222", 6));
        let ctx = Arc::new(test_context_with(config(3600, 0), Arc::clone(&runtime)));
        let sweeper = AgeSweeper::new(ctx).with_idle_detector(Arc::new(StaticIdle::new(&["aaaaaaaa"])));

        let report = sweeper.sweep().await;

        assert_eq!(report.retired, vec!["aaaaaaaa11112222"]);
        assert_eq!(runtime.container_ids(), vec!["bbbbbbbb11112222"]);
    }

    #[tokio::test]
    async fn test_idle_detector_failure_retires_nothing() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_container(aged("aaaaaaaa11112222", 5));
        let ctx = Arc::new(test_context_with(config(3600, 0), Arc::clone(&runtime)));
        let sweeper = AgeSweeper::new(ctx).with_idle_detector(Arc::new(StaticIdle::failing()));

        let report = sweeper.sweep().await;

        assert!(report.retired.is_empty());
        assert_eq!(report.failures, 1);
    }
}
