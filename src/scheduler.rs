//! Owned collection of repeating tasks.
//!
//! Every periodic concern (one reconcile loop per set, the cadaver sweep, the
//! age sweep, plugin tasks) runs as its own tokio task, so a slow tick in one
//! never delays another. All tasks watch one shutdown signal; [`Scheduler::shutdown`]
//! raises it and waits for each task to finish its current tick.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// When a task should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// After the task's regular period.
    Regular,
    /// After the given delay, once.
    After(Duration),
}

/// Repeating task registry with a single shutdown switch.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `tick` immediately and then every `period` (or whatever delay
    /// the previous tick asked for) until shutdown.
    pub fn spawn_repeating<F, Fut>(&self, name: impl Into<String>, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Next> + Send + 'static,
    {
        let name = name.into();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            tracing::debug!(task = %task_name, ?period, "Scheduled task started");
            let mut delay = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                delay = match tick().await {
                    Next::Regular => period,
                    Next::After(d) => d,
                };
            }
            tracing::debug!(task = %task_name, "Scheduled task stopped");
        });

        self.lock_tasks().push((name, handle));
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// A receiver that resolves once shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Names of the tasks currently registered.
    pub fn task_names(&self) -> Vec<String> {
        self.lock_tasks().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Signal every task to stop and wait up to `grace` for each to finish
    /// its current tick. Tasks still running after that are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.lock_tasks());

        for (name, mut handle) in tasks {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(task = %name, "Scheduled task panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(task = %name, "Scheduled task did not stop in {:?}, aborting", grace);
                    handle.abort();
                }
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_immediately_then_every_period() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        scheduler.spawn_repeating("counter", Duration::from_secs(10), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Next::Regular
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        scheduler.shutdown(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_shutting_down());
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_can_request_shorter_retry() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        scheduler.spawn_repeating("retry", Duration::from_secs(60), move || {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Next::After(Duration::from_secs(5))
                } else {
                    Next::Regular
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
