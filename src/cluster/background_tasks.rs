//! Named background task registry.
//!
//! The cluster runs three kinds of long-lived tasks:
//! - one leadership watch per dataset (`watch:{dataset}`)
//! - one session monitor per directory (`session_monitor`)
//! - one reconciliation loop per service (`reconcile`)
//!
//! All of them are spawned through a [`BackgroundTaskRegistry`] so that
//! shutdown is uniform: a broadcast signal is raced against every task with
//! `tokio::select!`, stragglers are aborted after a deadline, and dropping the
//! registry aborts whatever is left.
//!
//! # Example
//!
//! ```rust,no_run
//! use patchlog_cluster::cluster::background_tasks::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = BackgroundTaskRegistry::new();
//!
//!     registry.spawn_periodic("reconcile", Duration::from_secs(10), |_tick| async {
//!         // one reconciliation round
//!     });
//!
//!     registry.shutdown_all_with_timeout(Duration::from_secs(5)).await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is currently running.
    Running,
    /// Task returned on its own.
    Finished,
}

impl TaskStatus {
    /// Every cluster task is a loop, so a finished task means something stopped it early.
    pub fn is_healthy(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

/// Registry of named background tasks with unified shutdown.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<String, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named task, replacing (aborting) a running task with the same name.
    ///
    /// Returns `false` without spawning once shutdown has started.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.shutting_down {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return false;
        }

        if let Some(old) = self.tasks.remove(&name) {
            old.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = %task_name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = %task_name, "Task received shutdown signal");
                }
            }
        });

        tracing::debug!(task = %name, "Spawned background task");

        self.tasks.insert(name, handle);
        true
    }

    /// Spawn a task that runs `task` every `interval`, first after one full interval.
    pub fn spawn_periodic<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, mut task: F) -> bool
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            let mut tick = 0u64;
            let start = tokio::time::Instant::now() + interval;
            let mut interval_timer = tokio::time::interval_at(start, interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval_timer.tick().await;
                task(tick).await;
                tick = tick.wrapping_add(1);
            }
        })
    }

    /// Whether a task with this name is registered and still running.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Status of all tasks, sorted by name.
    pub fn health_check(&self) -> Vec<(String, TaskStatus)> {
        let mut health: Vec<_> = self
            .tasks
            .iter()
            .map(|(name, handle)| {
                let status = if handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (name.clone(), status)
            })
            .collect();
        health.sort_by(|a, b| a.0.cmp(&b.0));
        health
    }

    /// Signal every task to stop and wait up to `timeout` for them.
    ///
    /// Tasks that are still running at the deadline are aborted.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        tracing::info!(
            task_count = self.tasks.len(),
            "Initiating background task shutdown"
        );

        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;

        for (name, handle) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                tracing::warn!(task = %name, "Aborting task (timeout exceeded)");
                handle.abort();
                continue;
            }

            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(task = %name, "Task shutdown complete");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = %name, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not respond to shutdown, aborting");
                    abort_handle.abort();
                }
            }
        }

        tracing::info!("All background tasks shutdown complete");
    }

}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (name, handle) in self.tasks.drain() {
                tracing::debug!(task = %name, "Aborting task on registry drop");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[tokio::test]
    async fn test_spawn_and_health_check() {
        let mut registry = BackgroundTaskRegistry::new();

        registry.spawn("watch:orders", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        assert!(registry.is_running("watch:orders"));
        assert_eq!(
            registry.health_check(),
            vec![("watch:orders".to_string(), TaskStatus::Running)]
        );

        registry
            .shutdown_all_with_timeout(Duration::from_secs(1))
            .await;
        assert!(registry.health_check().is_empty());
        assert!(!registry.is_running("watch:orders"));
    }

    #[tokio::test]
    async fn test_spawn_replaces_existing_task() {
        let mut registry = BackgroundTaskRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter1 = counter.clone();
        let counter2 = counter.clone();

        registry.spawn("counter", async move {
            counter1.store(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.spawn("counter", async move {
            counter2.store(2, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(registry.health_check().len(), 1);

        registry
            .shutdown_all_with_timeout(Duration::from_secs(1))
            .await;
    }

    #[tokio::test]
    async fn test_spawn_periodic_waits_one_interval() {
        let mut registry = BackgroundTaskRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        registry.spawn_periodic("ticker", Duration::from_millis(20), move |_tick| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(110)).await;
        let count = counter.load(Ordering::SeqCst);
        assert!(count >= 3, "Expected at least 3 ticks, got {}", count);

        registry
            .shutdown_all_with_timeout(Duration::from_secs(1))
            .await;
    }

    #[tokio::test]
    async fn test_finished_task_is_unhealthy() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("quick_task", async {});
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            registry.health_check(),
            vec![("quick_task".to_string(), TaskStatus::Finished)]
        );
    }

    #[tokio::test]
    async fn test_spawn_during_shutdown_ignored() {
        let mut registry = BackgroundTaskRegistry::new();
        registry
            .shutdown_all_with_timeout(Duration::from_millis(10))
            .await;

        assert!(!registry.spawn("late", async {}));
        assert!(registry.health_check().is_empty());
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        {
            let mut registry = BackgroundTaskRegistry::new();
            registry.spawn("drop_test", async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag_clone.store(true, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_task_status_is_healthy() {
        assert!(TaskStatus::Running.is_healthy());
        assert!(!TaskStatus::Finished.is_healthy());
    }
}
