//! Tracked fire-and-forget tasks.
//!
//! Background refreshes, expiration passes and miss fetches outlive the
//! request that started them. They are collected here so that failures are
//! logged and so that callers can wait for the system to go quiet.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::{JoinError, JoinSet};

/// Shared set of detached tasks.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a detached task on the current runtime.
    ///
    /// Finished tasks are reaped first so the set does not grow with traffic.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        while let Some(result) = set.try_join_next() {
            log_outcome(result);
        }
        set.spawn(task);
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every tracked task, including ones spawned while waiting,
    /// has finished.
    pub async fn settle(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.lock());
            if set.is_empty() {
                return;
            }
            while let Some(result) = set.join_next().await {
                log_outcome(result);
            }
        }
    }
}

fn log_outcome(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "background task panicked");
        } else {
            tracing::debug!(error = %e, "background task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_waits_for_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.settle().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_settle_includes_nested_spawns() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        let inner_tasks = tasks.clone();
        let inner_done = done.clone();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner_tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });

        tasks.settle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async { panic!("boom") });
        tasks.settle().await;
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_reaps_finished_tasks() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        assert_eq!(tasks.len(), 1);
        tasks.settle().await;
    }
}
