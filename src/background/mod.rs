//! Background work: a bounded spawner for fire-and-forget tasks and a periodic
//! ticker for maintenance jobs.
//!
//! [`TaskPool::spawn`] never makes the caller wait. The concurrency permit is
//! acquired inside the spawned task, so a burst of revalidations queues up in the
//! runtime instead of stalling the read path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Spawner that caps how many of its tasks run at once.
#[derive(Debug, Clone)]
pub struct TaskPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl TaskPool {
    /// A pool named `name` for logs, running at most `max_concurrent` tasks
    /// (at least one).
    pub fn new(name: &'static str, max_concurrent: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runs `task` in the background once a permit is free.
    ///
    /// Callers get the handle but are not expected to await it; dropping the
    /// handle does not cancel the task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let pool = self.name;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(pool, "task pool closed, dropping task");
                return;
            };
            task.await;
        })
    }

    /// Permits not currently held by a running task.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Calls `tick` every `period` until it returns `false`.
///
/// The first tick fires after one full period. Ticks missed while `tick` was
/// running are skipped rather than replayed.
pub fn spawn_interval<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // `interval` completes its first tick immediately.
        ticker.tick().await;

        info!(job = name, period_secs = period.as_secs(), "periodic job started");
        loop {
            ticker.tick().await;
            if !tick().await {
                break;
            }
        }
        info!(job = name, "periodic job stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn spawned_tasks_run() {
        let pool = TaskPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = TaskPool::new("bounded", 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_interval("ticker", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 }
        });

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
