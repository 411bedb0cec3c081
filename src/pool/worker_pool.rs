// Shared worker pool
// Bounded executor for database work: at most `max_workers` tasks run at once,
// at most `queue_capacity` more may wait, and anything beyond that is rejected.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::db::traits::DatabaseError;

static GLOBAL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Workers expected to be busy in steady state (reported, not enforced)
    pub core_workers: usize,
    /// Maximum tasks running at once
    pub max_workers: usize,
    /// Maximum tasks waiting for a worker
    pub queue_capacity: usize,
    /// Grace period for pending tasks on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_workers: 10,
            max_workers: 100,
            queue_capacity: 1000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to a submitted task
pub struct TaskHandle<T> {
    inner: JoinHandle<Option<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's output
    pub async fn join(self) -> Result<T, DatabaseError> {
        match self.inner.await {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(DatabaseError::TaskCancelled),
            Err(e) if e.is_cancelled() => Err(DatabaseError::TaskCancelled),
            Err(e) => Err(DatabaseError::TaskFailed(e.to_string())),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// Decrements a counter when dropped, so panicking tasks are still accounted for
struct CounterGuard(Arc<AtomicUsize>);

impl CounterGuard {
    /// Take over a count that was already incremented
    fn hold(counter: Arc<AtomicUsize>) -> Self {
        Self(counter)
    }

    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    /// Submitted and not yet finished (running + waiting)
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        tracing::info!(
            core_workers = config.core_workers,
            max_workers,
            queue_capacity = config.queue_capacity,
            "Database worker pool initialized"
        );
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            config: WorkerPoolConfig { max_workers, ..config },
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Process-wide pool, created on first use with the default config
    pub fn global() -> Arc<WorkerPool> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(WorkerPool::new(WorkerPoolConfig::default()))))
    }

    /// Install a custom process-wide pool. Returns false if one already exists.
    pub fn init_global(config: WorkerPoolConfig) -> bool {
        GLOBAL.set(Arc::new(WorkerPool::new(config))).is_ok()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Most tasks the pool holds at once before rejecting
    pub fn capacity(&self) -> usize {
        self.config.max_workers + self.config.queue_capacity
    }

    /// Queue a task.
    ///
    /// Must be called from within a Tokio runtime. Fails once shutdown has
    /// started or when the pool is already holding `capacity()` tasks.
    pub fn submit<Fut>(&self, task: Fut) -> Result<TaskHandle<Fut::Output>, DatabaseError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        if self.tracker.is_closed() || self.cancel.is_cancelled() {
            return Err(DatabaseError::WorkerPoolShutdown);
        }

        let capacity = self.capacity();
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < capacity).then_some(pending + 1)
            })
            .map_err(|_| DatabaseError::WorkerPoolSaturated { capacity })?;

        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let pending = Arc::clone(&self.pending);
        let active = Arc::clone(&self.active);
        let completed = Arc::clone(&self.completed);

        let inner = self.tracker.spawn(async move {
            let _pending = CounterGuard::hold(pending);
            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.acquire_owned() => match permit {
                    Ok(_permit) => {
                        let _active = CounterGuard::enter(active);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            output = task => Some(output),
                        }
                    }
                    Err(_) => None,
                },
            };
            if output.is_some() {
                completed.fetch_add(1, Ordering::AcqRel);
            }
            output
        });

        Ok(TaskHandle { inner })
    }

    /// Stop accepting work and wait for pending tasks.
    ///
    /// Tasks still pending after `shutdown_timeout` are cancelled.
    pub async fn shutdown(&self) {
        tracing::info!(
            pending = self.pending.load(Ordering::Acquire),
            "Shutting down database worker pool"
        );
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Worker pool did not terminate gracefully, cancelling remaining tasks");
            self.cancel.cancel();
            self.tracker.wait().await;
        }

        tracing::info!(
            completed = self.completed_count(),
            "Database worker pool shutdown completed"
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Tasks currently running
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Tasks waiting for a worker
    pub fn queued_count(&self) -> usize {
        self.pending
            .load(Ordering::Acquire)
            .saturating_sub(self.active_count())
    }

    /// Tasks that ran to completion
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn small_pool(max_workers: usize, queue_capacity: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            core_workers: 1,
            max_workers,
            queue_capacity,
            shutdown_timeout: Duration::from_millis(200),
        })
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.core_workers, 10);
        assert_eq!(config.max_workers, 100);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_submit_and_join() {
        let pool = small_pool(2, 2);
        let handle = pool.submit(async { 21 * 2 }).unwrap();
        assert_eq!(handle.join().await.unwrap(), 42);
        assert_eq!(pool.completed_count(), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_beyond_capacity() {
        let pool = small_pool(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = pool
            .submit(async move {
                let _ = release_rx.await;
            })
            .unwrap();
        let queued = pool.submit(async {}).unwrap();

        let err = pool.submit(async {}).err().unwrap();
        assert!(matches!(err, DatabaseError::WorkerPoolSaturated { capacity: 2 }));

        release_tx.send(()).unwrap();
        running.join().await.unwrap();
        queued.join().await.unwrap();

        // Room again once the backlog drains
        assert!(pool.submit(async {}).is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = small_pool(3, 100);
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let peak = Arc::clone(&peak);
            let running = Arc::clone(&running);
            handles.push(
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.completed_count(), 20);
    }

    #[tokio::test]
    async fn test_panicking_task_reports_failure() {
        let pool = small_pool(1, 1);
        let handle = pool
            .submit(async { Option::<u8>::None.expect("shard blew up") })
            .unwrap();
        let err: DatabaseError = handle.join().await.err().unwrap();
        assert!(matches!(err, DatabaseError::TaskFailed(_)));
        assert_eq!(pool.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_then_rejects() {
        let pool = small_pool(2, 2);
        let handle = pool
            .submit(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                "done"
            })
            .unwrap();

        pool.shutdown().await;
        assert!(pool.is_shutdown());
        assert_eq!(handle.join().await.unwrap(), "done");
        assert!(matches!(
            pool.submit(async {}).err(),
            Some(DatabaseError::WorkerPoolShutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stragglers() {
        let pool = small_pool(1, 1);
        let handle = pool
            .submit(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();

        pool.shutdown().await;
        assert!(matches!(handle.join().await, Err(DatabaseError::TaskCancelled)));
        assert_eq!(pool.completed_count(), 0);
    }

    #[test]
    fn test_global_is_shared() {
        let a = WorkerPool::global();
        let b = WorkerPool::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!WorkerPool::init_global(WorkerPoolConfig::default()));
    }
}
