//! Bounded background worker pool.
//!
//! Queue and store calls run here so that no more than `threads` of them are
//! in flight at once. The pool also tracks how many tasks are queued or
//! running, which the drain logic uses to decide when work has finished.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Semaphore,
    size: usize,
    active: AtomicUsize,
    idle: Notify,
}

/// Counts a task as active from submission until it is dropped.
struct ActiveGuard(Arc<Inner>);

impl ActiveGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(size),
                size,
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Submit a task without waiting for it.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = ActiveGuard::new(self.inner.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            // Never closed, so acquisition cannot fail.
            let _permit = inner.permits.acquire().await.ok();
            task.await
        })
    }

    /// Run a borrowed task under a pool slot and wait for its result.
    pub async fn run<F: Future>(&self, task: F) -> F::Output {
        let _guard = ActiveGuard::new(self.inner.clone());
        let _permit = self.inner.permits.acquire().await.ok();
        task.await
    }

    /// Tasks queued or running.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }

    /// Resolve once no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.is_idle() {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        assert_eq!(pool.active(), 6);
        pool.wait_idle().await;
        assert!(pool.is_idle());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let pool = WorkerPool::new(1);
        let value = String::from("borrowed");
        let len = pool.run(async { value.len() }).await;
        assert_eq!(len, 8);
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_pool() {
        let pool = WorkerPool::new(4);
        tokio::time::timeout(Duration::from_millis(50), pool.wait_idle())
            .await
            .unwrap();
    }
}
