//! Fixed-capacity pool of outbound connections.
//!
//! Every slot holds a ready connection. A caller checks one out for a single
//! piece of work and hands it back afterwards; when the work failed at the
//! connection level the connection is replaced instead of returned.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Errors that can tell whether the connection that produced them is still usable.
pub trait ConnectionFailure {
    fn discards_connection(&self) -> bool;
}

type Factory<C> = Box<dyn Fn() -> Result<C, EngineError> + Send + Sync>;

pub struct ConnectionPool<C> {
    idle: Mutex<Vec<C>>,
    permits: Semaphore,
    capacity: usize,
    factory: Factory<C>,
    waiting: AtomicUsize,
    replaced: AtomicU64,
}

impl<C: Send> ConnectionPool<C> {
    /// Build `capacity` connections up front. A factory error here is fatal.
    pub fn new<F>(capacity: usize, factory: F) -> Result<Self, EngineError>
    where
        F: Fn() -> Result<C, EngineError> + Send + Sync + 'static,
    {
        let capacity = capacity.max(1);
        let idle = (0..capacity)
            .map(|_| factory())
            .collect::<Result<Vec<_>, _>>()?;

        debug!(capacity, "Connection pool populated");
        Ok(Self {
            idle: Mutex::new(idle),
            permits: Semaphore::new(capacity),
            capacity,
            factory: Box::new(factory),
            waiting: AtomicUsize::new(0),
            replaced: AtomicU64::new(0),
        })
    }

    /// Wait for a free connection, then run `work` with it.
    ///
    /// `work` hands the connection back together with its result so the pool
    /// can decide whether to keep it.
    pub async fn perform<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = (C, Result<T, E>)>,
        E: ConnectionFailure + From<EngineError>,
    {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.permits.acquire().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit.ok();

        // A held permit normally guarantees an idle connection.
        let checked_out = self.idle.lock().pop();
        let connection = match checked_out {
            Some(connection) => connection,
            None => (self.factory)()?,
        };

        let (connection, result) = work(connection).await;
        let returned = match &result {
            Err(e) if e.discards_connection() => self.replacement(connection),
            _ => connection,
        };
        self.idle.lock().push(returned);
        result
    }

    fn replacement(&self, broken: C) -> C {
        match (self.factory)() {
            Ok(fresh) => {
                self.replaced.fetch_add(1, Ordering::Relaxed);
                debug!("Replaced failed connection");
                fresh
            }
            Err(e) => {
                warn!(error = %e, "Could not create replacement connection, reusing the old one");
                broken
            }
        }
    }

    /// Callers queued for a connection.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections replaced after errors since startup.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Conn(u32);

    #[derive(Debug, PartialEq)]
    enum TestError {
        Broken,
        Soft,
        Setup,
    }

    impl ConnectionFailure for TestError {
        fn discards_connection(&self) -> bool {
            matches!(self, TestError::Broken)
        }
    }

    impl From<EngineError> for TestError {
        fn from(_: EngineError) -> Self {
            TestError::Setup
        }
    }

    fn numbered_pool(capacity: usize) -> ConnectionPool<Conn> {
        let next = Arc::new(AtomicU64::new(0));
        ConnectionPool::new(capacity, move || {
            Ok(Conn(next.fetch_add(1, Ordering::SeqCst) as u32))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_prefills_capacity() {
        let pool = numbered_pool(3);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.idle.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let pool = numbered_pool(1);
        let first: Result<u32, TestError> = pool
            .perform(|c| async move {
                let id = c.0;
                (c, Err(if id == 0 { TestError::Broken } else { TestError::Soft }))
            })
            .await;
        assert_eq!(first, Err(TestError::Broken));
        assert_eq!(pool.replaced(), 1);

        let id: Result<u32, TestError> = pool.perform(|c| async move { let id = c.0; (c, Ok(id)) }).await;
        assert_eq!(id, Ok(1));
    }

    #[tokio::test]
    async fn test_soft_error_keeps_connection() {
        let pool = numbered_pool(1);
        let _: Result<(), TestError> = pool.perform(|c| async move { (c, Err(TestError::Soft)) }).await;
        let id: Result<u32, TestError> = pool.perform(|c| async move { let id = c.0; (c, Ok(id)) }).await;
        assert_eq!(id, Ok(0));
        assert_eq!(pool.replaced(), 0);
    }

    #[tokio::test]
    async fn test_waiting_counts_queued_callers() {
        let pool = Arc::new(numbered_pool(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _: Result<(), TestError> = pool
                    .perform(|c| async move {
                        let _ = release_rx.await;
                        (c, Ok(()))
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _: Result<(), TestError> = pool.perform(|c| async move { (c, Ok(())) }).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.waiting(), 1);

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        queued.await.unwrap();
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.available(), 1);
    }
}
