//! Batched acknowledgment buffer.
//!
//! Receipt handles are collected and deleted in groups of up to
//! `sqs_batch_delete_size`. A full buffer is flushed at once; a timer flushes
//! whatever is left over. With batching off every handle is deleted on its
//! own.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqsd_common::{retry, RetryPolicy};
use sqsd_queue::{Acknowledger, QueueClient, QueueError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::workers::WorkerPool;

/// Retries for single deletes when batching is off.
const SINGLE_DELETE_RETRY: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(250));

#[derive(Debug, Clone, Copy)]
pub struct AckSettings {
    pub batch_size: usize,
    /// Whether batching is allowed at all. Autotuning can only narrow this.
    pub batching: bool,
    pub flush_interval: Duration,
}

#[derive(Clone)]
pub struct AckBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<dyn QueueClient>,
    workers: WorkerPool,
    pending: Mutex<Vec<String>>,
    batching: AtomicBool,
    settings: AckSettings,
}

impl AckBuffer {
    pub fn new(queue: Arc<dyn QueueClient>, workers: WorkerPool, settings: AckSettings) -> Self {
        let settings = AckSettings {
            batch_size: settings.batch_size.clamp(1, sqsd_config::SQS_BATCH_LIMIT),
            ..settings
        };
        Self {
            inner: Arc::new(Inner {
                queue,
                workers,
                pending: Mutex::new(Vec::with_capacity(settings.batch_size)),
                batching: AtomicBool::new(settings.batching),
                settings,
            }),
        }
    }

    /// Add a handle. A full buffer is handed to the worker pool before this returns.
    pub fn enqueue(&self, receipt_handle: String) {
        if !self.is_batching() {
            let inner = self.inner.clone();
            self.inner
                .workers
                .spawn(async move { inner.delete_single(receipt_handle).await });
            return;
        }

        let full_batch = {
            let mut pending = self.inner.pending.lock();
            pending.push(receipt_handle);
            if pending.len() >= self.inner.settings.batch_size {
                Some(take_batch(&mut pending, self.inner.settings.batch_size))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            let inner = self.inner.clone();
            self.inner
                .workers
                .spawn(async move { inner.delete_batch(batch).await });
        }
    }

    /// Delete up to one batch of pending handles. Empty buffer is a no-op.
    pub async fn flush(&self) {
        let batch = take_batch(&mut self.inner.pending.lock(), self.inner.settings.batch_size);
        if batch.is_empty() {
            return;
        }
        self.inner
            .workers
            .run(self.inner.delete_batch(batch))
            .await;
    }

    /// Flush until nothing is pending.
    pub async fn flush_all(&self) {
        while !self.inner.pending.lock().is_empty() {
            self.flush().await;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_batching(&self) -> bool {
        self.inner.batching.load(Ordering::SeqCst)
    }

    /// Turn batching on or off. Has no effect when batching is disabled by
    /// configuration. Turning it off flushes what is already buffered.
    pub fn set_batching(&self, enabled: bool) {
        let enabled = enabled && self.inner.settings.batching;
        let was = self.inner.batching.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(batching = enabled, "Changed delete batching");
            if !enabled && self.pending() > 0 {
                let buffer = self.clone();
                self.inner.workers.spawn(async move { buffer.flush_all().await });
            }
        }
    }

    /// Spawn the periodic flush timer.
    pub fn start_timer(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let buffer = self.clone();
        let period = self.inner.settings.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => buffer.flush().await,
                    _ = shutdown_rx.recv() => {
                        debug!("Ack flush timer stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Acknowledger for AckBuffer {
    async fn acknowledge(&self, receipt_handle: String) {
        self.enqueue(receipt_handle);
    }
}

impl Inner {
    async fn delete_batch(&self, batch: Vec<String>) {
        let size = batch.len();
        match self.queue.delete_batch(&batch).await {
            Ok(outcome) => {
                debug!(deleted = outcome.deleted, "Deleted message batch");
                for failed in outcome.failed {
                    warn!(
                        category = "delete-err",
                        receipt_handle = %failed.receipt_handle,
                        code = %failed.code,
                        reason = failed.message.as_deref().unwrap_or(""),
                        "Message was not deleted and will be redelivered"
                    );
                }
            }
            Err(e) => error!(
                category = "delete-err",
                batch_size = size,
                error = %e,
                "Batch delete failed, messages will be redelivered"
            ),
        }
    }

    async fn delete_single(&self, receipt_handle: String) {
        let result = retry(SINGLE_DELETE_RETRY, QueueError::is_transient, || {
            self.queue.delete(&receipt_handle)
        })
        .await;
        if let Err(e) = result {
            error!(
                category = "delete-err",
                receipt_handle = %receipt_handle,
                error = %e,
                "Delete failed, message will be redelivered"
            );
        }
    }
}

fn take_batch(pending: &mut Vec<String>, batch_size: usize) -> Vec<String> {
    let n = pending.len().min(batch_size);
    pending.drain(..n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use sqsd_queue::{MemoryQueue, ReceiveRequest};

    const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/work";

    async fn received_handles(queue: &MemoryQueue, n: usize) -> Vec<String> {
        for i in 0..n {
            queue.push(format!("body-{}", i), IndexMap::new());
        }
        let mut handles = Vec::new();
        while handles.len() < n {
            let batch = queue
                .receive(ReceiveRequest {
                    max_messages: 10,
                    wait_time_seconds: 0,
                    visibility_timeout: 300,
                })
                .await
                .unwrap();
            handles.extend(batch.into_iter().map(|m| m.receipt_handle));
        }
        handles
    }

    fn buffer(queue: Arc<MemoryQueue>, batching: bool) -> (AckBuffer, WorkerPool) {
        let workers = WorkerPool::new(4);
        let buffer = AckBuffer::new(
            queue,
            workers.clone(),
            AckSettings {
                batch_size: 3,
                batching,
                flush_interval: Duration::from_secs(2),
            },
        );
        (buffer, workers)
    }

    #[tokio::test]
    async fn test_full_buffer_flushes_immediately() {
        let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
        let handles = received_handles(&queue, 3).await;
        let (buffer, workers) = buffer(queue.clone(), true);

        for handle in handles {
            buffer.enqueue(handle);
        }
        assert_eq!(buffer.pending(), 0);
        workers.wait_idle().await;
        assert_eq!(queue.deleted_ids().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_buffer_waits() {
        let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
        let handles = received_handles(&queue, 2).await;
        let (buffer, workers) = buffer(queue.clone(), true);

        for handle in handles {
            buffer.enqueue(handle);
        }
        workers.wait_idle().await;
        assert_eq!(buffer.pending(), 2);
        assert!(queue.deleted_ids().is_empty());

        buffer.flush().await;
        assert_eq!(buffer.pending(), 0);
        assert_eq!(queue.deleted_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
        let (buffer, _) = buffer(queue.clone(), true);
        buffer.flush().await;
        buffer.flush_all().await;
        assert!(queue.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unbatched_deletes_individually() {
        let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
        let handles = received_handles(&queue, 2).await;
        let (buffer, workers) = buffer(queue.clone(), false);

        for handle in &handles {
            buffer.enqueue(handle.clone());
        }
        // Second acknowledgment of the same handle is harmless.
        buffer.enqueue(handles[0].clone());
        workers.wait_idle().await;
        assert_eq!(buffer.pending(), 0);
        assert_eq!(queue.deleted_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_configuration_caps_batching() {
        let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
        let (buffer, _) = buffer(queue, false);
        buffer.set_batching(true);
        assert!(!buffer.is_batching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_leftovers() {
        let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
        let handles = received_handles(&queue, 1).await;
        let (buffer, _) = buffer(queue.clone(), true);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        buffer.enqueue(handles[0].clone());
        let timer = buffer.start_timer(shutdown_rx);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(queue.deleted_ids().len(), 1);

        shutdown_tx.send(()).unwrap();
        timer.await.unwrap();
    }
}
