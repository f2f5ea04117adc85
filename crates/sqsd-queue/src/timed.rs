//! Per-call timeouts around any [`QueueClient`].

use async_trait::async_trait;
use sqsd_common::ReceivedMessage;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::{BatchDeleteOutcome, OutgoingMessage, QueueClient, QueueError, ReceiveRequest, Result};

/// Bounds every call of the wrapped client.
///
/// Receives are allowed their long-poll wait on top of `call_timeout`. A call
/// that runs out of time fails with [`QueueError::Timeout`].
pub struct TimedQueue {
    inner: Arc<dyn QueueClient>,
    call_timeout: Duration,
}

impl TimedQueue {
    pub fn new(inner: Arc<dyn QueueClient>, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
        }
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    category = "sqs-err",
                    operation,
                    timeout_ms = limit.as_millis() as u64,
                    "Queue call timed out"
                );
                Err(QueueError::Timeout(limit))
            }
        }
    }
}

#[async_trait]
impl QueueClient for TimedQueue {
    fn queue_url(&self) -> &str {
        self.inner.queue_url()
    }

    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        let limit = self.call_timeout + Duration::from_secs(request.wait_time_seconds as u64);
        self.timed("receive", limit, self.inner.receive(request)).await
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.timed("delete", self.call_timeout, self.inner.delete(receipt_handle))
            .await
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<BatchDeleteOutcome> {
        self.timed(
            "delete_batch",
            self.call_timeout,
            self.inner.delete_batch(receipt_handles),
        )
        .await
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.timed(
            "change_visibility",
            self.call_timeout,
            self.inner.change_visibility(receipt_handle, seconds),
        )
        .await
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        self.timed("send", self.call_timeout, self.inner.send(message))
            .await
    }
}
