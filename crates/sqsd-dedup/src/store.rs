use chrono::Utc;
use sqsd_common::{retry, Counter, Counters, ReceivedMessage, RetryError, RetryPolicy};
use sqsd_queue::Acknowledger;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::{DedupBackend, DedupKey, DedupRecord, DedupStatus, Result, StoreError};

/// Throughput-exceeded retries on the conditional create.
const CREATE_RETRY: RetryPolicy = RetryPolicy::new(11, Duration::from_millis(250));

/// Bookkeeping writes after dispatch: one attempt plus three retries.
const BOOKKEEPING_RETRY: RetryPolicy = RetryPolicy::new(4, Duration::from_millis(250));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another attempt holds a live claim.
    InFlight,
    /// Already processed. The message has been acknowledged.
    Duplicate,
    /// The existing record could not be read. Failing closed.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Proceed,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy)]
pub struct DedupSettings {
    /// A `processing` record older than this is treated as abandoned.
    pub visibility_timeout: Duration,
    /// Record lifetime in the store.
    pub retention: Duration,
    /// Timeout applied to every individual store call.
    pub attempt_timeout: Duration,
}

pub struct DedupStore {
    backend: Arc<dyn DedupBackend>,
    acknowledger: Arc<dyn Acknowledger>,
    counters: Arc<Counters>,
    settings: DedupSettings,
}

impl DedupStore {
    pub fn new(
        backend: Arc<dyn DedupBackend>,
        acknowledger: Arc<dyn Acknowledger>,
        counters: Arc<Counters>,
        settings: DedupSettings,
    ) -> Self {
        Self {
            backend,
            acknowledger,
            counters,
            settings,
        }
    }

    /// Try to take exclusive in-flight ownership of `message`.
    ///
    /// `seen_at` is when this process first saw the message, for log timing.
    pub async fn claim(&self, message: &ReceivedMessage, seen_at: Instant) -> Claim {
        let key = DedupKey::new(&message.id, &message.queue_url);
        let record = DedupRecord::new(
            key.clone(),
            DedupStatus::Processing,
            Utc::now(),
            self.settings.retention,
        );

        let created = self
            .with_retry(CREATE_RETRY, || self.backend.create(&record))
            .await;

        match created {
            Ok(()) => Claim::Proceed,
            Err(RetryError::Permanent(StoreError::AlreadyExists)) => {
                self.resolve_conflict(message, &key, seen_at).await
            }
            Err(e) => {
                // Only a confirmed conflict blocks dispatch.
                warn!(
                    category = "dedup-err",
                    message_id = %message.id,
                    elapsed_ms = seen_at.elapsed().as_millis() as u64,
                    error = %e,
                    "Could not record claim, dispatching anyway"
                );
                Claim::Proceed
            }
        }
    }

    async fn resolve_conflict(&self, message: &ReceivedMessage, key: &DedupKey, seen_at: Instant) -> Claim {
        let elapsed_ms = seen_at.elapsed().as_millis() as u64;
        let existing = self.timed(self.backend.get(key)).await;

        let record = match existing {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(
                    category = "dedup-err",
                    message_id = %message.id,
                    elapsed_ms,
                    "Claim conflicted but no record was found, skipping"
                );
                return Claim::Skip(SkipReason::Ambiguous);
            }
            Err(e) => {
                error!(
                    category = "dedup-err",
                    message_id = %message.id,
                    elapsed_ms,
                    error = %e,
                    "Failed to determine dedup status, skipping"
                );
                return Claim::Skip(SkipReason::Ambiguous);
            }
        };

        let abandoned = record.age_secs(Utc::now()) > self.settings.visibility_timeout.as_secs_f64();
        match record.status {
            DedupStatus::Processing if abandoned => {
                info!(category = "dedup", message_id = %message.id, elapsed_ms, "Earlier attempt abandoned, reprocessing");
                Claim::Proceed
            }
            DedupStatus::Processing => {
                info!(category = "dedup", message_id = %message.id, elapsed_ms, "Message in progress elsewhere, skipping");
                Claim::Skip(SkipReason::InFlight)
            }
            DedupStatus::Processed => {
                info!(category = "dedup", message_id = %message.id, elapsed_ms, "Duplicate message");
                self.counters.increase(Counter::DupCount);
                self.acknowledger
                    .acknowledge(message.receipt_handle.clone())
                    .await;
                Claim::Skip(SkipReason::Duplicate)
            }
        }
    }

    /// Record a successful dispatch. Best effort.
    pub async fn mark_processed(&self, message: &ReceivedMessage) {
        let record = DedupRecord::new(
            DedupKey::new(&message.id, &message.queue_url),
            DedupStatus::Processed,
            Utc::now(),
            self.settings.retention,
        );
        match self
            .with_retry(BOOKKEEPING_RETRY, || self.backend.put(&record))
            .await
        {
            Ok(()) => debug!(message_id = %message.id, "Dedup record marked processed"),
            Err(e) => warn!(
                category = "dedup-err",
                message_id = %message.id,
                error = %e,
                "Giving up on marking message processed"
            ),
        }
    }

    /// Release the claim after a failed dispatch so a redelivery can claim it.
    pub async fn mark_failed(&self, message: &ReceivedMessage) {
        let key = DedupKey::new(&message.id, &message.queue_url);
        match self
            .with_retry(BOOKKEEPING_RETRY, || self.backend.delete(&key))
            .await
        {
            Ok(()) => debug!(message_id = %message.id, "Dedup record released"),
            Err(e) => warn!(
                category = "dedup-err",
                message_id = %message.id,
                error = %e,
                "Giving up on releasing dedup record"
            ),
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        policy: RetryPolicy,
        op: F,
    ) -> std::result::Result<T, RetryError<StoreError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.counters.increase(Counter::ConcurrentDups);
        let result = retry(policy, StoreError::is_transient, || self.timed(op())).await;
        self.counters.decrease(Counter::ConcurrentDups);
        result
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.attempt_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(limit)))
    }
}
