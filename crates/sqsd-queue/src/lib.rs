use async_trait::async_trait;
use indexmap::IndexMap;
use sqsd_common::{AttributeValue, ReceivedMessage};

pub mod error;
pub mod memory;
pub mod timed;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;
pub use memory::MemoryQueue;
pub use timed::TimedQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Parameters for a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Messages to ask for, capped at the queue's per-call limit.
    pub max_messages: usize,
    /// Long-poll wait in seconds.
    pub wait_time_seconds: u32,
    pub visibility_timeout: u64,
}

/// A handle the queue refused to delete in a batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelete {
    pub receipt_handle: String,
    pub code: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDeleteOutcome {
    pub deleted: usize,
    pub failed: Vec<FailedDelete>,
}

/// A message the daemon itself publishes (scheduled-job triggers).
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: String,
    pub attributes: IndexMap<String, AttributeValue>,
}

/// Operations the daemon needs from the durable queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    fn queue_url(&self) -> &str;

    /// Receive up to `max_messages`. Malformed entries are dropped by the
    /// implementation rather than failing the whole call.
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>>;

    /// Delete a single message. Deleting an already deleted message succeeds.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Delete up to ten messages in one call.
    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<BatchDeleteOutcome>;

    /// Reset the visibility window of a received message.
    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Publish a message and return its id.
    async fn send(&self, message: OutgoingMessage) -> Result<String>;
}

/// Sink for acknowledgment tokens.
///
/// Implementations decide whether to delete immediately or buffer. Failures
/// are logged by the implementation; an unacknowledged message is simply
/// redelivered by the queue.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self, receipt_handle: String);
}
