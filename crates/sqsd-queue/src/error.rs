use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("AWS SQS error: {0}")]
    Sqs(String),

    #[error("Receipt handle is invalid: {0}")]
    InvalidReceiptHandle(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue call timed out after {0:?}")]
    Timeout(Duration),
}

impl QueueError {
    /// Errors worth another attempt. An invalid handle will never succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Sqs(_) | QueueError::Timeout(_))
    }
}
