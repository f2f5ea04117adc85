//! Shared building blocks for the sqsd worker daemon.
//!
//! - [`message`]: the received-message model with tagged attribute values
//! - [`counters`]: process-wide atomic counters feeding the poll controller
//! - [`retry`]: bounded retry helper for transient remote errors
//! - [`logging`]: tracing subscriber setup

pub mod counters;
pub mod logging;
pub mod message;
pub mod retry;

pub use counters::{Counter, Counters, CountersSnapshot};
pub use message::{AttributeValue, ReceivedMessage, ScheduledTrigger};
pub use retry::{retry, RetryError, RetryPolicy};

/// Product name reported in the `User-Agent` header.
pub const PRODUCT_NAME: &str = "aws-sqsd";

/// Product version reported in the `User-Agent` header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` value sent with every dispatch.
pub fn user_agent() -> String {
    format!("{}/{}", PRODUCT_NAME, VERSION)
}
