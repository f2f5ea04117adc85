//! Idempotency gate for at-least-once delivery.
//!
//! [`DedupStore`] claims a message id through a conditional create against a
//! [`DedupBackend`]. Of N concurrent claims on the same id exactly one sees
//! the create succeed; the others read the existing record and decide from
//! its status and age.

use async_trait::async_trait;

pub mod error;
pub mod memory;
pub mod record;
pub mod store;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use error::StoreError;
pub use memory::MemoryDedupBackend;
pub use record::{DedupKey, DedupRecord, DedupStatus, PARTITION_COUNT};
pub use store::{Claim, DedupSettings, DedupStore, SkipReason};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Keyed record storage with a conditional create.
#[async_trait]
pub trait DedupBackend: Send + Sync {
    /// Create `record` only if no record exists under its key.
    /// Returns [`StoreError::AlreadyExists`] otherwise.
    async fn create(&self, record: &DedupRecord) -> Result<()>;

    async fn get(&self, key: &DedupKey) -> Result<Option<DedupRecord>>;

    /// Unconditional write.
    async fn put(&self, record: &DedupRecord) -> Result<()>;

    /// Remove the record. Removing a missing record succeeds.
    async fn delete(&self, key: &DedupKey) -> Result<()>;
}
