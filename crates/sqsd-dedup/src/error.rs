use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The conditional create found an existing record. This is the dedup
    /// signal, not a failure.
    #[error("Record already exists")]
    AlreadyExists,

    #[error("Store throughput exceeded: {0}")]
    Throttled(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Dedup table {0} does not exist")]
    TableMissing(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Timeout(_))
    }
}
