use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] sqsd_queue::QueueError),

    #[error("Dedup store error: {0}")]
    Store(#[from] sqsd_dedup::StoreError),

    #[error("Daemon already started")]
    AlreadyStarted,
}
