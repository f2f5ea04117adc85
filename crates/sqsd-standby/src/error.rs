use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis operation error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lease already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, StandbyError>;
