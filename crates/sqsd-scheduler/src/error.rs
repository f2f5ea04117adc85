use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Failed to read schedule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schedule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Schedule file is empty")]
    Empty,

    #[error("Cannot find 'version' attribute in schedule file")]
    MissingVersion,

    #[error("Unsupported schedule file version '{0}'")]
    UnsupportedVersion(String),

    #[error("Task '{name}' has an invalid url '{url}'")]
    InvalidPath { name: String, url: String },

    #[error("Task '{name}' has an invalid schedule '{expression}': {reason}")]
    InvalidSchedule {
        name: String,
        expression: String,
        reason: String,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] sqsd_queue::QueueError),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
