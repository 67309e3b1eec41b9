//! Error types shared across taskd crates.

use thiserror::Error;

/// Result alias used throughout taskd.
pub type Result<T> = std::result::Result<T, TaskdError>;

#[derive(Debug, Error)]
pub enum TaskdError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task store could not be read or written.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskdError {
    /// Whether the error means the persistence layer is unreachable or broken.
    pub fn is_store(&self) -> bool {
        matches!(self, TaskdError::Store(_))
    }
}
