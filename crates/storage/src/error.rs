//! Storage error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("backend error: {0}")]
    Backend(String),
}
