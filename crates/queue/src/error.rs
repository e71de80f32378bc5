//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("submission error: {0}")]
    Submit(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("provider error: {0}")]
    Provider(String),
}
