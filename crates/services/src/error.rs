//! Service engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A task submission packet was malformed or the submission path
    /// rejected it. The round never starts.
    #[error("submission error: {0}")]
    Submission(String),

    /// One or more required tasks in a round resolved ERROR. Carries the
    /// aggregated failure detail of every erred task.
    #[error("all tasks did not execute successfully: {}", .messages.join("; "))]
    RoundFailure { messages: Vec<String> },

    /// Construction-time validation of a service's initial parameters
    /// failed; the service goes to ERROR without submitting a round.
    #[error("service build error: {0}")]
    ServiceBuild(String),

    /// A convergence criterion was not satisfied within its round cap.
    #[error("convergence failure: {0}")]
    Convergence(String),

    #[error(transparent)]
    Storage(#[from] lattice_storage::StorageError),

    #[error(transparent)]
    Queue(#[from] lattice_queue::QueueError),

    #[error("{0}")]
    Other(String),
}
