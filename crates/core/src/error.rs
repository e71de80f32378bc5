use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for LatticeError {
    fn from(e: serde_json::Error) -> Self {
        LatticeError::Serialize(e.to_string())
    }
}
