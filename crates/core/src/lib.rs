pub mod config;
pub mod error;
pub mod hash;
pub mod service;
pub mod task;

pub use config::{
    BackendConfig, BackendKind, HttpBackendConfig, LatticeConfig, RunnerConfig, SqsBackendConfig,
};
pub use error::*;
pub use hash::{canonical_json, service_hash, task_hash};
pub use service::*;
pub use task::*;
