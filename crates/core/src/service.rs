//! Service model: one instance of a long-running procedure composed of
//! successive rounds of tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque service identifier, distinct from the service hash index.
pub type ServiceId = String;

/// Service state machine states. COMPLETE and ERROR are terminal;
/// transitions are otherwise monotonic except for re-entering RUNNING
/// between rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Waiting,
    Running,
    Ready,
    Complete,
    Error,
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Complete | ServiceStatus::Error)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Waiting => "WAITING",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Ready => "READY",
            ServiceStatus::Complete => "COMPLETE",
            ServiceStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Persisted view of a service: identification, state, and accumulated
/// output. The live iteration state lives in the owning service object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: ServiceId,
    /// Service-level content address. Independent namespace from task
    /// hashes; never equal to any id.
    pub hash_index: String,
    /// Procedure family, e.g. "grid_exploration".
    pub procedure: String,
    /// Target backend program.
    pub program: String,
    pub status: ServiceStatus,
    /// Accumulated result state, e.g. a grid point -> outcome mapping.
    pub output: Value,
    pub error_message: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(
        procedure: impl Into<String>,
        program: impl Into<String>,
        hash_index: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            hash_index: hash_index.into(),
            procedure: procedure.into(),
            program: program.into(),
            status: ServiceStatus::Waiting,
            output: Value::Null,
            error_message: None,
            created_on: now,
            modified_on: now,
        }
    }
}
