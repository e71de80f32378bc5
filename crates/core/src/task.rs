//! Task model: one unit of backend-executed work, content-addressed by
//! its `hash_index`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::hash::task_hash;

/// Opaque task identifier assigned at submission time.
pub type TaskId = String;

/// Lifecycle status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Waiting,
    Running,
    Complete,
    Error,
}

impl TaskStatus {
    /// Whether the task has resolved (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Procedure family a task belongs to. Determines how the submission path
/// validates packets and how raw backend results are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    /// One-shot evaluation of a function at fixed inputs.
    Single,
    /// Iterative refinement starting from a seed structure.
    Optimization,
}

impl std::fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcedureKind::Single => "single",
            ProcedureKind::Optimization => "optimization",
        };
        f.write_str(s)
    }
}

/// Function reference plus the arguments needed to execute the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Content address of this spec for the given program and procedure.
    pub fn hash_index(&self, program: &str, procedure: ProcedureKind) -> String {
        // Serialization of a plain struct cannot fail.
        let spec_value = serde_json::to_value(self).unwrap_or(Value::Null);
        task_hash(program, &procedure.to_string(), &spec_value)
    }
}

/// A stored task: spec plus resolution state. `result` and `error_message`
/// are mutually exclusive and set exactly once, when the task resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub hash_index: String,
    pub spec: TaskSpec,
    pub program: String,
    pub procedure: ProcedureKind,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

impl TaskRecord {
    /// Build a fresh WAITING record. The `hash_index` is fixed here and
    /// never changes afterwards.
    pub fn new(spec: TaskSpec, program: impl Into<String>, procedure: ProcedureKind) -> Self {
        let program = program.into();
        let hash_index = spec.hash_index(&program, procedure);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            hash_index,
            spec,
            program,
            procedure,
            status: TaskStatus::Waiting,
            result: None,
            error_message: None,
            created_on: now,
            modified_on: now,
        }
    }
}
