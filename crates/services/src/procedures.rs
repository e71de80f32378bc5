//! Procedure-specific submission path.
//!
//! Validates task packets, canonicalizes them into specs, and resolves
//! them through the store's hash dedup. Every packet error in a batch is
//! collected and surfaced together.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use lattice_core::{ProcedureKind, TaskId, TaskSpec};
use lattice_storage::TaskStore;

use crate::error::ServiceError;

/// One task submission packet: the target program plus the spec fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPacket {
    pub program: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskPacket {
    pub fn new(program: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }
}

fn validate(procedure: ProcedureKind, key: &str, packet: &TaskPacket, errors: &mut Vec<String>) {
    if packet.function.trim().is_empty() {
        errors.push(format!("packet '{key}': function must not be empty"));
    }
    if packet.program.trim().is_empty() {
        errors.push(format!("packet '{key}': program must not be empty"));
    }
    if procedure == ProcedureKind::Optimization && !packet.kwargs.contains_key("initial") {
        errors.push(format!("packet '{key}': optimization packets require an 'initial' kwarg"));
    }
}

/// Resolve each packet to a task id through the store's hash dedup,
/// returning the round-local key -> id mapping. Malformed packets abort
/// the whole batch; the round never starts.
pub async fn submit_packets(
    store: &dyn TaskStore,
    procedure: ProcedureKind,
    packets: IndexMap<String, TaskPacket>,
) -> Result<IndexMap<String, TaskId>, ServiceError> {
    let mut errors = Vec::new();
    for (key, packet) in &packets {
        validate(procedure, key, packet, &mut errors);
    }
    if !errors.is_empty() {
        return Err(ServiceError::Submission(errors.join("; ")));
    }

    let mut required = IndexMap::with_capacity(packets.len());
    for (key, packet) in packets {
        let TaskPacket {
            program,
            function,
            args,
            kwargs,
        } = packet;
        let spec = TaskSpec {
            function,
            args,
            kwargs,
        };
        let outcome = store.submit_task(spec, &program, procedure).await?;
        if outcome.duplicate {
            debug!(key = %key, id = %outcome.id, "packet resolved to existing task");
        }
        required.insert(key, outcome.id);
    }
    Ok(required)
}

/// Normalize a raw backend payload for storage, per procedure family.
/// Optimization results always store as an object with a `final` field.
pub fn parse_result(procedure: ProcedureKind, data: Value) -> Value {
    match procedure {
        ProcedureKind::Single => data,
        ProcedureKind::Optimization => match data {
            Value::Object(ref map) if map.contains_key("final") => data,
            other => serde_json::json!({ "final": other }),
        },
    }
}
